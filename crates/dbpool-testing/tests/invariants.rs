//! Property-based invariant checks.
//!
//! Runs random sequences of acquire/release/invalidate/health-pass
//! operations against pools of varying geometry and asserts the structural
//! invariants after every step: the pool never exceeds its capacity bound,
//! and the active set always matches the guards actually held.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use dbpool::{Pool, PoolConfig, PoolError};
use dbpool_testing::MockFactory;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Release(usize),
    Invalidate(usize),
    HealthPass,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Acquire),
        2 => any::<usize>().prop_map(Op::Release),
        1 => any::<usize>().prop_map(Op::Invalidate),
        1 => Just(Op::HealthPass),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_random_op_sequences_preserve_invariants(
        ops in proptest::collection::vec(op_strategy(), 1..60),
        min in 0u32..3,
        extra in 1u32..6,
    ) {
        let max = min + extra;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async move {
            let factory = MockFactory::new();
            let config = PoolConfig::new()
                .min_connections(min)
                .max_connections(max)
                .acquire_timeout(Duration::from_millis(10));
            let pool = Pool::new(factory.clone(), config).await.unwrap();
            let mut held = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => match pool.get().await {
                        Ok(conn) => held.push(conn),
                        Err(PoolError::AcquireTimeout { .. }) => {}
                        Err(e) => panic!("unexpected acquire failure: {e}"),
                    },
                    Op::Release(index) => {
                        if !held.is_empty() {
                            let index = index % held.len();
                            drop(held.swap_remove(index));
                        }
                    }
                    Op::Invalidate(index) => {
                        if !held.is_empty() {
                            let index = index % held.len();
                            let mut conn = held.swap_remove(index);
                            conn.invalidate();
                            drop(conn);
                        }
                    }
                    Op::HealthPass => {
                        pool.health_check().await;
                    }
                }

                let status = pool.status();
                assert!(
                    status.total <= status.max,
                    "capacity invariant violated: {status:?}"
                );
                assert_eq!(
                    status.in_use as usize,
                    held.len(),
                    "active set out of sync with held guards: {status:?}"
                );
            }

            drop(held);
            pool.close().await;
            dbpool_testing::wait_for(|| factory.live() == 0).await;
        });
    }
}
