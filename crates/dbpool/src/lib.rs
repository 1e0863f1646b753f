//! # dbpool
//!
//! Driver-agnostic async connection pool with lifecycle management.
//!
//! The pool never talks to a database itself: callers inject a
//! [`ConnectionFactory`] that creates and destroys raw connections, and the
//! pool handles everything around it: bounded capacity, warm reuse,
//! FIFO-fair waiting under exhaustion, acquisition timeouts, idle eviction,
//! and minimum-floor maintenance.
//!
//! ## Features
//!
//! - Configurable min/max pool sizes with eager cold start
//! - Strict FIFO fairness: released connections go to the longest-waiting
//!   caller first, bypassing the idle registry
//! - Acquisition timeouts with exactly-once resolution under races
//! - Background health task: idle eviction, optional liveness probing,
//!   automatic top-up to the minimum floor
//! - Graceful shutdown with a bounded drain period
//! - Comprehensive metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use dbpool::{Pool, PoolConfig};
//!
//! // `MyFactory` implements `ConnectionFactory` around a database driver.
//! let pool = Pool::builder(MyFactory::connect_to("db.example.com"))
//!     .min_connections(5)
//!     .max_connections(20)
//!     .acquire_timeout(Duration::from_secs(5))
//!     .idle_timeout(Duration::from_secs(300))
//!     .build()
//!     .await?;
//!
//! // Get a connection from the pool.
//! let conn = pool.get().await?;
//! // Use the connection...
//! // Automatically returned to the pool on drop.
//!
//! // Check pool status.
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//!
//! // Shut down, draining outstanding loans.
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod pool;

mod waiters;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::PoolError;

// Factory trait
pub use factory::ConnectionFactory;

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Lifecycle management
pub use lifecycle::{ConnectionMetadata, HealthCheckReport};
