//! Connection factory trait.
//!
//! The pool never embeds driver-specific connect or disconnect logic. A
//! caller supplies a [`ConnectionFactory`] wrapping their driver (MySQL,
//! MongoDB, an in-memory fake, ...) and the pool treats the connections it
//! produces as opaque handles.

use async_trait::async_trait;

/// Creates, destroys, and optionally probes the raw connections managed by
/// a [`Pool`](crate::Pool).
///
/// # Example
///
/// ```rust,ignore
/// struct TcpFactory {
///     addr: SocketAddr,
/// }
///
/// #[async_trait]
/// impl ConnectionFactory for TcpFactory {
///     type Connection = TcpStream;
///     type Error = std::io::Error;
///
///     async fn create(&self) -> Result<TcpStream, std::io::Error> {
///         TcpStream::connect(self.addr).await
///     }
///
///     async fn destroy(&self, conn: TcpStream) -> Result<(), std::io::Error> {
///         drop(conn);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The raw connection type handed out on loan.
    type Connection: Send + 'static;

    /// Error produced when creating, destroying, or probing a connection.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection.
    ///
    /// Called outside the pool's state lock, so slow establishment never
    /// blocks unrelated pool operations.
    async fn create(&self) -> Result<Self::Connection, Self::Error>;

    /// Tear down a connection that has left the pool.
    ///
    /// Failures are logged by the pool; the connection's slot is reclaimed
    /// either way.
    async fn destroy(&self, conn: Self::Connection) -> Result<(), Self::Error>;

    /// Lightweight liveness check for an idle connection (e.g. a ping).
    ///
    /// Only invoked by the health task when
    /// [`validate_on_health_check`](crate::PoolConfig::validate_on_health_check)
    /// is enabled. A connection that returns an error is destroyed instead
    /// of recycled. The default implementation accepts every connection.
    async fn probe(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let _ = conn;
        Ok(())
    }
}
