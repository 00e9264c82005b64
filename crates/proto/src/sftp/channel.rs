//! Secure channel abstraction.
//!
//! The client core assumes a reliable, already-authenticated duplex byte
//! stream. Key exchange, ciphers, and authentication belong to whatever
//! implements [`ChannelProvider`]; this module only defines the seam and a
//! plain-TCP provider for development and loopback testing.

use super::session::SessionConfig;
use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A duplex byte stream to the remote peer.
///
/// Exclusively owned by one session; all writes go through the request
/// multiplexer, never around it.
pub type DuplexChannel = Box<dyn ChannelStream>;

/// Marker trait for streams usable as a session channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

/// Supplies authenticated duplex channels given connection parameters.
#[async_trait::async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Opens a channel to the host named in `config`.
    ///
    /// Implementations perform whatever handshake and authentication their
    /// transport requires and return the resulting byte stream. Failures
    /// surface as [`SkiffError::Connection`].
    async fn open(&self, config: &SessionConfig) -> SkiffResult<DuplexChannel>;
}

/// Channel provider backed by a plain TCP connection.
///
/// Carries no encryption or authentication; suitable only for loopback
/// testing or transports secured externally.
#[derive(Debug, Default)]
pub struct TcpChannelProvider;

impl TcpChannelProvider {
    /// Creates a new TCP channel provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ChannelProvider for TcpChannelProvider {
    async fn open(&self, config: &SessionConfig) -> SkiffResult<DuplexChannel> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Opening TCP channel to {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| SkiffError::Connection(format!("connect to {} failed: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        Ok(Box::new(stream))
    }
}
