//! Session management.
//!
//! Owns the connection lifecycle (connect handshake, ready state, teardown)
//! and normalizes channel- and protocol-level failures into the stable
//! error set in `skiff_platform`.

use super::channel::{ChannelProvider, DuplexChannel};
use super::message::{self, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use super::mux::{RequestMultiplexer, DEFAULT_MAX_INFLIGHT};
use super::transfer::DEFAULT_CHUNK_SIZE;
use super::types::StatusCode;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection attempt yet
    Idle,
    /// Channel and handshake in progress
    Connecting,
    /// Connected and accepting requests
    Ready,
    /// Teardown in progress
    Closing,
    /// Torn down; terminal
    Closed,
    /// Channel lost underneath a ready session
    Failed,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Timeout for the channel provider to produce a channel.
    pub connect_timeout: Duration,
    /// Timeout for the Init/Version exchange.
    pub handshake_timeout: Duration,
    /// Maximum requests in flight on this session.
    pub max_inflight: usize,
    /// Default chunk size for transfers started through this session.
    pub chunk_size: usize,
}

impl SessionConfig {
    /// Creates a configuration for `host` with default settings.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the remote port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the in-flight request cap.
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    /// Sets the default transfer chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// One logical connection to a remote peer.
///
/// Exclusive owner of its channel; every request goes through the session's
/// multiplexer. Created by [`Session::connect`], destroyed by
/// [`Session::end`] or a fatal channel error.
pub struct Session {
    state: SessionState,
    mux: Option<Arc<RequestMultiplexer>>,
    config: SessionConfig,
}

impl Session {
    /// Connects: obtains a channel from `provider`, performs the
    /// Init/Version handshake, and starts the request multiplexer.
    ///
    /// Fails with [`SkiffError::Connection`] if the provider cannot produce
    /// a channel within the connect timeout or the handshake does not
    /// complete within the handshake timeout.
    pub async fn connect(
        provider: &dyn ChannelProvider,
        config: SessionConfig,
    ) -> SkiffResult<Self> {
        info!("Connecting to {}:{}", config.host, config.port);
        debug!("Session state: {:?} -> {:?}", SessionState::Idle, SessionState::Connecting);

        let channel = timeout(config.connect_timeout, provider.open(&config))
            .await
            .map_err(|_| {
                SkiffError::Connection(format!(
                    "connect to {}:{} timed out after {:?}",
                    config.host, config.port, config.connect_timeout
                ))
            })??;

        let channel = timeout(config.handshake_timeout, handshake(channel))
            .await
            .map_err(|_| SkiffError::Connection("handshake timed out".to_string()))??;

        let mux = RequestMultiplexer::start(channel, config.max_inflight);

        info!("Session ready ({}:{})", config.host, config.port);
        Ok(Self {
            state: SessionState::Ready,
            mux: Some(Arc::new(mux)),
            config,
        })
    }

    /// Returns the current session state.
    ///
    /// A session whose channel died underneath it reports
    /// [`SessionState::Failed`].
    pub fn state(&self) -> SessionState {
        if self.state == SessionState::Ready {
            if let Some(mux) = &self.mux {
                if mux.is_closed() {
                    return SessionState::Failed;
                }
            }
        }
        self.state
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the multiplexer, or [`SkiffError::SessionClosed`] if the
    /// session is not ready.
    pub fn mux(&self) -> SkiffResult<&Arc<RequestMultiplexer>> {
        match self.state {
            SessionState::Ready => self.mux.as_ref().ok_or(SkiffError::SessionClosed),
            _ => Err(SkiffError::SessionClosed),
        }
    }

    /// Tears the session down, failing every pending request and in-flight
    /// transfer with [`SkiffError::SessionClosed`].
    ///
    /// Idempotent: ending an already-closed session is a no-op.
    pub async fn end(&mut self) -> SkiffResult<()> {
        if self.state == SessionState::Closed {
            debug!("end() on a closed session is a no-op");
            return Ok(());
        }

        debug!("Session state: {:?} -> {:?}", self.state, SessionState::Closing);
        self.state = SessionState::Closing;

        if let Some(mux) = self.mux.take() {
            mux.shutdown();
        }

        self.state = SessionState::Closed;
        info!("Session closed ({}:{})", self.config.host, self.config.port);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.take() {
            mux.shutdown();
        }
    }
}

/// Init/Version exchange, run directly on the channel before concurrent
/// routing starts.
async fn handshake(mut channel: DuplexChannel) -> SkiffResult<DuplexChannel> {
    channel.write_all(&message::encode_init()).await?;
    channel.flush().await?;

    let mut length_bytes = [0u8; 4];
    channel.read_exact(&mut length_bytes).await?;
    let frame_length = u32::from_be_bytes(length_bytes) as usize;
    if frame_length == 0 || frame_length > MAX_FRAME_SIZE {
        return Err(SkiffError::Connection(format!(
            "invalid handshake frame length {}",
            frame_length
        )));
    }

    let mut body = vec![0u8; frame_length];
    channel.read_exact(&mut body).await?;

    let server_version = message::decode_version(&body)
        .map_err(|e| SkiffError::Connection(format!("handshake failed: {}", e)))?;
    if server_version > PROTOCOL_VERSION {
        return Err(SkiffError::Connection(format!(
            "server negotiated unsupported version {}",
            server_version
        )));
    }

    info!("Handshake complete (server version: {})", server_version);
    Ok(channel)
}

/// Maps a protocol status into the stable error set, tagged with the
/// originating operation and remote path.
///
/// A non-empty server message is preserved verbatim; otherwise the
/// canonical text for the code is used.
pub fn normalize_status(op: &str, path: &str, code: StatusCode, server_msg: &str) -> SkiffError {
    let message = if server_msg.is_empty() {
        code.message().to_string()
    } else {
        server_msg.to_string()
    };

    match code {
        StatusCode::NoConnection | StatusCode::ConnectionLost => SkiffError::Connection(message),
        StatusCode::BadMessage => SkiffError::Protocol(message),
        _ => SkiffError::Transfer {
            op: op.to_string(),
            path: path.to_string(),
            message,
        },
    }
}
