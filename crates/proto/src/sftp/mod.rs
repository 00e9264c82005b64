//! SFTP-style file-transfer protocol client.
//!
//! # Architecture
//!
//! The client is layered:
//!
//! 1. **Channel seam** ([`channel`]) - authenticated duplex byte stream,
//!    supplied by a [`ChannelProvider`] collaborator
//! 2. **Codec** ([`message`], [`types`]) - length-prefixed frames with
//!    correlation ids
//! 3. **Multiplexer** ([`mux`]) - numbered requests, out-of-order response
//!    routing, in-flight backpressure
//! 4. **Transfer engine** ([`transfer`]) - chunked put/get with progress
//!    reporting
//! 5. **Session and client APIs** ([`session`], [`client`]) - lifecycle and
//!    the public operation surface
//!
//! The transport underneath the channel (key exchange, ciphers,
//! authentication) is deliberately out of scope; the session trusts the
//! provider to hand it an already-secured stream.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::sftp::{Request, decode_request};
//!
//! // Encode a request frame, then parse it back
//! let request = Request::Stat { path: "/srv/data".to_string() };
//! let frame = request.encode(1);
//!
//! let (id, _parsed) = decode_request(&frame[4..]).unwrap();
//! assert_eq!(id, 1);
//! ```

pub mod channel;
pub mod client;
pub mod message;
pub mod mux;
pub mod session;
pub mod transfer;
pub mod types;

// Re-export main types
pub use channel::{ChannelProvider, ChannelStream, DuplexChannel, TcpChannelProvider};
pub use client::SftpClient;
pub use message::{
    decode_request, decode_response, decode_version, encode_init, encode_version, MessageType,
    Request, Response, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use mux::{PendingReply, RequestMultiplexer, DEFAULT_MAX_INFLIGHT};
pub use session::{normalize_status, Session, SessionConfig, SessionState};
pub use transfer::{
    GetOutcome, GetTarget, PutSource, StepCallback, TransferOptions, DEFAULT_CHUNK_SIZE,
    MAX_CHUNK_SIZE,
};
pub use types::{AttrFlags, DirEntry, FileAttributes, FileMode, FileOpenFlags, StatusCode};
