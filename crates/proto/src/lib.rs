//! Async file-transfer client for the Skiff ecosystem.
//!
//! This crate implements the client side of an SFTP-style remote
//! file-transfer protocol: a stateful session over an authenticated duplex
//! channel, a correlation-id request multiplexer, and a chunked put/get
//! transfer engine.
//!
//! The secure channel itself is a collaborator: anything implementing
//! [`sftp::ChannelProvider`] (an SSH subsystem channel, a TLS stream, an
//! in-memory pipe in tests) can carry a session.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::sftp::Request;
//!
//! // Requests and responses are correlated by id on the wire
//! let frame = Request::Stat { path: "/etc/motd".to_string() }.encode(7);
//! let (id, _request) = skiff_proto::sftp::decode_request(&frame[4..]).unwrap();
//! assert_eq!(id, 7);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod sftp;
