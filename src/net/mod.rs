//! Non-blocking transport layer
//!
//! This module provides the socket and reactor substrate the HTTP and
//! WebSocket protocol handlers run on:
//!
//! - `StreamSocket` buffers input and output for one TCP (or TLS) connection
//! - `ProtocolHandler` is the callback surface a protocol implements
//! - `SocketPoll` is a single-threaded `poll(2)` loop owning the sockets
//! - `connect`/`async_connect` start non-blocking outbound connections
//!
//! Everything here is built on `Rc` and `RefCell`, so a socket, its handler
//! and its poll are confined to the thread that created them.

pub mod connect;
pub mod poll;
pub mod socket;
pub mod tls;

pub use connect::{async_connect, connect, AsyncConnectResult, ConnectCallback};
pub use poll::SocketPoll;
pub use socket::{ProtocolHandler, SocketDisposition, StreamSocket};
pub use tls::{TlsConfig, TlsError, TlsVersion, VerifyOutcome};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Socket is not connected")]
    NotConnected,
}

/// Default port for plain HTTP
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default port for HTTP over TLS
pub const DEFAULT_HTTPS_PORT: u16 = 443;
