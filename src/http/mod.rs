//! HTTP/1.1 protocol engine
//!
//! This module provides incremental HTTP/1.1 message handling on top of the
//! non-blocking transport in [`crate::net`]. Nothing here blocks on a
//! socket: parsers consume whatever bytes have arrived and report how far
//! they got, and writers append to an output buffer.
//!
//! # Architecture
//!
//! - `Header` and `StatusLine` are the shared value types
//! - `Request` builds outbound requests, `RequestParser` parses inbound ones
//! - `Response` parses inbound responses, `ServerResponse` builds outbound ones
//! - `Session` drives request/response pairs over one reusable connection
//! - `RequestHandler` serves requests on accepted sockets
//!
//! # Examples
//!
//! ```no_run
//! use coolnet::http::{Request, Session};
//!
//! let session = Session::create_http("127.0.0.1", 8080);
//! let response = session.sync_request(Request::new("/hello"));
//! let response = response.borrow();
//! if response.done() {
//!     println!("{}", response.status_line().status_code());
//! }
//! ```

pub mod body;
pub mod chunked;
pub mod header;
pub mod request;
pub mod response;
pub mod server;
pub mod session;
pub mod status;

pub use body::{IoReadFunc, IoWriteFunc};
pub use header::{ConnectionToken, Header, HeaderState};
pub use request::{Request, RequestCommon, RequestParser, Stage};
pub use response::{Response, ResponseState, ServerResponse};
pub use server::RequestHandler;
pub use session::{Protocol, Session, SharedResponse};
pub use status::{status_category, FieldParseState, StatusCode, StatusCodeClass, StatusLine};

use chrono::Utc;
use std::time::Duration;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// CRLF line ending
pub const CRLF: &str = "\r\n";

pub const VERB_GET: &str = "GET";
pub const VERB_HEAD: &str = "HEAD";
pub const VERB_POST: &str = "POST";
pub const VERB_PUT: &str = "PUT";

pub const VERS_1_0: &str = "HTTP/1.0";
pub const VERS_1_1: &str = "HTTP/1.1";

/// `User-Agent` sent with every client request
pub const AGENT_STRING: &str = concat!("coolnet HTTP Agent ", env!("CARGO_PKG_VERSION"));

/// `Server` header of every server response
pub const SERVER_STRING: &str = concat!("coolnet HTTP Server ", env!("CARGO_PKG_VERSION"));

/// Current time in the RFC 7231 `Date` header format
pub fn http_time_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Find CRLF in buffer
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Synchronous GET of `url`, with the given timeout.
///
/// The connection is closed again once the response is in.
pub fn get(url: &str, timeout: Duration) -> Result<SharedResponse> {
    let parsed = url::Url::parse(url)
        .map_err(|e| crate::net::Error::InvalidUri(format!("{}: {}", url, e)))?;
    let session = Session::from_uri(url)?;

    let mut target = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }

    let response = session.sync_request_with_timeout(Request::new(target), timeout);
    session.async_shutdown();
    Ok(response)
}
