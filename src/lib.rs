//! coolnet - HTTP/1.1 and WebSocket protocol engine
//!
//! Incremental, non-blocking HTTP/1.1 client and server plumbing and an
//! RFC 6455 WebSocket implementation on top of a single-threaded poll
//! reactor.
//!
//! - [`net`]: sockets, the poll loop, asynchronous connect and client TLS
//! - [`http`]: headers, requests, responses and client sessions
//! - [`ws`]: WebSocket framing and the upgraded-connection handler
//! - [`logging`]: tracing subscriber setup

pub mod http;
pub mod logging;
pub mod net;
pub mod ws;
