//! Non-blocking outbound connections

use super::poll::SocketPoll;
use super::socket::{ProtocolHandler, StreamSocket};
use super::tls::TlsConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::rc::Rc;
use tracing::{debug, error};

/// Outcome of an asynchronous connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncConnectResult {
    Ok,
    SocketError,
    ConnectionError,
    HostNameError,
    SslHandshakeFailure,
    MissingSsl,
}

impl AsyncConnectResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncConnectResult::Ok => "Ok",
            AsyncConnectResult::SocketError => "SocketError",
            AsyncConnectResult::ConnectionError => "ConnectionError",
            AsyncConnectResult::HostNameError => "HostNameError",
            AsyncConnectResult::SslHandshakeFailure => "SslHandshakeFailure",
            AsyncConnectResult::MissingSsl => "MissingSsl",
        }
    }
}

impl std::fmt::Display for AsyncConnectResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion callback of `async_connect`: the connected socket on success.
pub type ConnectCallback = Box<dyn FnOnce(Option<Rc<StreamSocket>>, AsyncConnectResult)>;

fn resolve(host: &str, port: u16) -> Result<SocketAddr, AsyncConnectResult> {
    // Name resolution blocks the calling thread.
    match (host, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().ok_or(AsyncConnectResult::HostNameError),
        Err(e) => {
            error!(host, port, error = %e, "failed to resolve host");
            Err(AsyncConnectResult::HostNameError)
        }
    }
}

fn start_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// Start a non-blocking connect to `host:port`.
///
/// The returned socket is still connecting; `handler.on_connect` runs once
/// the poll it is inserted into sees it complete. With `tls` set, the TLS
/// handshake starts right after the TCP connection is up.
pub fn connect(
    host: &str,
    port: u16,
    tls: Option<&TlsConfig>,
    handler: Rc<dyn ProtocolHandler>,
) -> Result<Rc<StreamSocket>, AsyncConnectResult> {
    let addr = resolve(host, port)?;

    let ssl = match tls {
        Some(config) => match config.ssl_for(host) {
            Ok(ssl) => Some(ssl),
            Err(e) => {
                error!(host, error = %e, "failed to create SSL session");
                return Err(AsyncConnectResult::MissingSsl);
            }
        },
        None => None,
    };

    let stream = start_connect(addr).map_err(|e| {
        error!(host, port, error = %e, "failed to connect");
        AsyncConnectResult::ConnectionError
    })?;

    debug!(host, port, %addr, secure = ssl.is_some(), "connecting");
    Ok(StreamSocket::connecting(stream, host.to_string(), handler, ssl))
}

/// Connect and register the socket with `poll`.
///
/// `on_complete` always runs from inside `poll.poll()`, never from this
/// call, so callers may hold borrows across it. Returns the connecting
/// socket, so the caller can abandon the attempt; `None` if it failed
/// before a socket existed.
pub fn async_connect(
    host: &str,
    port: u16,
    tls: Option<&TlsConfig>,
    handler: Rc<dyn ProtocolHandler>,
    poll: &SocketPoll,
    on_complete: ConnectCallback,
) -> Option<Rc<StreamSocket>> {
    match connect(host, port, tls, handler) {
        Ok(socket) => {
            socket.set_connect_callback(on_complete);
            poll.insert_new_socket(socket.clone());
            Some(socket)
        }
        Err(result) => {
            poll.add_callback(move || on_complete(None, result));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(
            resolve("no-such-host.invalid", 80),
            Err(AsyncConnectResult::HostNameError)
        );
    }

    #[test]
    fn test_result_display() {
        assert_eq!(AsyncConnectResult::Ok.to_string(), "Ok");
        assert_eq!(
            AsyncConnectResult::SslHandshakeFailure.to_string(),
            "SslHandshakeFailure"
        );
    }
}
