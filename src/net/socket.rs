//! Buffered non-blocking stream socket
//!
//! A `StreamSocket` owns one TCP connection (optionally wrapped in TLS), an
//! input and an output buffer, and the `ProtocolHandler` that interprets
//! the bytes. The owning `SocketPoll` drives it: it asks the handler which
//! events to wait for, reads into the input buffer, lets the handler
//! consume what it can, and flushes whatever the handler queued.

use super::connect::{AsyncConnectResult, ConnectCallback};
use super::tls::VerifyOutcome;
use crate::http::{Request, ServerResponse};
use bytes::{Buf, BytesMut};
use openssl::ssl::{HandshakeError, MidHandshakeSslStream, Ssl, SslStream};
use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Size of the stack buffer used for each read
const READ_CHUNK: usize = 16 * 1024;

/// Upper bound of bytes read from the kernel in one readiness pass
const MAX_READ_PER_POLL: usize = 1024 * 1024;

/// How much a handler may queue per `perform_writes` call
pub const WRITE_CAPACITY: usize = 64 * 1024;

/// Protocol callbacks invoked by the poll loop
///
/// All methods are called on the thread that owns the poll. Implementors
/// keep their state in `Cell`/`RefCell` since they are shared through
/// `Rc<dyn ProtocolHandler>`.
pub trait ProtocolHandler {
    /// The socket is connected and ready to carry traffic.
    fn on_connect(&self, socket: &Rc<StreamSocket>);

    /// Poll events (`libc::POLLIN`/`POLLOUT`) this handler wants. May lower
    /// `timeout_max` to be woken up for its own timers.
    fn get_poll_events(&self, now: Instant, timeout_max: &mut Duration) -> i16;

    /// New data is in the socket's input buffer.
    fn handle_incoming_message(&self, disposition: &mut SocketDisposition);

    /// The socket is writable; queue up to `capacity` bytes.
    fn perform_writes(&self, capacity: usize);

    /// Called once per poll iteration. Returns true if the handler timed out
    /// and tore the connection down.
    fn check_timeout(&self, _now: Instant) -> bool {
        false
    }

    /// The connection is gone. Called at most once per socket.
    fn on_disconnect(&self);

    /// The TLS handshake failed; the verify result is available from the
    /// socket until it is dropped.
    fn on_handshake_fail(&self) {}
}

/// Outcome of one `handle_incoming_message` call
#[derive(Debug)]
pub struct SocketDisposition {
    socket: Rc<StreamSocket>,
    closed: bool,
}

impl SocketDisposition {
    pub fn new(socket: Rc<StreamSocket>) -> Self {
        SocketDisposition {
            socket,
            closed: false,
        }
    }

    pub fn socket(&self) -> &Rc<StreamSocket> {
        &self.socket
    }

    /// Ask the poll to close and release the socket.
    pub fn set_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

enum Transport {
    Tcp(TcpStream),
    Handshaking(MidHandshakeSslStream<TcpStream>),
    Tls(SslStream<TcpStream>),
    Closed,
}

impl Transport {
    fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Transport::Tcp(stream) => Some(stream),
            Transport::Handshaking(mid) => Some(mid.get_ref()),
            Transport::Tls(stream) => Some(stream.get_ref()),
            Transport::Closed => None,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
            Transport::Handshaking(_) => Err(io::ErrorKind::WouldBlock.into()),
            Transport::Closed => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
            Transport::Handshaking(_) => Err(io::ErrorKind::WouldBlock.into()),
            Transport::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

/// A buffered, non-blocking stream socket
pub struct StreamSocket {
    fd: RawFd,
    host: String,
    transport: RefCell<Transport>,
    pending_ssl: RefCell<Option<Ssl>>,
    in_buffer: RefCell<BytesMut>,
    out_buffer: RefCell<BytesMut>,
    handler: RefCell<Option<Rc<dyn ProtocolHandler>>>,
    on_connect_complete: RefCell<Option<ConnectCallback>>,
    connecting: Cell<bool>,
    closed: Cell<bool>,
    disconnect_notified: Cell<bool>,
    shutdown_signalled: Cell<bool>,
    write_shut: Cell<bool>,
    input_ignored: Cell<bool>,
    websocket: Cell<bool>,
    verify: RefCell<VerifyOutcome>,
    bytes_sent: Cell<u64>,
    bytes_recv: Cell<u64>,
}

impl StreamSocket {
    fn new(stream: TcpStream, host: String, handler: Option<Rc<dyn ProtocolHandler>>) -> Self {
        StreamSocket {
            fd: stream.as_raw_fd(),
            host,
            transport: RefCell::new(Transport::Tcp(stream)),
            pending_ssl: RefCell::new(None),
            in_buffer: RefCell::new(BytesMut::with_capacity(READ_CHUNK)),
            out_buffer: RefCell::new(BytesMut::new()),
            handler: RefCell::new(handler),
            on_connect_complete: RefCell::new(None),
            connecting: Cell::new(false),
            closed: Cell::new(false),
            disconnect_notified: Cell::new(false),
            shutdown_signalled: Cell::new(false),
            write_shut: Cell::new(false),
            input_ignored: Cell::new(false),
            websocket: Cell::new(false),
            verify: RefCell::new(VerifyOutcome::default()),
            bytes_sent: Cell::new(0),
            bytes_recv: Cell::new(0),
        }
    }

    /// Wrap an already connected stream, e.g. one returned by
    /// `TcpListener::accept`, and notify the handler.
    pub fn create(
        stream: TcpStream,
        host: impl Into<String>,
        handler: Rc<dyn ProtocolHandler>,
    ) -> io::Result<Rc<Self>> {
        stream.set_nonblocking(true)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let socket = Rc::new(Self::new(stream, host.into(), Some(handler.clone())));
        handler.on_connect(&socket);
        Ok(socket)
    }

    /// A socket whose non-blocking connect is still in flight. The handler
    /// is told about the connection once it completes.
    pub(crate) fn connecting(
        stream: TcpStream,
        host: String,
        handler: Rc<dyn ProtocolHandler>,
        ssl: Option<Ssl>,
    ) -> Rc<Self> {
        let socket = Self::new(stream, host, Some(handler));
        socket.connecting.set(true);
        *socket.pending_ssl.borrow_mut() = ssl;
        Rc::new(socket)
    }

    pub(crate) fn set_connect_callback(&self, callback: ConnectCallback) {
        *self.on_connect_complete.borrow_mut() = Some(callback);
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Host name this socket was created for (used for logging and SNI)
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_open(&self) -> bool {
        !self.closed.get()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.get()
    }

    pub fn is_secure(&self) -> bool {
        matches!(
            *self.transport.borrow(),
            Transport::Tls(_) | Transport::Handshaking(_)
        ) || self.pending_ssl.borrow().is_some()
    }

    fn is_handshaking(&self) -> bool {
        matches!(*self.transport.borrow(), Transport::Handshaking(_))
    }

    /// The handler currently attached to this socket
    pub fn handler(&self) -> Option<Rc<dyn ProtocolHandler>> {
        self.handler.borrow().clone()
    }

    /// Replace the protocol handler, e.g. after a WebSocket upgrade.
    pub fn set_handler(&self, handler: Rc<dyn ProtocolHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// Detach the handler; it will receive no further callbacks.
    pub fn detach_handler(&self) -> Option<Rc<dyn ProtocolHandler>> {
        self.handler.borrow_mut().take()
    }

    /// Buffered input not yet consumed by the handler.
    ///
    /// The borrow must be released before calling back into the socket.
    pub fn in_buffer(&self) -> RefMut<'_, BytesMut> {
        self.in_buffer.borrow_mut()
    }

    /// Output queued for the next write.
    pub fn out_buffer(&self) -> RefMut<'_, BytesMut> {
        self.out_buffer.borrow_mut()
    }

    pub fn erase_first_input_bytes(&self, count: usize) {
        let mut input = self.in_buffer.borrow_mut();
        let count = count.min(input.len());
        input.advance(count);
    }

    /// Queue `data` and optionally try to write it out right away.
    pub fn send(&self, data: &[u8], flush: bool) -> io::Result<()> {
        self.out_buffer.borrow_mut().extend_from_slice(data);
        if flush {
            self.write_outgoing_data()?;
        }
        Ok(())
    }

    /// Serialize as much of `request` as `capacity` allows into the output
    /// buffer.
    pub fn send_request(&self, request: &mut Request, capacity: usize) -> crate::http::Result<()> {
        let mut out = self.out_buffer.borrow_mut();
        request.write_data(&mut out, capacity)
    }

    /// Queue a complete response and try to flush it.
    pub fn send_response(&self, response: &ServerResponse) -> io::Result<()> {
        response.write_data(&mut self.out_buffer.borrow_mut());
        self.write_outgoing_data()
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket.get()
    }

    /// Mark the connection as carrying WebSocket frames from now on.
    pub fn set_websocket(&self) {
        self.websocket.set(true);
    }

    /// Discard all buffered and future input.
    pub fn ignore_input(&self) {
        self.input_ignored.set(true);
        self.in_buffer.borrow_mut().clear();
    }

    pub fn is_input_ignored(&self) -> bool {
        self.input_ignored.get()
    }

    /// Half-close once the output buffer is drained. Input is still read
    /// until the peer closes its side.
    pub fn async_shutdown(&self) {
        trace!(fd = self.fd, "async shutdown requested");
        self.shutdown_signalled.set(true);
        if !self.connecting.get() && self.out_buffer.borrow().is_empty() {
            self.half_close();
        }
    }

    /// Close the connection now; the poll reaps the socket on its next pass.
    pub fn shutdown_connection(&self) {
        if self.closed.replace(true) {
            return;
        }
        debug!(fd = self.fd, host = %self.host, "shutting down connection");
        if let Some(stream) = self.transport.borrow().tcp() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                trace!(fd = self.fd, error = %e, "shutdown failed");
            }
        }
    }

    fn half_close(&self) {
        if self.write_shut.replace(true) {
            return;
        }
        let mut transport = self.transport.borrow_mut();
        if let Transport::Tls(stream) = &mut *transport {
            if let Err(e) = stream.shutdown() {
                trace!(fd = self.fd, error = %e, "TLS close_notify failed");
            }
        }
        if let Some(stream) = transport.tcp() {
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                trace!(fd = self.fd, error = %e, "half-close failed");
            }
        }
    }

    /// Bytes sent and received over the lifetime of the socket
    pub fn io_stats(&self) -> (u64, u64) {
        (self.bytes_sent.get(), self.bytes_recv.get())
    }

    /// Verify result of the TLS handshake. Plain sockets report success.
    pub fn ssl_verify_result(&self) -> VerifyOutcome {
        self.verify.borrow().clone()
    }

    /// Read everything the kernel has for us into the input buffer.
    ///
    /// Returns `Ok(false)` once the peer closed its side.
    pub fn read_incoming_data(&self) -> io::Result<bool> {
        let mut buf = [0u8; READ_CHUNK];
        let mut total = 0;
        while total < MAX_READ_PER_POLL {
            let result = self.transport.borrow_mut().read(&mut buf);
            match result {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    total += n;
                    self.bytes_recv.set(self.bytes_recv.get() + n as u64);
                    if !self.input_ignored.get() {
                        self.in_buffer.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        trace!(fd = self.fd, bytes = total, "read incoming data");
        Ok(true)
    }

    /// Write as much of the output buffer as the kernel accepts.
    pub fn write_outgoing_data(&self) -> io::Result<()> {
        if self.connecting.get() || self.is_handshaking() || self.closed.get() {
            return Ok(());
        }

        let mut out = self.out_buffer.borrow_mut();
        while !out.is_empty() {
            let result = self.transport.borrow_mut().write(&out);
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    out.advance(n);
                    self.bytes_sent.set(self.bytes_sent.get() + n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        drop(out);

        if self.shutdown_signalled.get() {
            self.half_close();
        }
        Ok(())
    }

    /// Events to poll this socket for; zero once it is closed.
    pub(crate) fn poll_events(&self, now: Instant, timeout_max: &mut Duration) -> i16 {
        if self.closed.get() {
            return 0;
        }
        if self.connecting.get() {
            return libc::POLLOUT;
        }
        if self.is_handshaking() {
            return libc::POLLIN | libc::POLLOUT;
        }

        let mut events = match self.handler() {
            Some(handler) => handler.get_poll_events(now, timeout_max),
            None => libc::POLLIN,
        };
        if !self.out_buffer.borrow().is_empty() {
            events |= libc::POLLOUT;
        }
        events
    }

    /// Process the readiness reported by `poll(2)`.
    pub(crate) fn handle_poll(self: &Rc<Self>, revents: i16) {
        if self.closed.get() {
            return;
        }

        if self.connecting.get() {
            if revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
                self.complete_connect();
            }
            return;
        }

        if self.is_handshaking() {
            if revents != 0 {
                self.continue_handshake();
            }
            if self.is_handshaking() || self.closed.get() {
                return;
            }
        }

        let mut closed = revents & (libc::POLLERR | libc::POLLNVAL) != 0;
        if !closed && revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            match self.read_incoming_data() {
                Ok(true) => {}
                Ok(false) => {
                    debug!(fd = self.fd, "peer closed the connection");
                    closed = true;
                }
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "read failed");
                    closed = true;
                }
            }
        }

        self.dispatch_input();

        if !closed && !self.closed.get() {
            if revents & libc::POLLOUT != 0 {
                if let Some(handler) = self.handler() {
                    let capacity = WRITE_CAPACITY.saturating_sub(self.out_buffer.borrow().len());
                    handler.perform_writes(capacity);
                }
            }
            if let Err(e) = self.write_outgoing_data() {
                debug!(fd = self.fd, error = %e, "write failed");
                closed = true;
            }
        }

        if closed {
            self.closed.set(true);
        }
    }

    fn dispatch_input(self: &Rc<Self>) {
        loop {
            if self.closed.get() || self.input_ignored.get() || self.in_buffer.borrow().is_empty() {
                return;
            }
            let Some(handler) = self.handler() else {
                return;
            };

            let mut disposition = SocketDisposition::new(self.clone());
            handler.handle_incoming_message(&mut disposition);
            if disposition.is_closed() {
                self.closed.set(true);
                return;
            }

            // A handler that replaced itself hands the rest of the buffer to
            // its successor.
            match self.handler() {
                Some(next) if !same_handler(&next, &handler) => continue,
                _ => return,
            }
        }
    }

    fn complete_connect(self: &Rc<Self>) {
        let error = match &*self.transport.borrow() {
            Transport::Tcp(stream) => match stream.take_error() {
                Ok(None) => stream.peer_addr().err(),
                Ok(Some(e)) | Err(e) => Some(e),
            },
            _ => None,
        };

        self.connecting.set(false);
        let callback = self.on_connect_complete.borrow_mut().take();

        if let Some(e) = error {
            warn!(fd = self.fd, host = %self.host, error = %e, "asynchronous connect failed");
            self.closed.set(true);
            // Never connected, so the handler has nothing to tear down.
            self.disconnect_notified.set(true);
            if let Some(callback) = callback {
                callback(None, AsyncConnectResult::ConnectionError);
            }
            return;
        }

        debug!(fd = self.fd, host = %self.host, "connected");
        if let Some(handler) = self.handler() {
            handler.on_connect(self);
        }
        if let Some(callback) = callback {
            callback(Some(self.clone()), AsyncConnectResult::Ok);
        }

        let ssl = self.pending_ssl.borrow_mut().take();
        if let Some(ssl) = ssl {
            self.start_handshake(ssl);
        }
    }

    fn start_handshake(&self, ssl: Ssl) {
        let transport = self.transport.replace(Transport::Closed);
        match transport {
            Transport::Tcp(stream) => {
                trace!(fd = self.fd, "starting TLS handshake");
                self.finish_handshake(ssl.connect(stream));
            }
            other => {
                self.transport.replace(other);
            }
        }
    }

    fn continue_handshake(&self) {
        let transport = self.transport.replace(Transport::Closed);
        match transport {
            Transport::Handshaking(mid) => self.finish_handshake(mid.handshake()),
            other => {
                self.transport.replace(other);
            }
        }
    }

    fn finish_handshake(
        &self,
        result: std::result::Result<SslStream<TcpStream>, HandshakeError<TcpStream>>,
    ) {
        match result {
            Ok(stream) => {
                *self.verify.borrow_mut() = VerifyOutcome::from_result(stream.ssl().verify_result());
                debug!(fd = self.fd, host = %self.host, "TLS handshake complete");
                self.transport.replace(Transport::Tls(stream));
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                self.transport.replace(Transport::Handshaking(mid));
            }
            Err(HandshakeError::Failure(mid)) => {
                let outcome = VerifyOutcome::from_result(mid.ssl().verify_result());
                error!(
                    fd = self.fd,
                    host = %self.host,
                    verify = %outcome.message,
                    error = %mid.error(),
                    "TLS handshake failed"
                );
                *self.verify.borrow_mut() = outcome;
                self.transport.replace(Transport::Handshaking(mid));
                self.fail_handshake();
            }
            Err(HandshakeError::SetupFailure(e)) => {
                error!(fd = self.fd, host = %self.host, error = %e, "TLS setup failed");
                self.fail_handshake();
            }
        }
    }

    fn fail_handshake(&self) {
        self.closed.set(true);
        if let Some(handler) = self.handler() {
            handler.on_handshake_fail();
        }
    }

    /// Tell the handler the connection is gone, once.
    pub(crate) fn notify_disconnect(&self) {
        if self.disconnect_notified.replace(true) {
            return;
        }
        self.closed.set(true);
        if let Some(handler) = self.handler() {
            handler.on_disconnect();
        }
    }
}

fn same_handler(a: &Rc<dyn ProtocolHandler>, b: &Rc<dyn ProtocolHandler>) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a) as *const (),
        Rc::as_ptr(b) as *const (),
    )
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("fd", &self.fd)
            .field("host", &self.host)
            .field("connecting", &self.connecting.get())
            .field("closed", &self.closed.get())
            .field("websocket", &self.websocket.get())
            .field("in_len", &self.in_buffer.borrow().len())
            .field("out_len", &self.out_buffer.borrow().len())
            .field("sent", &self.bytes_sent.get())
            .field("recv", &self.bytes_recv.get())
            .finish()
    }
}

/// Connected loopback pair: a socket wrapping one end, and the raw peer.
#[cfg(test)]
pub(crate) fn test_pair(handler: Rc<dyn ProtocolHandler>) -> (Rc<StreamSocket>, TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    let socket = StreamSocket::create(server, "127.0.0.1", handler).unwrap();
    (socket, client)
}
