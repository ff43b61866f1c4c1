//! WebSocket protocol handler
//!
//! One `WebSocketHandler` drives one upgraded connection. As a server it
//! is installed by [`WebSocketHandler::upgrade`] from inside an HTTP
//! request callback; as a client it connects and performs the handshake
//! itself through [`WebSocketHandler::ws_request`]. Complete messages are
//! handed to a [`MessageHandler`].

use super::frame::{self, apply_mask, FIN};
use super::handshake::{compute_accept, generate_key};
use super::{
    CloseCode, Error, OpCode, Result, INITIAL_PING_DELAY, MAX_CONTROL_PAYLOAD, MAX_MESSAGE_SIZE, PING_FREQUENCY,
    WS_VERSION,
};
use crate::http::server::send_error_and_shutdown;
use crate::http::{ConnectionToken, Request, RequestParser, Response, ServerResponse, StatusCode};
use crate::net::{self, ProtocolHandler, SocketDisposition, SocketPoll, StreamSocket, TlsConfig};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Receives the messages of a WebSocket connection
pub trait MessageHandler: Sized + 'static {
    /// A complete message (all fragments joined). Errors are logged and
    /// otherwise ignored.
    fn handle_message(
        &self,
        ws: &WebSocketHandler<Self>,
        data: &[u8],
    ) -> std::result::Result<(), Box<dyn std::error::Error>>;

    /// A Ping or Pong arrived; `ping_time_us` is the time since our last
    /// ping.
    fn got_ping(&self, _opcode: OpCode, _ping_time_us: i64) {}

    /// The connection is gone.
    fn on_disconnect(&self) {}
}

/// Protocol handler for an upgraded WebSocket connection
pub struct WebSocketHandler<H: MessageHandler> {
    this: Weak<WebSocketHandler<H>>,
    key: String,
    socket: RefCell<Weak<StreamSocket>>,
    payload: RefCell<Vec<u8>>,
    last_ping_sent: Cell<Instant>,
    ping_time_us: Cell<i64>,
    is_client: bool,
    is_masking: bool,
    in_fragment_block: Cell<bool>,
    last_flags: Cell<u8>,
    shutting_down: Cell<bool>,
    upgrade_response: RefCell<Option<Response>>,
    handler: H,
}

impl<H: MessageHandler> WebSocketHandler<H> {
    /// A handler for either end of a connection. Only clients mask, and
    /// only when `is_masking` is set.
    pub fn new(is_client: bool, is_masking: bool, handler: H) -> Rc<Self> {
        let now = Instant::now();
        let first_ping = now
            .checked_sub(PING_FREQUENCY.saturating_sub(INITIAL_PING_DELAY))
            .unwrap_or(now);
        Rc::new_cyclic(|this| WebSocketHandler {
            this: this.clone(),
            key: if is_client { generate_key() } else { String::new() },
            socket: RefCell::new(Weak::new()),
            payload: RefCell::new(Vec::new()),
            last_ping_sent: Cell::new(first_ping),
            ping_time_us: Cell::new(0),
            is_client,
            is_masking: is_client && is_masking,
            in_fragment_block: Cell::new(false),
            last_flags: Cell::new(0),
            shutting_down: Cell::new(false),
            upgrade_response: RefCell::new(None),
            handler,
        })
    }

    /// Answer the upgrade `request` received on `socket` and take the socket
    /// over.
    ///
    /// `allowed_origin` sees the request's `Origin` header. A bad request
    /// is answered with 400, a refused origin with 403; both close the
    /// connection and return an error.
    pub fn upgrade<F>(
        socket: &Rc<StreamSocket>,
        request: &RequestParser,
        allowed_origin: F,
        handler: H,
    ) -> Result<Rc<Self>>
    where
        F: Fn(Option<&str>) -> bool,
    {
        let version = request.get("Sec-WebSocket-Version").unwrap_or(WS_VERSION).trim();
        let key = request.get("Sec-WebSocket-Key").unwrap_or("").trim();
        let protocol = request.get("Sec-WebSocket-Protocol").unwrap_or("chat");
        info!(fd = socket.fd(), version, key, protocol, "websocket upgrade requested");

        if version != WS_VERSION || key.is_empty() {
            error!(fd = socket.fd(), version, "rejecting websocket upgrade with bad version or key");
            send_error_and_shutdown(socket, StatusCode::BAD_REQUEST);
            return Err(Error::Handshake(format!("version {:?}, key {:?}", version, key)));
        }
        if !allowed_origin(request.get("Origin")) {
            error!(fd = socket.fd(), origin = ?request.get("Origin"), "rejecting websocket upgrade due to disallowed origin");
            send_error_and_shutdown(socket, StatusCode::FORBIDDEN);
            return Err(Error::Handshake("origin not allowed".to_string()));
        }

        let mut response = ServerResponse::new(StatusCode::SWITCHING_PROTOCOLS);
        response.set("Upgrade", "websocket");
        response.set_connection_token(ConnectionToken::Upgrade);
        response.set("Sec-WebSocket-Accept", compute_accept(key));
        if request.has("Sec-WebSocket-Protocol") {
            response.set("Sec-WebSocket-Protocol", protocol);
        }
        trace!(fd = socket.fd(), header = %response.header(), "sending upgrade response");

        let ws = Self::new(false, false, handler);
        *ws.socket.borrow_mut() = Rc::downgrade(socket);
        socket.send_response(&response)?;
        socket.set_handler(ws.clone());
        ws.set_web_socket(socket);
        Ok(ws)
    }

    /// Connect to `host:port` and send the upgrade `request`; the socket
    /// joins `poll`. Returns false if no connection could be started.
    pub fn ws_request(
        self: &Rc<Self>,
        mut request: Request,
        host: &str,
        port: u16,
        tls: Option<&TlsConfig>,
        poll: &SocketPoll,
    ) -> bool {
        let host_and_port = format!("{}:{}", host, port);
        trace!(host = %host_and_port, "websocket request");

        let handler: Rc<dyn ProtocolHandler> = self.clone();
        let socket = match net::connect(host, port, tls, handler) {
            Ok(socket) => socket,
            Err(result) => {
                error!(host = %host_and_port, %result, "failed to connect");
                return false;
            }
        };
        *self.socket.borrow_mut() = Rc::downgrade(&socket);
        *self.upgrade_response.borrow_mut() = Some(Response::new());

        let scheme = if tls.is_some() { "https" } else { "http" };
        request.set("Host", host_and_port.as_str());
        request.set("Origin", format!("{}://{}", scheme, host_and_port));
        request.set_connection_token(ConnectionToken::Upgrade);
        request.set("Upgrade", "websocket");
        request.set("Sec-WebSocket-Version", WS_VERSION);
        request.set("Sec-WebSocket-Key", self.key.as_str());

        if let Err(e) = socket.send_request(&mut request, usize::MAX) {
            error!(host = %host_and_port, error = %e, "failed to make websocket request");
            return false;
        }
        debug!(fd = socket.fd(), host = %host_and_port, "sent websocket upgrade request");
        poll.insert_new_socket(socket);
        true
    }

    /// The message handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// The nonce sent in `Sec-WebSocket-Key`; empty for servers.
    pub fn web_socket_key(&self) -> &str {
        &self.key
    }

    /// First header byte of the last frame received
    pub fn last_flags(&self) -> u8 {
        self.last_flags.get()
    }

    /// Round trip of the last ping, or time since our last ping when the
    /// peer pinged us
    pub fn ping_time_us(&self) -> i64 {
        self.ping_time_us.get()
    }

    pub fn is_connected(&self) -> bool {
        self.socket().map_or(false, |socket| socket.is_open())
    }

    /// Bytes sent and received on the connection
    pub fn io_stats(&self) -> (u64, u64) {
        self.socket().map_or((0, 0), |socket| socket.io_stats())
    }

    fn socket(&self) -> Option<Rc<StreamSocket>> {
        self.socket.borrow().upgrade()
    }

    /// Queue one unfragmented message.
    ///
    /// Returns the bytes queued including the frame header.
    pub fn send_message(&self, data: &[u8], opcode: OpCode, flush: bool) -> Result<usize> {
        let socket = self.socket().ok_or(Error::SocketClosed)?;
        self.send_frame(&socket, data, FIN | opcode.as_u8(), flush)
    }

    pub fn send_text_message(&self, text: &str, flush: bool) -> Result<usize> {
        self.send_message(text.as_bytes(), OpCode::Text, flush)
    }

    pub fn send_binary_message(&self, data: &[u8], flush: bool) -> Result<usize> {
        self.send_message(data, OpCode::Binary, flush)
    }

    /// Try to write out everything queued.
    pub fn flush(&self) -> Result<()> {
        if let Some(socket) = self.socket() {
            socket.write_outgoing_data()?;
        }
        Ok(())
    }

    fn send_frame(&self, socket: &StreamSocket, data: &[u8], flags: u8, flush: bool) -> Result<usize> {
        if !socket.is_open() {
            debug!(fd = socket.fd(), "socket is not open, cannot send frame");
            return Err(Error::SocketClosed);
        }

        let mask = self.is_masking.then(rand::random::<[u8; 4]>);
        let size = frame::encode_frame(&mut socket.out_buffer(), flags, data, mask);
        trace!(fd = socket.fd(), opcode = flags & 0x0f, len = data.len(), size, "queued frame");

        if flush || self.shutting_down.get() {
            socket.write_outgoing_data()?;
        }
        Ok(size)
    }

    /// Send a Ping. Pings before the upgrade completed are skipped.
    pub fn send_ping(&self, now: Instant) -> Result<usize> {
        if self.is_client {
            debug!("clients should not send pings, only servers");
        }
        self.send_ping_or_pong(now, &[], OpCode::Ping)
    }

    fn send_pong(&self, now: Instant, data: &[u8]) -> Result<usize> {
        if !self.is_client {
            trace!("server answering a ping");
        }
        self.send_ping_or_pong(now, data, OpCode::Pong)
    }

    fn send_ping_or_pong(&self, now: Instant, data: &[u8], opcode: OpCode) -> Result<usize> {
        let socket = self.socket().ok_or(Error::SocketClosed)?;
        if !socket.is_websocket() {
            warn!(fd = socket.fd(), "attempted ping on non-upgraded websocket");
            self.last_ping_sent.set(now);
            return Ok(0);
        }
        trace!(fd = socket.fd(), ?opcode, "sending");
        let size = self.send_frame(&socket, data, FIN | opcode.as_u8(), false)?;
        self.last_ping_sent.set(now);
        Ok(size)
    }

    /// Send a Close frame, at most once per connection.
    pub fn send_close_frame(&self, code: CloseCode, message: &str) {
        let Some(socket) = self.socket() else {
            error!("no socket to send close frame to");
            return;
        };
        if !socket.is_open() {
            debug!(fd = socket.fd(), "socket is not open, cannot send close frame");
            return;
        }
        if self.shutting_down.replace(true) {
            return;
        }

        let code = if code.is_reserved() {
            debug!(fd = socket.fd(), %code, "reserved close code, sending normal close instead");
            CloseCode::NORMAL_CLOSE
        } else {
            code
        };
        debug!(fd = socket.fd(), %code, message, "sending close frame");
        let mut payload = Vec::with_capacity(2 + message.len());
        payload.extend_from_slice(&code.as_u16().to_be_bytes());
        payload.extend_from_slice(message.as_bytes());
        if let Err(e) = self.send_frame(&socket, &payload, FIN | OpCode::Close.as_u8(), true) {
            debug!(fd = socket.fd(), error = %e, "failed to send close frame");
        }
    }

    /// Start the closing handshake. The connection closes once the peer
    /// echoes the Close frame or hangs up.
    pub fn shutdown(&self, code: CloseCode, message: &str) {
        self.shutdown_impl(code, message, false, false);
    }

    /// Send a Close frame and close without waiting for the peer.
    pub fn shutdown_after_writing(&self) {
        self.shutdown_impl(CloseCode::NORMAL_CLOSE, "", true, false);
    }

    /// Close without a Close frame.
    pub fn shutdown_silent(&self) {
        self.shutdown_impl(CloseCode::POLICY_VIOLATION, "", true, true);
    }

    fn shutdown_impl(&self, code: CloseCode, message: &str, hard: bool, silent: bool) {
        if let Some(socket) = self.socket() {
            let silent = silent || self.shutting_down.get();
            trace!(fd = socket.fd(), silent, hard, "closing connection");
            if !silent {
                self.send_close_frame(code, message);
            }
            socket.async_shutdown();
            if hard {
                socket.ignore_input();
                socket.shutdown_connection();
            }
        }

        self.payload.borrow_mut().clear();
        self.in_fragment_block.set(false);
    }

    /// Fail the connection after a protocol violation.
    fn fail(&self, reason: &str) {
        self.fail_with(CloseCode::PROTOCOL_ERROR, reason);
    }

    fn fail_with(&self, code: CloseCode, reason: &str) {
        error!(fd = ?self.socket().map(|socket| socket.fd()), %code, reason, "failing websocket connection");
        self.shutdown_impl(code, reason, true, false);
    }

    fn set_web_socket(&self, socket: &StreamSocket) {
        socket.set_websocket();
        // Upgrading is not a reason to ping right away.
        self.last_ping_sent.set(Instant::now());
    }

    fn handle_client_upgrade(&self, socket: &Rc<StreamSocket>) {
        let mut slot = self.upgrade_response.borrow_mut();
        let response = slot.get_or_insert_with(Response::new);

        let result = {
            let input = socket.in_buffer();
            let result = response.read_data(&input);
            result
        };
        match result {
            Ok(consumed) => socket.erase_first_input_bytes(consumed),
            Err(e) => {
                error!(fd = socket.fd(), error = %e, "invalid websocket upgrade response, disconnecting");
                *slot = None;
                socket.ignore_input();
                socket.shutdown_connection();
                return;
            }
        }
        if !response.done() {
            trace!(fd = socket.fd(), "upgrade response still incomplete");
            return;
        }

        let accepted = response.status_code() == StatusCode::SWITCHING_PROTOCOLS.as_u16()
            && response
                .get("Upgrade")
                .map_or(false, |upgrade| upgrade.eq_ignore_ascii_case("websocket"))
            && response.header().connection_token() == ConnectionToken::Upgrade
            && response.get("Sec-WebSocket-Accept") == Some(compute_accept(&self.key).as_str());
        *slot = None;
        drop(slot);

        if accepted {
            debug!(fd = socket.fd(), "websocket upgrade accepted");
            self.set_web_socket(socket);
        } else {
            error!(fd = socket.fd(), "server returned invalid accept token during handshake, disconnecting");
            socket.ignore_input();
            socket.shutdown_connection();
        }
    }

    /// Consume one frame from the input buffer. Returns false when no
    /// complete frame is buffered or the connection is failing.
    fn handle_frame(&self, socket: &Rc<StreamSocket>) -> bool {
        let (header, mut payload) = {
            let input = socket.in_buffer();
            let header = match frame::decode_header(&input) {
                Ok(Some(header)) => header,
                Ok(None) => return false,
                Err(e) => {
                    drop(input);
                    self.fail(&e.to_string());
                    return false;
                }
            };
            // Control frames are never part of the message being reassembled.
            let buffered = if header.opcode & 0x8 == 0 {
                self.payload.borrow().len() as u64
            } else {
                0
            };
            if header.payload_len.saturating_add(buffered) > MAX_MESSAGE_SIZE as u64 {
                drop(input);
                self.fail_with(CloseCode::PAYLOAD_TOO_BIG, "message too big");
                return false;
            }
            let available = (input.len() - header.header_len) as u64;
            if available < header.payload_len {
                trace!(
                    fd = socket.fd(),
                    have = input.len(),
                    need = header.frame_len(),
                    "incomplete websocket frame"
                );
                return false;
            }
            let end = header.header_len + header.payload_len as usize;
            (header, input[header.header_len..end].to_vec())
        };
        socket.erase_first_input_bytes(header.header_len + payload.len());
        self.last_flags.set(header.flags);

        if let Some(mask) = header.mask {
            if self.is_client {
                self.fail("servers must not send masked frames");
                return false;
            }
            apply_mask(&mut payload, mask);
        }

        trace!(
            fd = socket.fd(),
            opcode = header.opcode,
            fin = header.fin,
            masked = header.mask.is_some(),
            len = payload.len(),
            residual = socket.in_buffer().len(),
            "incoming websocket frame"
        );

        let Some(opcode) = OpCode::from_u8(header.opcode) else {
            self.fail("reserved opcode");
            return false;
        };

        if opcode.is_control() {
            return self.handle_control_frame(opcode, header.fin, &payload);
        }

        if self.in_fragment_block.get() {
            if opcode != OpCode::Continuation {
                self.fail("expected a continuation frame");
                return false;
            }
        } else if opcode == OpCode::Continuation {
            self.fail("continuation frame without a message");
            return false;
        }

        if self.shutting_down.get() {
            trace!(fd = socket.fd(), "dropping data frame while closing");
            self.in_fragment_block.set(!header.fin);
            return true;
        }

        self.payload.borrow_mut().extend_from_slice(&payload);
        if !header.fin {
            self.in_fragment_block.set(true);
            return true;
        }

        self.in_fragment_block.set(false);
        let message = std::mem::take(&mut *self.payload.borrow_mut());
        self.dispatch_message(&message);
        true
    }

    fn handle_control_frame(&self, opcode: OpCode, fin: bool, payload: &[u8]) -> bool {
        if !fin {
            self.fail("control frames must not be fragmented");
            return false;
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            self.fail("control frame payload too long");
            return false;
        }

        match opcode {
            OpCode::Pong => {
                if self.is_client {
                    warn!("servers should not send pongs, only clients");
                }
                let ping_time_us = self.elapsed_since_ping(Instant::now());
                self.ping_time_us.set(ping_time_us);
                trace!(ping_time_us, "pong received");
                self.notify_ping(opcode, ping_time_us);
            }
            OpCode::Ping => {
                if !self.is_client {
                    debug!("clients should not send pings, only servers");
                }
                let now = Instant::now();
                let ping_time_us = self.elapsed_since_ping(now);
                self.ping_time_us.set(ping_time_us);
                if let Err(e) = self.send_pong(now, payload) {
                    debug!(error = %e, "failed to send pong");
                }
                self.notify_ping(opcode, ping_time_us);
            }
            OpCode::Close => {
                if self.shutting_down.get() {
                    debug!("closing handshake complete");
                    self.shutdown_silent();
                    return false;
                }
                if payload.len() == 1 {
                    self.fail("close frame with a truncated status code");
                    return false;
                }

                let (code, message) = if payload.len() >= 2 {
                    (
                        CloseCode(u16::from_be_bytes([payload[0], payload[1]])),
                        String::from_utf8_lossy(&payload[2..]).into_owned(),
                    )
                } else {
                    (CloseCode::NORMAL_CLOSE, String::new())
                };
                if code.is_reserved() {
                    self.fail("close frame with a reserved status code");
                    return false;
                }
                debug!(%code, message = %message, "peer initiated close");
                self.shutdown_impl(code, &message, true, false);
                return false;
            }
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {}
        }
        true
    }

    fn elapsed_since_ping(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.last_ping_sent.get())
            .as_micros()
            .min(i64::MAX as u128) as i64
    }

    fn notify_ping(&self, opcode: OpCode, ping_time_us: i64) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.handler.got_ping(opcode, ping_time_us))).is_err() {
            error!("ping callback panicked");
        }
    }

    fn dispatch_message(&self, message: &[u8]) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle_message(self, message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(len = message.len(), error = %e, "error during handle_message"),
            Err(_) => error!(len = message.len(), "handle_message panicked"),
        }
    }
}

impl<H: MessageHandler> ProtocolHandler for WebSocketHandler<H> {
    fn on_connect(&self, socket: &Rc<StreamSocket>) {
        debug!(fd = socket.fd(), host = socket.host(), "websocket connected");
        *self.socket.borrow_mut() = Rc::downgrade(socket);
    }

    fn get_poll_events(&self, now: Instant, timeout_max: &mut Duration) -> i16 {
        if !self.is_client {
            let since_ping = now.saturating_duration_since(self.last_ping_sent.get());
            *timeout_max = (*timeout_max).min(PING_FREQUENCY.saturating_sub(since_ping));
        }
        libc::POLLIN
    }

    fn handle_incoming_message(&self, disposition: &mut SocketDisposition) {
        let socket = disposition.socket().clone();
        if self.socket().is_none() {
            *self.socket.borrow_mut() = Rc::downgrade(&socket);
        }

        if self.is_client && !socket.is_websocket() {
            self.handle_client_upgrade(&socket);
            if !socket.is_websocket() {
                return;
            }
        }

        // Several frames may be buffered.
        while socket.is_open() && !socket.is_input_ignored() && self.handle_frame(&socket) {}
    }

    fn perform_writes(&self, _capacity: usize) {}

    fn check_timeout(&self, now: Instant) -> bool {
        if self.is_client {
            return false;
        }
        if now.saturating_duration_since(self.last_ping_sent.get()) >= PING_FREQUENCY {
            if let Err(e) = self.send_ping(now) {
                debug!(error = %e, "failed to send ping");
            }
        }
        false
    }

    fn on_disconnect(&self) {
        debug!(fd = ?self.socket().map(|socket| socket.fd()), "websocket disconnected");
        if panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_disconnect())).is_err() {
            error!("disconnect callback panicked");
        }
    }

    fn on_handshake_fail(&self) {
        error!(fd = ?self.socket().map(|socket| socket.fd()), "TLS handshake failed for websocket");
    }
}

impl<H: MessageHandler> fmt::Debug for WebSocketHandler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketHandler")
            .field("is_client", &self.is_client)
            .field("is_masking", &self.is_masking)
            .field("shutting_down", &self.shutting_down.get())
            .field("in_fragment_block", &self.in_fragment_block.get())
            .field("ping_time_us", &self.ping_time_us.get())
            .field("pending", &self.payload.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::tests::NullHandler;
    use crate::net::socket::test_pair;
    use bytes::BytesMut;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[derive(Default)]
    struct Recorder {
        messages: RefCell<Vec<Vec<u8>>>,
        pings: RefCell<Vec<OpCode>>,
        reject_next: Cell<bool>,
        disconnected: Cell<bool>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(
            &self,
            ws: &WebSocketHandler<Self>,
            data: &[u8],
        ) -> std::result::Result<(), Box<dyn std::error::Error>> {
            if self.reject_next.replace(false) {
                return Err("rejected".into());
            }
            self.messages.borrow_mut().push(data.to_vec());
            ws.send_text_message(&String::from_utf8_lossy(data), true)?;
            Ok(())
        }

        fn got_ping(&self, opcode: OpCode, _ping_time_us: i64) {
            self.pings.borrow_mut().push(opcode);
        }

        fn on_disconnect(&self) {
            self.disconnected.set(true);
        }
    }

    const CLIENT_MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn server() -> (Rc<WebSocketHandler<Recorder>>, Rc<StreamSocket>, TcpStream) {
        let ws = WebSocketHandler::new(false, false, Recorder::default());
        let (socket, peer) = test_pair(ws.clone());
        ws.set_web_socket(&socket);
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (ws, socket, peer)
    }

    fn send_frame(peer: &mut TcpStream, flags: u8, payload: &[u8], mask: Option<[u8; 4]>) {
        let mut out = BytesMut::new();
        frame::encode_frame(&mut out, flags, payload, mask);
        peer.write_all(&out).unwrap();
    }

    fn read_frame(peer: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            if let Some(header) = frame::decode_header(&data).unwrap() {
                let end = header.frame_len() as usize;
                if data.len() >= end {
                    return (header.flags, data[header.header_len..end].to_vec());
                }
            }
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
            data.extend_from_slice(&buf[..n]);
        }
    }

    fn pump(socket: &Rc<StreamSocket>, until: impl Fn() -> bool) {
        for _ in 0..200 {
            socket.handle_poll(libc::POLLIN | libc::POLLOUT);
            if until() || !socket.is_open() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn close_code(payload: &[u8]) -> u16 {
        u16::from_be_bytes([payload[0], payload[1]])
    }

    #[test]
    fn test_fragmented_message_reassembled() {
        let (ws, socket, mut peer) = server();
        send_frame(&mut peer, OpCode::Text.as_u8(), b"Hel", Some(CLIENT_MASK));
        send_frame(&mut peer, FIN | OpCode::Continuation.as_u8(), b"lo", Some(CLIENT_MASK));
        pump(&socket, || !ws.handler().messages.borrow().is_empty());

        assert_eq!(*ws.handler().messages.borrow(), vec![b"Hello".to_vec()]);
        assert_eq!(ws.last_flags(), FIN | OpCode::Continuation.as_u8());

        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Text.as_u8());
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn test_handler_error_is_contained() {
        let (ws, socket, mut peer) = server();
        ws.handler().reject_next.set(true);
        send_frame(&mut peer, FIN | OpCode::Text.as_u8(), b"first", Some(CLIENT_MASK));
        send_frame(&mut peer, FIN | OpCode::Text.as_u8(), b"second", Some(CLIENT_MASK));
        pump(&socket, || !ws.handler().messages.borrow().is_empty());

        assert_eq!(*ws.handler().messages.borrow(), vec![b"second".to_vec()]);
        assert!(socket.is_open());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (ws, socket, mut peer) = server();
        send_frame(&mut peer, FIN | OpCode::Ping.as_u8(), b"beat", Some(CLIENT_MASK));
        pump(&socket, || !ws.handler().pings.borrow().is_empty());

        assert_eq!(*ws.handler().pings.borrow(), vec![OpCode::Ping]);
        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Pong.as_u8());
        assert_eq!(payload, b"beat");
    }

    #[test]
    fn test_server_pings_when_due() {
        let (ws, _socket, mut peer) = server();
        assert!(!ws.check_timeout(Instant::now()));
        assert!(!ws.check_timeout(Instant::now() + PING_FREQUENCY));
        // The ping is queued unflushed.
        ws.flush().unwrap();

        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Ping.as_u8());
        assert!(payload.is_empty());

        let mut timeout_max = Duration::from_secs(60);
        ws.get_poll_events(Instant::now(), &mut timeout_max);
        assert!(timeout_max <= PING_FREQUENCY);
    }

    #[test]
    fn test_peer_close_is_echoed() {
        let (ws, socket, mut peer) = server();
        let mut payload = CloseCode::ENDPOINT_GOING_AWAY.as_u16().to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        send_frame(&mut peer, FIN | OpCode::Close.as_u8(), &payload, Some(CLIENT_MASK));
        pump(&socket, || false);

        assert!(!socket.is_open());
        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Close.as_u8());
        assert_eq!(close_code(&payload), 1001);
        assert_eq!(&payload[2..], b"bye");

        socket.notify_disconnect();
        assert!(ws.handler().disconnected.get());
    }

    #[test]
    fn test_graceful_shutdown_waits_for_echo() {
        let (ws, socket, mut peer) = server();
        ws.shutdown(CloseCode::NORMAL_CLOSE, "done");
        assert!(socket.is_open());

        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Close.as_u8());
        assert_eq!(close_code(&payload), 1000);
        assert_eq!(&payload[2..], b"done");

        // Data after our close is dropped, the echo finishes the close.
        send_frame(&mut peer, FIN | OpCode::Text.as_u8(), b"late", Some(CLIENT_MASK));
        send_frame(&mut peer, FIN | OpCode::Close.as_u8(), &payload[..2], Some(CLIENT_MASK));
        pump(&socket, || false);

        assert!(!socket.is_open());
        assert!(ws.handler().messages.borrow().is_empty());

        // Only one close frame is ever sent.
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap_or_default();
        assert!(rest.is_empty());
    }

    fn assert_protocol_error(flags: u8, payload: &[u8]) {
        let (_ws, socket, mut peer) = server();
        send_frame(&mut peer, flags, payload, Some(CLIENT_MASK));
        pump(&socket, || false);

        assert!(!socket.is_open());
        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Close.as_u8());
        assert_eq!(close_code(&payload), CloseCode::PROTOCOL_ERROR.as_u16());
    }

    #[test]
    fn test_protocol_violations() {
        // Fragmented control frame
        assert_protocol_error(OpCode::Ping.as_u8(), b"");
        // Oversized control frame
        assert_protocol_error(FIN | OpCode::Ping.as_u8(), &[0u8; MAX_CONTROL_PAYLOAD + 1]);
        // Continuation without a message
        assert_protocol_error(FIN | OpCode::Continuation.as_u8(), b"x");
        // Reserved opcode
        assert_protocol_error(FIN | 0x3, b"x");
        // Close with a one byte payload
        assert_protocol_error(FIN | OpCode::Close.as_u8(), &[0x03]);
        // Fragmented close and pong
        assert_protocol_error(OpCode::Close.as_u8(), &[0x03, 0xe8]);
        assert_protocol_error(OpCode::Pong.as_u8(), b"beat");
        // Close codes that never go on the wire
        for code in [1005u16, 1006, 1015] {
            assert_protocol_error(FIN | OpCode::Close.as_u8(), &code.to_be_bytes());
        }
    }

    #[test]
    fn test_reserved_close_code_not_sent() {
        let (ws, socket, mut peer) = server();
        ws.shutdown(CloseCode::RESERVED_ABNORMAL_CLOSE, "");
        assert!(socket.is_open());

        let (flags, payload) = read_frame(&mut peer);
        assert_eq!(flags, FIN | OpCode::Close.as_u8());
        assert_eq!(close_code(&payload), CloseCode::NORMAL_CLOSE.as_u16());
    }

    fn assert_too_big(socket: &Rc<StreamSocket>, peer: &mut TcpStream) {
        pump(socket, || false);
        assert!(!socket.is_open());
        let (flags, payload) = read_frame(peer);
        assert_eq!(flags, FIN | OpCode::Close.as_u8());
        assert_eq!(close_code(&payload), CloseCode::PAYLOAD_TOO_BIG.as_u16());
    }

    #[test]
    fn test_oversized_frame_closed_before_payload_arrives() {
        let (ws, socket, mut peer) = server();
        // Only the header of a frame announcing a terabyte.
        let mut header = vec![FIN | OpCode::Binary.as_u8(), 0x80 | 127];
        header.extend_from_slice(&(1u64 << 40).to_be_bytes());
        header.extend_from_slice(&CLIENT_MASK);
        peer.write_all(&header).unwrap();

        assert_too_big(&socket, &mut peer);
        assert!(ws.handler().messages.borrow().is_empty());
    }

    #[test]
    fn test_oversized_fragmented_message() {
        let (ws, socket, mut peer) = server();
        let half = MAX_MESSAGE_SIZE / 2;
        let mut writer = peer.try_clone().unwrap();
        let sender = std::thread::spawn(move || {
            send_frame(&mut writer, OpCode::Binary.as_u8(), &vec![b'x'; half], Some(CLIENT_MASK));
        });
        let deadline = Instant::now() + Duration::from_secs(10);
        while ws.payload.borrow().len() < half && Instant::now() < deadline {
            socket.handle_poll(libc::POLLIN);
        }
        sender.join().unwrap();
        assert_eq!(ws.payload.borrow().len(), half);
        assert!(socket.is_open());

        // The continuation header alone pushes the message over the limit.
        let mut header = vec![OpCode::Continuation.as_u8(), 0x80 | 127];
        header.extend_from_slice(&(half as u64 + 1).to_be_bytes());
        header.extend_from_slice(&CLIENT_MASK);
        peer.write_all(&header).unwrap();

        assert_too_big(&socket, &mut peer);
        assert!(ws.handler().messages.borrow().is_empty());
    }

    #[test]
    fn test_new_message_inside_fragment_block() {
        let (ws, socket, mut peer) = server();
        send_frame(&mut peer, OpCode::Text.as_u8(), b"part", Some(CLIENT_MASK));
        send_frame(&mut peer, FIN | OpCode::Text.as_u8(), b"new", Some(CLIENT_MASK));
        pump(&socket, || false);

        assert!(!socket.is_open());
        assert!(ws.handler().messages.borrow().is_empty());
    }

    #[test]
    fn test_client_rejects_masked_frames() {
        let ws = WebSocketHandler::new(true, true, Recorder::default());
        let (socket, mut peer) = test_pair(ws.clone());
        ws.set_web_socket(&socket);
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        send_frame(&mut peer, FIN | OpCode::Text.as_u8(), b"masked", Some(CLIENT_MASK));
        pump(&socket, || false);
        assert!(!socket.is_open());
        assert!(ws.handler().messages.borrow().is_empty());

        // Our own close frame is masked.
        let mut data = Vec::new();
        peer.read_to_end(&mut data).unwrap_or_default();
        let header = frame::decode_header(&data).unwrap().unwrap();
        assert!(header.mask.is_some());
        let mut payload = data[header.header_len..header.frame_len() as usize].to_vec();
        apply_mask(&mut payload, header.mask.unwrap());
        assert_eq!(close_code(&payload), CloseCode::PROTOCOL_ERROR.as_u16());
    }

    fn upgrade_response(key: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            compute_accept(key)
        )
    }

    #[test]
    fn test_client_upgrade_across_partial_reads() {
        let ws = WebSocketHandler::new(true, true, Recorder::default());
        let (socket, mut peer) = test_pair(ws.clone());
        assert!(!ws.web_socket_key().is_empty());

        let response = upgrade_response(ws.web_socket_key());
        let (head, tail) = response.split_at(30);
        peer.write_all(head.as_bytes()).unwrap();
        pump(&socket, || socket.in_buffer().is_empty());
        assert!(!socket.is_websocket());

        let mut rest = tail.as_bytes().to_vec();
        let mut out = BytesMut::new();
        frame::encode_frame(&mut out, FIN | OpCode::Text.as_u8(), b"welcome", None);
        rest.extend_from_slice(&out);
        peer.write_all(&rest).unwrap();
        pump(&socket, || !ws.handler().messages.borrow().is_empty());

        assert!(socket.is_websocket());
        assert_eq!(*ws.handler().messages.borrow(), vec![b"welcome".to_vec()]);
    }

    #[test]
    fn test_client_rejects_bad_accept() {
        let ws = WebSocketHandler::new(true, true, Recorder::default());
        let (socket, mut peer) = test_pair(ws.clone());

        peer.write_all(upgrade_response("some other key").as_bytes()).unwrap();
        pump(&socket, || false);

        assert!(!socket.is_websocket());
        assert!(!socket.is_open());
    }

    fn parse_request(wire: &str) -> RequestParser {
        let mut parser = RequestParser::new();
        parser.read_data(wire.as_bytes()).unwrap();
        parser
    }

    fn read_http_response(peer: &mut TcpStream) -> Response {
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut response = Response::new();
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        while !response.done() {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0);
            data.extend_from_slice(&buf[..n]);
            let consumed = response.read_data(&data).unwrap();
            data.drain(..consumed);
        }
        response
    }

    const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nOrigin: http://localhost\r\n";

    #[test]
    fn test_server_upgrade() {
        let (socket, mut peer) = test_pair(Rc::new(NullHandler::default()));
        let request = parse_request(&format!("{}Sec-WebSocket-Protocol: chat\r\n\r\n", UPGRADE_REQUEST));

        let ws = WebSocketHandler::upgrade(
            &socket,
            &request,
            |origin| origin == Some("http://localhost"),
            Recorder::default(),
        )
        .unwrap();
        assert!(socket.is_websocket());
        assert!(!ws.is_client());

        let response = read_http_response(&mut peer);
        assert_eq!(response.status_code(), 101);
        assert_eq!(response.get("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(response.get("Sec-WebSocket-Protocol"), Some("chat"));
        assert_eq!(response.header().connection_token(), ConnectionToken::Upgrade);

        // The socket now feeds the websocket handler.
        send_frame(&mut peer, FIN | OpCode::Binary.as_u8(), b"\x01\x02", Some(CLIENT_MASK));
        pump(&socket, || !ws.handler().messages.borrow().is_empty());
        assert_eq!(*ws.handler().messages.borrow(), vec![vec![1u8, 2]]);
    }

    #[test]
    fn test_server_upgrade_rejections() {
        let (socket, mut peer) = test_pair(Rc::new(NullHandler::default()));
        let request = parse_request(&format!("{}\r\n", UPGRADE_REQUEST));
        let result = WebSocketHandler::upgrade(&socket, &request, |_| false, Recorder::default());
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(!socket.is_websocket());
        assert_eq!(read_http_response(&mut peer).status_code(), 403);

        let (socket, mut peer) = test_pair(Rc::new(NullHandler::default()));
        let request = parse_request("GET /chat HTTP/1.1\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: abc\r\n\r\n");
        assert!(WebSocketHandler::upgrade(&socket, &request, |_| true, Recorder::default()).is_err());
        assert_eq!(read_http_response(&mut peer).status_code(), 400);

        let (socket, mut peer) = test_pair(Rc::new(NullHandler::default()));
        let request = parse_request("GET /chat HTTP/1.1\r\nSec-WebSocket-Version: 13\r\n\r\n");
        assert!(WebSocketHandler::upgrade(&socket, &request, |_| true, Recorder::default()).is_err());
        assert_eq!(read_http_response(&mut peer).status_code(), 400);
    }
}
