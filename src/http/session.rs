//! HTTP client sessions
//!
//! A `Session` owns one reusable connection to a host and runs one
//! request/response exchange at a time over it. Requests are issued
//! asynchronously on a caller's `SocketPoll`, or synchronously on a poll
//! the session drives itself; both go through the same code.

use super::request::{Request, Stage};
use super::response::Response;
use super::{http_time_now, Result, AGENT_STRING};
use crate::net::{
    self, AsyncConnectResult, ProtocolHandler, SocketDisposition, SocketPoll, StreamSocket, TlsConfig,
    VerifyOutcome, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT,
};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Longest single wait of a synchronous request loop
const SYNC_POLL_SLICE: Duration = Duration::from_secs(1);

/// Transport a session talks over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    HttpUnencrypted,
    HttpSsl,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::HttpUnencrypted => DEFAULT_HTTP_PORT,
            Protocol::HttpSsl => DEFAULT_HTTPS_PORT,
        }
    }
}

/// The response of the current request, shared with the caller
pub type SharedResponse = Rc<RefCell<Response>>;

type SessionCallback = Rc<dyn Fn(&Rc<Session>)>;

/// A reusable client connection to one host
pub struct Session {
    this: Weak<Session>,
    host: String,
    port: u16,
    protocol: Protocol,
    timeout: Cell<Duration>,
    tls: RefCell<Option<Rc<TlsConfig>>>,
    socket: RefCell<Weak<StreamSocket>>,
    pending: RefCell<Weak<StreamSocket>>,
    connect_generation: Cell<u64>,
    poll: RefCell<Weak<SocketPoll>>,
    sync_poll: RefCell<Option<Rc<SocketPoll>>>,
    request: RefCell<Request>,
    response: RefCell<Option<SharedResponse>>,
    finished: RefCell<Rc<Cell<bool>>>,
    start_time: Cell<Instant>,
    connected: Cell<bool>,
    connecting: Cell<bool>,
    connect_result: Cell<AsyncConnectResult>,
    fd: Cell<RawFd>,
    verify: RefCell<VerifyOutcome>,
    on_finished: RefCell<Option<SessionCallback>>,
    on_connect_fail: RefCell<Option<SessionCallback>>,
}

impl Session {
    /// How long a request may take unless `set_timeout` says otherwise
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// A session for `host:port`; port 0 picks the protocol's default.
    pub fn create(host: impl Into<String>, protocol: Protocol, port: u16) -> Rc<Session> {
        let port = if port == 0 { protocol.default_port() } else { port };
        Rc::new_cyclic(|this| Session {
            this: this.clone(),
            host: host.into(),
            port,
            protocol,
            timeout: Cell::new(Self::DEFAULT_TIMEOUT),
            tls: RefCell::new(None),
            socket: RefCell::new(Weak::new()),
            pending: RefCell::new(Weak::new()),
            connect_generation: Cell::new(0),
            poll: RefCell::new(Weak::new()),
            sync_poll: RefCell::new(None),
            request: RefCell::new(Request::default()),
            response: RefCell::new(None),
            finished: RefCell::new(Rc::new(Cell::new(false))),
            start_time: Cell::new(Instant::now()),
            connected: Cell::new(false),
            connecting: Cell::new(false),
            connect_result: Cell::new(AsyncConnectResult::Ok),
            fd: Cell::new(-1),
            verify: RefCell::new(VerifyOutcome::default()),
            on_finished: RefCell::new(None),
            on_connect_fail: RefCell::new(None),
        })
    }

    pub fn create_http(host: impl Into<String>, port: u16) -> Rc<Session> {
        Self::create(host, Protocol::HttpUnencrypted, port)
    }

    pub fn create_https(host: impl Into<String>, port: u16) -> Rc<Session> {
        Self::create(host, Protocol::HttpSsl, port)
    }

    /// A session for the host of `uri`. `http`/`ws` connect in the clear,
    /// `https`/`wss` over TLS.
    pub fn from_uri(uri: &str) -> Result<Rc<Session>> {
        let url = url::Url::parse(uri).map_err(|e| net::Error::InvalidUri(format!("{}: {}", uri, e)))?;
        let protocol = match url.scheme() {
            "http" | "ws" => Protocol::HttpUnencrypted,
            "https" | "wss" => Protocol::HttpSsl,
            scheme => {
                return Err(net::Error::InvalidUri(format!("unsupported scheme {}", scheme)).into());
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| net::Error::InvalidUri(format!("{}: missing host", uri)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::create(host, protocol, url.port().unwrap_or(0)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_secure(&self) -> bool {
        self.protocol == Protocol::HttpSsl
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }

    /// Zero disables the timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.set(timeout);
    }

    /// TLS settings for `HttpSsl` sessions. Without one a verifying default
    /// is built on first connect.
    pub fn set_tls_config(&self, config: TlsConfig) {
        *self.tls.borrow_mut() = Some(Rc::new(config));
    }

    /// Response of the latest request
    pub fn response(&self) -> Option<SharedResponse> {
        self.response.borrow().clone()
    }

    /// Called once per request that reached Complete, Error or Timeout
    pub fn set_finished_handler<F>(&self, handler: F)
    where
        F: Fn(&Rc<Session>) + 'static,
    {
        *self.on_finished.borrow_mut() = Some(Rc::new(handler));
    }

    /// Called when no connection could be made; `on_finished` is not
    /// called for such requests.
    pub fn set_connect_fail_handler<F>(&self, handler: F)
    where
        F: Fn(&Rc<Session>) + 'static,
    {
        *self.on_connect_fail.borrow_mut() = Some(Rc::new(handler));
    }

    /// Outcome of the last connection attempt
    pub fn connection_result(&self) -> AsyncConnectResult {
        self.connect_result.get()
    }

    pub fn ssl_verify_result(&self) -> i64 {
        self.verify_outcome().code
    }

    pub fn ssl_verify_message(&self) -> String {
        self.verify_outcome().message
    }

    fn verify_outcome(&self) -> VerifyOutcome {
        match self.socket() {
            Some(socket) => socket.ssl_verify_result(),
            None => self.verify.borrow().clone(),
        }
    }

    /// Descriptor of the current connection, -1 when there is none
    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    fn socket(&self) -> Option<Rc<StreamSocket>> {
        self.socket.borrow().upgrade()
    }

    /// Issue `request` on `poll`.
    ///
    /// Returns false when the request could not be started; the connect
    /// failure handler has run by then. Any earlier response is replaced.
    pub fn async_request(&self, request: Request, poll: &Weak<SocketPoll>) -> bool {
        self.start_request(request, poll).1
    }

    /// Run `request` to completion on a poll owned by the session.
    pub fn sync_request(&self, request: Request) -> SharedResponse {
        match self.sync_poll() {
            Ok(poll) => self.sync_request_on(request, &poll),
            Err(e) => {
                error!(host = %self.host, error = %e, "failed to create poll for synchronous request");
                let (response, _) = self.start_request(request, &Weak::new());
                response
            }
        }
    }

    /// Run `request` to completion by driving `poll` on this thread.
    pub fn sync_request_on(&self, request: Request, poll: &Rc<SocketPoll>) -> SharedResponse {
        let (response, started) = self.start_request(request, &Rc::downgrade(poll));
        if started {
            self.run_until_done(poll, &response);
        }
        response
    }

    /// `sync_request` with a one-off timeout
    pub fn sync_request_with_timeout(&self, request: Request, timeout: Duration) -> SharedResponse {
        let previous = self.timeout.replace(timeout);
        let response = self.sync_request(request);
        self.timeout.set(previous);
        response
    }

    /// `sync_request` saving a successful body to `path`
    pub fn sync_download(&self, request: Request, path: impl AsRef<Path>) -> SharedResponse {
        let poll = match self.sync_poll() {
            Ok(poll) => poll,
            Err(e) => {
                error!(host = %self.host, error = %e, "failed to create poll for download");
                return self.start_request(request, &Weak::new()).0;
            }
        };

        let (response, started) = self.start_request(request, &Rc::downgrade(&poll));
        response.borrow_mut().save_body_to_file(path);
        if started {
            self.run_until_done(&poll, &response);
        }
        response
    }

    /// Half-close the connection once queued output is sent. The next
    /// request connects afresh.
    pub fn async_shutdown(&self) {
        self.release_socket(false);
    }

    fn sync_poll(&self) -> std::io::Result<Rc<SocketPoll>> {
        if let Some(poll) = self.sync_poll.borrow().as_ref() {
            return Ok(poll.clone());
        }
        let poll = SocketPoll::new(format!("HttpSyncPoll {}", self.host))?;
        *self.sync_poll.borrow_mut() = Some(poll.clone());
        Ok(poll)
    }

    fn run_until_done(&self, poll: &Rc<SocketPoll>, response: &SharedResponse) {
        while !response.borrow().done() {
            let wait = match self.timeout.get() {
                timeout if timeout.is_zero() => SYNC_POLL_SLICE,
                timeout => timeout.min(SYNC_POLL_SLICE),
            };
            if let Err(e) = poll.poll(wait) {
                error!(host = %self.host, error = %e, "poll failed");
                response.borrow_mut().error();
                self.disconnect();
                self.dispatch_finished();
                break;
            }
            self.check_timeout(Instant::now());
        }
    }

    fn start_request(&self, request: Request, poll: &Weak<SocketPoll>) -> (SharedResponse, bool) {
        let Some(poll) = poll.upgrade().filter(|poll| poll.is_alive()) else {
            error!(host = %self.host, "no live poll to run the request on");
            let response = self.new_request(request);
            response.borrow_mut().abort();
            self.notify_connect_fail();
            return (response, false);
        };

        let same_poll = Weak::ptr_eq(&*self.poll.borrow(), &Rc::downgrade(&poll));
        if (self.connected.get() || self.connecting.get()) && !same_poll {
            debug!(host = %self.host, poll = poll.name(), "moving session to another poll");
            self.disconnect();
            self.connecting.set(false);
        } else if self.connected.get() && self.in_flight() {
            debug!(host = %self.host, fd = self.fd.get(), "discarding in-flight request");
            self.disconnect();
        }

        let response = self.new_request(request);
        *self.poll.borrow_mut() = Rc::downgrade(&poll);

        if self.connected.get() && self.socket().is_some() {
            trace!(host = %self.host, fd = self.fd.get(), "reusing connection");
            poll.wakeup();
            return (response, true);
        }
        if self.connecting.get() {
            return (response, true);
        }
        let started = self.async_connect(&poll);
        (response, started)
    }

    fn new_request(&self, mut request: Request) -> SharedResponse {
        let host = if self.port == self.protocol.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };
        request.set("Host", host);
        request.set("Date", http_time_now());
        request.set("User-Agent", AGENT_STRING);
        debug!(host = %self.host, verb = request.verb(), url = request.url(), "new request");
        *self.request.borrow_mut() = request;

        let finished = Rc::new(Cell::new(false));
        *self.finished.borrow_mut() = finished.clone();
        let response = Rc::new(RefCell::new(Response::with_callback(
            Box::new(move |_: &Response| finished.set(true)),
            self.fd.get(),
        )));
        *self.response.borrow_mut() = Some(response.clone());
        self.start_time.set(Instant::now());
        response
    }

    fn async_connect(&self, poll: &Rc<SocketPoll>) -> bool {
        let tls = match self.protocol {
            Protocol::HttpUnencrypted => None,
            Protocol::HttpSsl => match self.tls_config() {
                Ok(tls) => Some(tls),
                Err(e) => {
                    error!(host = %self.host, error = %e, "failed to set up TLS");
                    self.connect_result.set(AsyncConnectResult::MissingSsl);
                    self.connecting.set(true);
                    let generation = self.next_connect_generation();
                    let this = self.this.clone();
                    poll.add_callback(move || {
                        if let Some(session) = this.upgrade() {
                            session.connect_completed(generation, AsyncConnectResult::MissingSsl);
                        }
                    });
                    return true;
                }
            },
        };

        debug!(host = %self.host, port = self.port, secure = tls.is_some(), "connecting");
        self.connecting.set(true);
        let link: Rc<dyn ProtocolHandler> = Rc::new(SessionLink(self.this.clone()));
        let generation = self.next_connect_generation();
        let this = self.this.clone();
        let pending = net::async_connect(
            &self.host,
            self.port,
            tls.as_deref(),
            link,
            poll,
            Box::new(move |_socket, result| {
                if let Some(session) = this.upgrade() {
                    session.connect_completed(generation, result);
                }
            }),
        );
        *self.pending.borrow_mut() = pending.as_ref().map_or_else(Weak::new, Rc::downgrade);
        true
    }

    /// Start a new connect attempt; completions of older ones are ignored.
    fn next_connect_generation(&self) -> u64 {
        let generation = self.connect_generation.get().wrapping_add(1);
        self.connect_generation.set(generation);
        generation
    }

    /// Abandon a connect still in progress. Its socket is closed without
    /// reporting back, and a completion already queued is ignored.
    fn cancel_connect(&self) {
        if let Some(socket) = self.pending.replace(Weak::new()).upgrade() {
            debug!(fd = socket.fd(), host = %self.host, "abandoning pending connect");
            socket.detach_handler();
            socket.shutdown_connection();
        }
        if self.connecting.replace(false) {
            self.next_connect_generation();
        }
    }

    fn tls_config(&self) -> std::result::Result<Rc<TlsConfig>, net::TlsError> {
        if let Some(config) = self.tls.borrow().as_ref() {
            return Ok(config.clone());
        }
        let config = Rc::new(TlsConfig::client().build()?);
        *self.tls.borrow_mut() = Some(config.clone());
        Ok(config)
    }

    fn connect_completed(&self, generation: u64, result: AsyncConnectResult) {
        if generation != self.connect_generation.get() {
            trace!(host = %self.host, %result, "ignoring abandoned connect");
            return;
        }
        *self.pending.borrow_mut() = Weak::new();
        self.connecting.set(false);
        self.connect_result.set(result);
        if result == AsyncConnectResult::Ok {
            return;
        }

        warn!(host = %self.host, port = self.port, %result, "failed to connect");
        self.connected.set(false);
        if let Some(response) = self.response() {
            response.borrow_mut().abort();
        }
        self.notify_connect_fail();
    }

    fn in_flight(&self) -> bool {
        self.response
            .borrow()
            .as_ref()
            .map_or(false, |response| !response.borrow().done())
    }

    /// Drop the connection. An in-flight response completes if its body
    /// was delimited by EOF and fails otherwise.
    fn disconnect(&self) {
        self.release_socket(true);
    }

    fn release_socket(&self, hard: bool) {
        self.cancel_connect();
        let socket = self.socket.replace(Weak::new()).upgrade();
        if let Some(socket) = socket {
            debug!(fd = socket.fd(), host = %self.host, hard, "disconnecting");
            socket.detach_handler();
            socket.async_shutdown();
            if hard {
                socket.shutdown_connection();
            }
        }
        self.connected.set(false);
        self.fd.set(-1);

        let response = self.response();
        if let Some(response) = response {
            response.borrow_mut().connection_closed();
        }
    }

    /// Report a finished response, at most once per request. A response
    /// asking to close the connection gets it closed first.
    fn dispatch_finished(&self) {
        let finished = self.finished.borrow().clone();
        if !finished.replace(false) {
            return;
        }

        let close = self
            .response()
            .map_or(false, |response| response.borrow().is_connection_close());
        if close && self.connected.get() {
            debug!(fd = self.fd.get(), host = %self.host, "server asked to close the connection");
            self.disconnect();
        }

        let Some(this) = self.this.upgrade() else {
            return;
        };
        let callback = self.on_finished.borrow().clone();
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&this))).is_err() {
                error!(host = %self.host, "finished handler panicked");
            }
        }
    }

    fn notify_connect_fail(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let callback = self.on_connect_fail.borrow().clone();
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&this))).is_err() {
                error!(host = %self.host, "connect failure handler panicked");
            }
        }
    }

    fn on_connect(&self, socket: &Rc<StreamSocket>) {
        debug!(fd = socket.fd(), host = %self.host, "session connected");
        *self.socket.borrow_mut() = Rc::downgrade(socket);
        self.fd.set(socket.fd());
        self.connected.set(true);
        if let Some(response) = self.response() {
            response.borrow_mut().set_log_context(socket.fd());
        }
    }

    fn get_poll_events(&self, now: Instant, timeout_max: &mut Duration) -> i16 {
        let mut events = libc::POLLIN;
        if self.request.borrow().stage() != Stage::Finished {
            events |= libc::POLLOUT;
        }
        let timeout = self.timeout.get();
        if !timeout.is_zero() && self.in_flight() {
            let elapsed = now.saturating_duration_since(self.start_time.get());
            *timeout_max = (*timeout_max).min(timeout.saturating_sub(elapsed));
        }
        events
    }

    fn handle_incoming_message(&self, disposition: &mut SocketDisposition) {
        let Some(response) = self.response() else {
            return;
        };
        let socket = disposition.socket().clone();

        let result = {
            let input = socket.in_buffer();
            let result = response.borrow_mut().read_data(&input);
            result
        };
        match result {
            Ok(consumed) => {
                trace!(fd = socket.fd(), consumed, "read response data");
                socket.erase_first_input_bytes(consumed);
            }
            Err(e) => {
                error!(fd = socket.fd(), host = %self.host, error = %e, "invalid response, disconnecting");
                disposition.set_closed();
                self.disconnect();
            }
        }
        self.dispatch_finished();
    }

    fn perform_writes(&self, capacity: usize) {
        let Some(socket) = self.socket() else {
            return;
        };
        if self.request.borrow().stage() == Stage::Finished {
            return;
        }

        let result = socket.send_request(&mut self.request.borrow_mut(), capacity);
        if let Err(e) = result {
            error!(fd = socket.fd(), host = %self.host, error = %e, "failed to write request");
            if let Some(response) = self.response() {
                response.borrow_mut().error();
            }
            self.disconnect();
            self.dispatch_finished();
        }
    }

    fn check_timeout(&self, now: Instant) -> bool {
        // A zero timeout never expires.
        if self.timeout.get().is_zero() || !self.in_flight() {
            return false;
        }

        let timed_out = match now.checked_duration_since(self.start_time.get()) {
            Some(elapsed) => elapsed > self.timeout.get(),
            None => {
                warn!(host = %self.host, "clock went backwards, timing out request");
                true
            }
        };
        if !timed_out {
            return false;
        }

        warn!(
            fd = self.fd.get(),
            host = %self.host,
            timeout_ms = self.timeout.get().as_millis() as u64,
            "request timed out"
        );
        if let Some(response) = self.response() {
            response.borrow_mut().timeout();
        }
        self.disconnect();
        self.connecting.set(false);
        self.dispatch_finished();
        true
    }

    fn on_disconnect(&self) {
        debug!(fd = self.fd.get(), host = %self.host, "connection closed");
        self.disconnect();
        self.dispatch_finished();
    }

    fn on_handshake_fail(&self) {
        if let Some(socket) = self.socket() {
            *self.verify.borrow_mut() = socket.ssl_verify_result();
        }
        error!(
            fd = self.fd.get(),
            host = %self.host,
            verify = %self.verify.borrow().message,
            "TLS handshake failed"
        );
        self.connect_result.set(AsyncConnectResult::SslHandshakeFailure);
        if let Some(response) = self.response() {
            response.borrow_mut().abort();
        }
        self.disconnect();
        self.notify_connect_fail();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(socket) = self.pending.get_mut().upgrade() {
            socket.detach_handler();
            socket.shutdown_connection();
        }
        if let Some(socket) = self.socket.get_mut().upgrade() {
            trace!(fd = socket.fd(), host = %self.host, "closing connection of dropped session");
            socket.detach_handler();
            socket.shutdown_connection();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("fd", &self.fd.get())
            .field("connected", &self.connected.get())
            .field("timeout", &self.timeout.get())
            .field(
                "state",
                &self.response().map(|response| response.borrow().state()),
            )
            .finish()
    }
}

/// What the socket holds of a session. The link is weak, so dropping the
/// session closes its connection instead of leaking it with the poll.
struct SessionLink(Weak<Session>);

impl ProtocolHandler for SessionLink {
    fn on_connect(&self, socket: &Rc<StreamSocket>) {
        match self.0.upgrade() {
            Some(session) => session.on_connect(socket),
            None => socket.shutdown_connection(),
        }
    }

    fn get_poll_events(&self, now: Instant, timeout_max: &mut Duration) -> i16 {
        self.0
            .upgrade()
            .map_or(0, |session| session.get_poll_events(now, timeout_max))
    }

    fn handle_incoming_message(&self, disposition: &mut SocketDisposition) {
        match self.0.upgrade() {
            Some(session) => session.handle_incoming_message(disposition),
            None => disposition.set_closed(),
        }
    }

    fn perform_writes(&self, capacity: usize) {
        if let Some(session) = self.0.upgrade() {
            session.perform_writes(capacity);
        }
    }

    fn check_timeout(&self, now: Instant) -> bool {
        self.0.upgrade().map_or(false, |session| session.check_timeout(now))
    }

    fn on_disconnect(&self) {
        if let Some(session) = self.0.upgrade() {
            session.on_disconnect();
        }
    }

    fn on_handshake_fail(&self) {
        if let Some(session) = self.0.upgrade() {
            session.on_handshake_fail();
        }
    }
}
