//! HTTP server side
//!
//! `RequestHandler` serves HTTP/1.1 requests arriving on an accepted
//! socket. Each complete request is handed to a callback, which answers it
//! through the socket or upgrades the connection to another protocol.

use super::request::{RequestParser, Stage};
use super::response::ServerResponse;
use super::status::StatusCode;
use super::ConnectionToken;
use crate::net::{ProtocolHandler, SocketDisposition, StreamSocket};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Invoked for each complete request
pub type RequestCallback = Box<dyn FnMut(&RequestParser, &Rc<StreamSocket>)>;

/// Protocol handler serving HTTP requests
pub struct RequestHandler {
    socket: RefCell<Weak<StreamSocket>>,
    parser: RefCell<RequestParser>,
    callback: RefCell<RequestCallback>,
}

impl RequestHandler {
    pub fn new<F>(callback: F) -> Rc<Self>
    where
        F: FnMut(&RequestParser, &Rc<StreamSocket>) + 'static,
    {
        Rc::new(RequestHandler {
            socket: RefCell::new(Weak::new()),
            parser: RefCell::new(RequestParser::new()),
            callback: RefCell::new(Box::new(callback)),
        })
    }

    /// Socket currently served, if it is still alive
    pub fn socket(&self) -> Option<Rc<StreamSocket>> {
        self.socket.borrow().upgrade()
    }

    fn is_attached_to(&self, socket: &StreamSocket) -> bool {
        socket.handler().map_or(false, |handler| {
            std::ptr::eq(Rc::as_ptr(&handler) as *const (), self as *const Self as *const ())
        })
    }

    fn dispatch(&self, socket: &Rc<StreamSocket>) {
        let parser = self.parser.borrow();
        let mut callback = self.callback.borrow_mut();
        debug!(
            fd = socket.fd(),
            verb = parser.verb(),
            url = parser.url(),
            "handling request"
        );
        if panic::catch_unwind(AssertUnwindSafe(|| (*callback)(&*parser, socket))).is_err() {
            error!(fd = socket.fd(), url = parser.url(), "request callback panicked");
            send_error_and_shutdown(socket, StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
}

impl ProtocolHandler for RequestHandler {
    fn on_connect(&self, socket: &Rc<StreamSocket>) {
        trace!(fd = socket.fd(), "serving connection");
        *self.socket.borrow_mut() = Rc::downgrade(socket);
    }

    fn get_poll_events(&self, _now: Instant, _timeout_max: &mut Duration) -> i16 {
        libc::POLLIN
    }

    fn handle_incoming_message(&self, disposition: &mut SocketDisposition) {
        let socket = disposition.socket().clone();

        loop {
            let result = {
                let input = socket.in_buffer();
                let result = self.parser.borrow_mut().read_data(&input);
                result
            };
            let consumed = match result {
                Ok(consumed) => consumed,
                Err(e) => {
                    warn!(fd = socket.fd(), error = %e, "bad request");
                    socket.ignore_input();
                    send_error_and_shutdown(&socket, StatusCode::BAD_REQUEST);
                    return;
                }
            };
            socket.erase_first_input_bytes(consumed);

            if self.parser.borrow().stage() != Stage::Finished {
                return;
            }

            let keep_alive = self.parser.borrow().is_keep_alive();
            self.dispatch(&socket);
            self.parser.borrow_mut().reset();

            // An upgraded socket passes the remaining input to its new
            // handler.
            if !socket.is_open() || !self.is_attached_to(&socket) {
                return;
            }
            if !keep_alive {
                trace!(fd = socket.fd(), "closing after non keep-alive request");
                socket.ignore_input();
                socket.async_shutdown();
                return;
            }
            if socket.in_buffer().is_empty() {
                return;
            }
        }
    }

    fn perform_writes(&self, _capacity: usize) {}

    fn on_disconnect(&self) {
        if let Some(socket) = self.socket() {
            debug!(fd = socket.fd(), "client disconnected");
        }
    }
}

/// Answer with an empty `code` response and close the connection.
pub fn send_error_and_shutdown(socket: &StreamSocket, code: StatusCode) {
    let mut response = ServerResponse::new(code);
    response.set_body("", None);
    response.set_connection_token(ConnectionToken::Close);
    if let Err(e) = socket.send_response(&response) {
        debug!(fd = socket.fd(), error = %e, "failed to send error response");
    }
    socket.async_shutdown();
}
