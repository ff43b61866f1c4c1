//! HTTP responses
//!
//! `Response` is the client side: it parses a response out of whatever
//! bytes have arrived and ends in exactly one terminal state. `ServerResponse`
//! is the server side: a status line, header and body serialized verbatim.

use super::body::{BodySink, IoWriteFunc};
use super::chunked::{encode_chunk, ChunkedDecoder};
use super::header::{ConnectionToken, Header, HeaderState};
use super::status::{FieldParseState, StatusCode, StatusCodeClass, StatusLine};
use super::{http_time_now, Error, Result, CRLF, SERVER_STRING};
use bytes::BytesMut;
use std::fmt;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, error, trace, warn};

/// Lifecycle of a client response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    New,
    Incomplete,
    Error,
    Timeout,
    Complete,
}

impl ResponseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseState::New => "New",
            ResponseState::Incomplete => "Incomplete",
            ResponseState::Error => "Error",
            ResponseState::Timeout => "Timeout",
            ResponseState::Complete => "Complete",
        }
    }
}

impl fmt::Display for ResponseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserStage {
    StatusLine,
    Header,
    Body,
    Finished,
}

/// How the end of the body is found
#[derive(Debug)]
enum BodyLength {
    Fixed(u64),
    Chunked(ChunkedDecoder),
    UntilClose,
}

/// Invoked once when the response reaches a terminal state
pub type FinishedCallback = Box<dyn FnOnce(&Response)>;

/// An inbound HTTP response
pub struct Response {
    status_line: StatusLine,
    header: Header,
    state: ResponseState,
    parser_stage: ParserStage,
    body_length: Option<BodyLength>,
    recv_body_size: u64,
    body: Vec<u8>,
    sink: BodySink,
    finished_callback: Option<FinishedCallback>,
    fd: RawFd,
}

impl Response {
    pub fn new() -> Self {
        Response {
            status_line: StatusLine::default(),
            header: Header::new(),
            state: ResponseState::New,
            parser_stage: ParserStage::StatusLine,
            body_length: None,
            recv_body_size: 0,
            body: Vec::new(),
            sink: BodySink::Memory,
            finished_callback: None,
            fd: -1,
        }
    }

    /// A response that calls `callback` when it is done. `fd` is only used
    /// to tag log messages.
    pub fn with_callback(callback: FinishedCallback, fd: RawFd) -> Self {
        let mut response = Response::new();
        response.finished_callback = Some(callback);
        response.fd = fd;
        response
    }

    pub(crate) fn set_log_context(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    /// True once the response is Complete, Error or Timeout
    pub fn done(&self) -> bool {
        matches!(
            self.state,
            ResponseState::Complete | ResponseState::Error | ResponseState::Timeout
        )
    }

    pub fn status_line(&self) -> &StatusLine {
        &self.status_line
    }

    pub fn status_code(&self) -> u16 {
        self.status_line.status_code()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.header.get(name)
    }

    /// The body, when it was kept in memory
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The in-memory body as text
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body bytes received so far, whatever the sink
    pub fn received_body_size(&self) -> u64 {
        self.recv_body_size
    }

    pub fn save_body_to_memory(&mut self) {
        self.sink = BodySink::Memory;
    }

    /// Write a successful response's body to `path` (truncated). Error
    /// responses are still kept in memory.
    pub fn save_body_to_file(&mut self, path: impl AsRef<Path>) {
        self.sink = BodySink::file(path.as_ref());
    }

    pub fn save_body_to_handler(&mut self, handler: IoWriteFunc) {
        self.sink = BodySink::Handler(handler);
    }

    /// Parse as much of `data` as possible.
    ///
    /// Returns the number of bytes consumed. An error leaves the response in
    /// `Error` state and means the connection must be dropped.
    pub fn read_data(&mut self, data: &[u8]) -> Result<usize> {
        if self.done() {
            return Ok(0);
        }
        if self.state == ResponseState::New {
            self.state = ResponseState::Incomplete;
        }

        let mut consumed = 0;
        loop {
            match self.parser_stage {
                ParserStage::StatusLine => {
                    let (state, len) = self.status_line.parse(&data[consumed..]);
                    match state {
                        FieldParseState::Valid => {
                            consumed += len;
                            trace!(fd = self.fd, status = %self.status_line, "parsed status line");
                            self.parser_stage = ParserStage::Header;
                        }
                        FieldParseState::Incomplete | FieldParseState::Unknown => return Ok(consumed),
                        FieldParseState::Invalid => {
                            error!(fd = self.fd, "invalid status line");
                            self.error();
                            return Err(Error::InvalidStatus("malformed status line".to_string()));
                        }
                    }
                }

                ParserStage::Header => {
                    let (state, len) = self.header.parse(&data[consumed..]);
                    match state {
                        HeaderState::Complete => {
                            consumed += len;
                            self.on_header_complete()?;
                        }
                        HeaderState::Incomplete | HeaderState::New => return Ok(consumed),
                        HeaderState::InvalidField | HeaderState::TooManyFields => {
                            error!(fd = self.fd, ?state, "invalid response header");
                            self.error();
                            return Err(Error::InvalidHeader(format!("{:?}", state)));
                        }
                    }
                }

                ParserStage::Body => {
                    let read = self.read_body(&data[consumed..]);
                    match read {
                        Ok(len) => consumed += len,
                        Err(e) => {
                            error!(fd = self.fd, error = %e, "failed to process response body");
                            self.error();
                            return Err(e);
                        }
                    }
                    return Ok(consumed);
                }

                ParserStage::Finished => return Ok(consumed),
            }
        }
    }

    fn on_header_complete(&mut self) -> Result<()> {
        let code = self.status_line.status_code();

        if self.status_line.status_category() == StatusCodeClass::Informational
            && code != StatusCode::SWITCHING_PROTOCOLS.as_u16()
        {
            debug!(fd = self.fd, code, "skipping interim response");
            self.status_line = StatusLine::default();
            self.header.clear();
            self.parser_stage = ParserStage::StatusLine;
            return Ok(());
        }

        if self.status_line.status_category() != StatusCodeClass::Successful && !self.sink.is_memory() {
            // Error payloads are always readable through body().
            trace!(fd = self.fd, code, "keeping non-success body in memory");
            self.sink.close();
            self.sink = BodySink::Memory;
        }

        self.parser_stage = ParserStage::Body;
        if code == StatusCode::SWITCHING_PROTOCOLS.as_u16()
            || code == StatusCode::NO_CONTENT.as_u16()
            || code == StatusCode::NOT_MODIFIED.as_u16()
        {
            self.complete();
        } else if self.header.is_chunked_transfer_encoding() {
            self.body_length = Some(BodyLength::Chunked(ChunkedDecoder::new()));
        } else if let Some(length) = self.header.content_length() {
            if length == 0 {
                self.complete();
            } else {
                self.body_length = Some(BodyLength::Fixed(length));
            }
        } else if self.header.has_content_length() {
            error!(fd = self.fd, "invalid Content-Length");
            self.error();
            return Err(Error::InvalidHeader("Content-Length".to_string()));
        } else {
            self.body_length = Some(BodyLength::UntilClose);
        }
        Ok(())
    }

    fn read_body(&mut self, data: &[u8]) -> Result<usize> {
        let sink = &mut self.sink;
        let body = &mut self.body;
        let recv_body_size = &mut self.recv_body_size;

        let (consumed, complete) = match &mut self.body_length {
            Some(BodyLength::Chunked(decoder)) => decoder.decode(data, |chunk| {
                *recv_body_size += chunk.len() as u64;
                sink.write(body, chunk)
            })?,
            Some(BodyLength::Fixed(length)) => {
                let remaining = *length - *recv_body_size;
                let take = remaining.min(data.len() as u64) as usize;
                sink.write(body, &data[..take])?;
                *recv_body_size += take as u64;
                (take, *recv_body_size == *length)
            }
            Some(BodyLength::UntilClose) => {
                sink.write(body, data)?;
                *recv_body_size += data.len() as u64;
                (data.len(), false)
            }
            None => (0, true),
        };

        if complete {
            self.complete();
        }
        Ok(consumed)
    }

    /// True while the body is delimited by the connection closing
    pub(crate) fn expects_eof(&self) -> bool {
        self.parser_stage == ParserStage::Body
            && matches!(self.body_length, Some(BodyLength::UntilClose))
    }

    /// The connection went away: completes a read-until-close body, fails
    /// anything else still in flight.
    pub(crate) fn connection_closed(&mut self) {
        if self.expects_eof() {
            self.complete();
        } else {
            self.error();
        }
    }

    /// Whether the server asked to close the connection
    pub fn is_connection_close(&self) -> bool {
        self.header.connection_token() == ConnectionToken::Close
            || (self.status_line.version_major() == 1
                && self.status_line.version_minor() == 0
                && self.header.connection_token() != ConnectionToken::KeepAlive)
    }

    pub fn complete(&mut self) {
        self.finish(ResponseState::Complete);
    }

    pub fn timeout(&mut self) {
        self.finish(ResponseState::Timeout);
    }

    pub fn error(&mut self) {
        self.finish(ResponseState::Error);
    }

    /// End in `Error` without running the finished callback.
    pub(crate) fn abort(&mut self) {
        if !self.done() {
            self.finished_callback = None;
            self.finish(ResponseState::Error);
        }
    }

    fn finish(&mut self, state: ResponseState) {
        if self.done() {
            return;
        }

        self.state = state;
        if state == ResponseState::Complete {
            self.parser_stage = ParserStage::Finished;
        }
        self.sink.close();
        debug!(
            fd = self.fd,
            %state,
            code = self.status_line.status_code(),
            body = self.recv_body_size,
            "response finished"
        );

        if let Some(callback) = self.finished_callback.take() {
            let this = &*self;
            if panic::catch_unwind(AssertUnwindSafe(|| callback(this))).is_err() {
                warn!(fd = self.fd, "response finished callback panicked");
            }
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("fd", &self.fd)
            .field("state", &self.state)
            .field("stage", &self.parser_stage)
            .field("status_line", &self.status_line)
            .field("header", &self.header)
            .field("recv_body_size", &self.recv_body_size)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

/// An outbound HTTP response, built by a server
#[derive(Debug, Clone)]
pub struct ServerResponse {
    status_line: StatusLine,
    header: Header,
    body: BytesMut,
}

impl ServerResponse {
    /// A response with `Date` and `Server` already set
    pub fn new(code: StatusCode) -> Self {
        let mut header = Header::new();
        header.set("Date", http_time_now());
        header.set("Server", SERVER_STRING);
        ServerResponse {
            status_line: StatusLine::new(code),
            header,
            body: BytesMut::new(),
        }
    }

    pub fn status_line(&self) -> &StatusLine {
        &self.status_line
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.header.add(name, value);
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.header.set(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.header.get(name)
    }

    pub fn set_connection_token(&mut self, token: ConnectionToken) {
        self.header.set_connection_token(token);
    }

    /// Set the body. Content-Length is always set; Content-Type only for a
    /// non-empty body.
    pub fn set_body(&mut self, body: impl AsRef<[u8]>, content_type: Option<&str>) {
        let body = body.as_ref();
        if !body.is_empty() {
            if let Some(content_type) = content_type {
                self.header.set_content_type(content_type);
            }
        }
        self.header.set_content_length(body.len() as u64);
        self.body.clear();
        self.body.extend_from_slice(body);
    }

    /// Append one chunk to the body. The caller sets `Transfer-Encoding:
    /// chunked` and ends the body with an empty chunk.
    pub fn append_chunk(&mut self, data: &[u8]) {
        encode_chunk(&mut self.body, data);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize status line, header, blank line and body
    pub fn write_data(&self, out: &mut BytesMut) {
        self.status_line.write_data(out);
        self.header.write_data(out);
        out.extend_from_slice(CRLF.as_bytes());
        out.extend_from_slice(&self.body);
    }
}
