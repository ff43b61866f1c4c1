//! HTTP requests
//!
//! `Request` builds an outbound request and serializes it incrementally;
//! `RequestParser` parses an inbound one from partial input. Both share
//! `RequestCommon`: verb, url, version, header and the parsing/writing
//! stage.

use super::body::{BodySink, IoReadFunc, IoWriteFunc};
use super::header::{ConnectionToken, Header, HeaderState};
use super::{find_crlf, Error, Result, CRLF, VERB_GET, VERS_1_0, VERS_1_1};
use base64::{prelude::BASE64_STANDARD, Engine};
use bytes::BytesMut;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, trace};

/// Longest request line we wait for
pub const MAX_REQUEST_LINE_LEN: usize = 8 * 1024;

/// Content type used by `set_body` when none is given
pub const DEFAULT_BODY_CONTENT_TYPE: &str = "text/html;charset=utf-8";

/// Size of the buffer the body source is pulled through
const BODY_CHUNK: usize = 16 * 1024;

/// Progress through a request; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    RequestLine,
    Header,
    Body,
    Finished,
}

/// The parts shared by outbound and inbound requests
#[derive(Debug, Clone)]
pub struct RequestCommon {
    url: String,
    verb: String,
    version: String,
    header: Header,
    stage: Stage,
}

impl RequestCommon {
    fn new(url: String, verb: String, header: Header, version: String) -> Self {
        RequestCommon {
            url,
            verb,
            version,
            header,
            stage: Stage::RequestLine,
        }
    }

    /// Path and query of the request
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, stage: Stage) {
        debug_assert!(stage >= self.stage, "request stage may only advance");
        self.stage = stage;
    }

    pub fn has(&self, name: &str) -> bool {
        self.header.has(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.header.get(name)
    }

    /// HTTP/1.0 never keeps the connection; otherwise only `Connection:
    /// close` ends it.
    pub fn is_keep_alive(&self) -> bool {
        if self.version == VERS_1_0 {
            return false;
        }
        self.header.connection_token() != ConnectionToken::Close
    }
}

/// An outbound HTTP request
pub struct Request {
    common: RequestCommon,
    body_source: IoReadFunc,
}

impl Request {
    /// A GET request for `url` over HTTP/1.1
    pub fn new(url: impl Into<String>) -> Self {
        Self::with(url, VERB_GET, Header::new(), VERS_1_1)
    }

    pub fn with(
        url: impl Into<String>,
        verb: impl Into<String>,
        header: Header,
        version: impl Into<String>,
    ) -> Self {
        Request {
            common: RequestCommon::new(url.into(), verb.into(), header, version.into()),
            body_source: Box::new(|_| Ok(0)),
        }
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.common.url = url.into();
    }

    pub fn set_verb(&mut self, verb: impl Into<String>) {
        self.common.verb = verb.into();
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.common.version = version.into();
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.common.header.add(name, value);
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.common.header.set(name, value);
    }

    pub fn set_connection_token(&mut self, token: ConnectionToken) {
        self.common.header.set_connection_token(token);
    }

    /// Pull the body from `source`, which returns `Ok(0)` at the end.
    /// `size` becomes the Content-Length.
    pub fn set_body_source<F>(&mut self, source: F, size: u64)
    where
        F: FnMut(&mut [u8]) -> io::Result<usize> + 'static,
    {
        self.common.header.set_content_length(size);
        self.body_source = Box::new(source);
    }

    /// Stream the body from the file at `path`.
    pub fn set_body_file(&mut self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        self.set_body_source(move |buf| file.read(buf), size);
        Ok(())
    }

    /// Send `body` from memory. The content type is only set for a
    /// non-empty body; the length always is.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>, content_type: Option<&str>) {
        let body = body.into();
        if !body.is_empty() {
            self.common
                .header
                .set_content_type(content_type.unwrap_or(DEFAULT_BODY_CONTENT_TYPE));
        }
        let size = body.len() as u64;
        let mut cursor = Cursor::new(body);
        self.set_body_source(move |buf| cursor.read(buf), size);
    }

    /// Add an `Authorization: Basic` header
    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        let token = BASE64_STANDARD.encode(format!("{}:{}", username, password));
        self.common.header.add("Authorization", format!("Basic {}", token));
    }

    /// Serialize into `out`. The request line and header are written in
    /// full; at most `capacity` body bytes are pulled per call. Returns once
    /// the body source is exhausted or the capacity is used up.
    pub fn write_data(&mut self, out: &mut BytesMut, capacity: usize) -> Result<()> {
        if self.common.stage == Stage::RequestLine {
            out.extend_from_slice(
                format!("{} {} {}{}", self.common.verb, self.common.url, self.common.version, CRLF)
                    .as_bytes(),
            );
            self.common.advance(Stage::Header);
        }

        if self.common.stage == Stage::Header {
            self.common.header.write_data(out);
            out.extend_from_slice(CRLF.as_bytes());
            self.common.advance(Stage::Body);
        }

        if self.common.stage == Stage::Body {
            let mut remaining = capacity;
            let mut buf = [0u8; BODY_CHUNK];
            while remaining > 0 {
                let want = remaining.min(buf.len());
                let read = match (self.body_source)(&mut buf[..want]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::Io(e)),
                };
                if read == 0 {
                    trace!(url = %self.common.url, "request body complete");
                    self.common.advance(Stage::Finished);
                    break;
                }
                out.extend_from_slice(&buf[..read]);
                remaining -= read;
            }
        }

        Ok(())
    }
}

impl Default for Request {
    fn default() -> Self {
        Request::new("/")
    }
}

impl Deref for Request {
    type Target = RequestCommon;

    fn deref(&self) -> &RequestCommon {
        &self.common
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut RequestCommon {
        &mut self.common
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("common", &self.common)
            .finish_non_exhaustive()
    }
}

/// Incremental parser for inbound requests
#[derive(Debug)]
pub struct RequestParser {
    common: RequestCommon,
    body: Vec<u8>,
    sink: BodySink,
    recv_body_size: u64,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            common: RequestCommon::new(String::new(), String::new(), Header::new(), String::new()),
            body: Vec::new(),
            sink: BodySink::Memory,
            recv_body_size: 0,
        }
    }

    /// Forget the previous request, keeping the configured sink.
    pub fn reset(&mut self) {
        let sink = std::mem::take(&mut self.sink);
        *self = RequestParser::new();
        self.sink = sink;
    }

    /// The body received so far, when kept in memory
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn save_body_to_memory(&mut self) {
        self.sink = BodySink::Memory;
    }

    pub fn save_body_to_file(&mut self, path: impl AsRef<Path>) {
        self.sink = BodySink::file(path.as_ref());
    }

    pub fn save_body_to_handler(&mut self, handler: IoWriteFunc) {
        self.sink = BodySink::Handler(handler);
    }

    /// Consume as much of `data` as possible.
    ///
    /// Returns the number of bytes consumed; the caller drops them from its
    /// buffer and calls again with more input. An error means the
    /// connection must be aborted.
    pub fn read_data(&mut self, data: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        if self.common.stage == Stage::RequestLine {
            let Some(line_len) = find_crlf(data) else {
                if data.len() > MAX_REQUEST_LINE_LEN {
                    return Err(Error::Parse("request line too long".to_string()));
                }
                return Ok(0);
            };
            self.parse_request_line(&data[..line_len])?;
            consumed = line_len + 2;
            self.common.advance(Stage::Header);
        }

        if self.common.stage == Stage::Header {
            let (state, len) = self.common.header.parse(&data[consumed..]);
            match state {
                HeaderState::Complete => {
                    consumed += len;
                    self.common.advance(Stage::Body);
                }
                HeaderState::Incomplete | HeaderState::New => return Ok(consumed),
                HeaderState::InvalidField => {
                    return Err(Error::InvalidHeader("invalid request header field".to_string()))
                }
                HeaderState::TooManyFields => {
                    return Err(Error::InvalidHeader("too many request header fields".to_string()))
                }
            }
        }

        if self.common.stage == Stage::Body {
            if self.common.header.is_chunked_transfer_encoding() {
                return Err(Error::Unsupported("chunked request body".to_string()));
            }
            let length = match self.common.header.get(super::header::CONTENT_LENGTH) {
                None => 0,
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidHeader(format!("Content-Length: {}", value)))?,
            };

            let remaining = length - self.recv_body_size;
            let available = (data.len() - consumed) as u64;
            let take = remaining.min(available) as usize;
            if take > 0 {
                self.sink.write(&mut self.body, &data[consumed..consumed + take])?;
                self.recv_body_size += take as u64;
                consumed += take;
            }

            if self.recv_body_size == length {
                self.sink.close();
                debug!(verb = %self.common.verb, url = %self.common.url, body = length, "request complete");
                self.common.advance(Stage::Finished);
            }
        }

        Ok(consumed)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<()> {
        let line = std::str::from_utf8(line)
            .map_err(|_| Error::Parse("request line is not valid UTF-8".to_string()))?;
        let mut parts = line.split(' ');
        let (verb, url, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(verb), Some(url), Some(version), None) => (verb, url, version),
            _ => return Err(Error::Parse(format!("Invalid request line: {}", line))),
        };

        if verb.is_empty() || !verb.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(Error::Parse(format!("Invalid verb: {}", verb)));
        }
        if url.is_empty() {
            return Err(Error::Parse("Empty request target".to_string()));
        }
        if version.len() != super::status::VERSION_LEN || !version.starts_with("HTTP/") {
            return Err(Error::InvalidVersion(version.to_string()));
        }

        self.common.verb = verb.to_string();
        self.common.url = url.to_string();
        self.common.version = version.to_string();
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for RequestParser {
    type Target = RequestCommon;

    fn deref(&self) -> &RequestCommon {
        &self.common
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn serialize(request: &mut Request) -> Vec<u8> {
        let mut out = BytesMut::new();
        while request.stage() != Stage::Finished {
            request.write_data(&mut out, 4096).unwrap();
        }
        out.to_vec()
    }

    #[test]
    fn test_defaults() {
        let request = Request::default();
        assert_eq!(request.url(), "/");
        assert_eq!(request.verb(), "GET");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.stage(), Stage::RequestLine);
        assert!(request.is_keep_alive());
    }

    #[test]
    fn test_keep_alive() {
        let mut request = Request::new("/");
        request.set_connection_token(ConnectionToken::Close);
        assert!(!request.is_keep_alive());

        let mut request = Request::new("/");
        request.set_version(VERS_1_0);
        request.set_connection_token(ConnectionToken::KeepAlive);
        assert!(!request.is_keep_alive());
    }

    #[test]
    fn test_set_body() {
        let mut request = Request::new("/upload");
        request.set_body("hello", None);
        assert_eq!(request.header().content_length(), Some(5));
        assert_eq!(request.header().content_type(), Some(DEFAULT_BODY_CONTENT_TYPE));

        let mut empty = Request::new("/upload");
        empty.set_body(Vec::new(), Some("application/json"));
        assert_eq!(empty.header().content_length(), Some(0));
        assert!(!empty.header().has_content_type());
    }

    #[test]
    fn test_write_data() {
        let mut header = Header::new();
        header.set("Host", "a");
        let mut request = Request::with("/x", "POST", header, "HTTP/1.1");
        request.set_body("abc", Some("text/plain"));

        let wire = serialize(&mut request);
        assert_eq!(
            wire,
            b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Type: text/plain\r\nContent-Length: 3\r\n\r\nabc"
        );
    }

    #[test]
    fn test_write_data_respects_capacity() {
        let mut request = Request::new("/big");
        request.set_body(vec![b'z'; 10], None);

        let mut out = BytesMut::new();
        request.write_data(&mut out, 4).unwrap();
        assert_eq!(request.stage(), Stage::Body);
        let header_len = out.len() - 4;

        request.write_data(&mut out, 4).unwrap();
        request.write_data(&mut out, 4).unwrap();
        assert_eq!(request.stage(), Stage::Finished);
        assert_eq!(out.len() - header_len, 10);
    }

    #[test]
    fn test_body_source_error() {
        let mut request = Request::new("/");
        request.set_body_source(|_| Err(io::Error::new(io::ErrorKind::Other, "broken")), 4);
        let mut out = BytesMut::new();
        assert!(matches!(request.write_data(&mut out, 1024), Err(Error::Io(_))));
    }

    #[test]
    fn test_body_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file body").unwrap();

        let mut request = Request::new("/put");
        request.set_verb("PUT");
        request.set_body_file(file.path()).unwrap();
        assert_eq!(request.header().content_length(), Some(9));

        let wire = serialize(&mut request);
        assert!(wire.ends_with(b"\r\n\r\nfile body"));

        assert!(Request::new("/").set_body_file("/nonexistent/file").is_err());
    }

    #[test]
    fn test_basic_auth() {
        let mut request = Request::new("/");
        request.set_basic_auth("Aladdin", "open sesame");
        assert_eq!(
            request.get("Authorization"),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
    }

    #[test]
    fn test_serialize_then_parse() {
        let mut header = Header::new();
        header.set("Host", "a");
        let mut request = Request::with("/x", "GET", header, "HTTP/1.1");
        let wire = serialize(&mut request);

        let mut parser = RequestParser::new();
        assert_eq!(parser.read_data(&wire).unwrap(), wire.len());
        assert_eq!(parser.stage(), Stage::Finished);
        assert_eq!(parser.verb(), "GET");
        assert_eq!(parser.url(), "/x");
        assert_eq!(parser.get("Host"), Some("a"));
    }

    #[test]
    fn test_split_parsing_matches_whole() {
        let wire: &[u8] =
            b"POST /doc?id=7 HTTP/1.1\r\nHost: example\r\nContent-Length: 11\r\n\r\nhello world";

        let mut whole = RequestParser::new();
        assert_eq!(whole.read_data(wire).unwrap(), wire.len());

        for split in 0..=wire.len() {
            let mut parser = RequestParser::new();
            let mut pending = wire[..split].to_vec();
            let consumed = parser.read_data(&pending).unwrap();
            pending.drain(..consumed);
            pending.extend_from_slice(&wire[split..]);
            let consumed = parser.read_data(&pending).unwrap();
            assert_eq!(consumed, pending.len(), "split at {}", split);

            assert_eq!(parser.stage(), Stage::Finished);
            assert_eq!(parser.verb(), whole.verb());
            assert_eq!(parser.url(), whole.url());
            assert_eq!(parser.header(), whole.header());
            assert_eq!(parser.body(), whole.body());
        }
        assert_eq!(whole.body(), b"hello world");
    }

    #[test]
    fn test_parse_errors() {
        let mut parser = RequestParser::new();
        assert!(parser.read_data(b"GET /\r\n\r\n").is_err());

        let mut parser = RequestParser::new();
        assert!(matches!(
            parser.read_data(b"GET / HTTP/11\r\n\r\n"),
            Err(Error::InvalidVersion(_))
        ));

        let mut parser = RequestParser::new();
        assert!(parser.read_data(b"GET / HTTP/1.1\r\nBad\r\n\r\n").is_err());

        let mut parser = RequestParser::new();
        assert!(matches!(
            parser.read_data(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
            Err(Error::Unsupported(_))
        ));

        let mut parser = RequestParser::new();
        assert!(parser.read_data(&vec![b'G'; MAX_REQUEST_LINE_LEN + 1]).is_err());
    }

    #[test]
    fn test_body_to_file_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");

        let mut parser = RequestParser::new();
        parser.save_body_to_file(&path);
        let wire = b"PUT /f HTTP/1.1\r\nContent-Length: 4\r\n\r\ndata";
        assert_eq!(parser.read_data(wire).unwrap(), wire.len());
        assert_eq!(parser.stage(), Stage::Finished);
        assert!(parser.body().is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        parser.reset();
        assert_eq!(parser.stage(), Stage::RequestLine);
        assert!(parser.header().is_empty());
    }
}
