//! Status codes and the response status line

use super::{find_crlf, CRLF, VERS_1_1};
use bytes::BytesMut;
use std::fmt;

/// Length of "HTTP/x.y"
pub const VERSION_LEN: usize = 8;

/// Length of the numeric status code
pub const STATUS_CODE_LEN: usize = 3;

pub const MAX_REASON_PHRASE_LEN: usize = 512;

/// Shortest possible status line, "HTTP/0.0 000\r\n"
pub const MIN_STATUS_LINE_LEN: usize = VERSION_LEN + 1 + STATUS_CODE_LEN + 2;

pub const MAX_STATUS_LINE_LEN: usize = MIN_STATUS_LINE_LEN + 1 + MAX_REASON_PHRASE_LEN;

/// Result of parsing a single protocol line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldParseState {
    Unknown,
    Incomplete,
    Invalid,
    Valid,
}

/// Class of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCodeClass {
    Invalid,
    Informational,
    Successful,
    Redirection,
    ClientError,
    ServerError,
}

/// Classify a numeric status code
pub fn status_category(code: u16) -> StatusCodeClass {
    match code {
        100..=199 => StatusCodeClass::Informational,
        200..=299 => StatusCodeClass::Successful,
        300..=399 => StatusCodeClass::Redirection,
        400..=499 => StatusCodeClass::ClientError,
        500..=599 => StatusCodeClass::ServerError,
        _ => StatusCodeClass::Invalid,
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const PROCESSING: StatusCode = StatusCode(102);
    pub const EARLY_HINTS: StatusCode = StatusCode(103);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const ACCEPTED: StatusCode = StatusCode(202);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const PARTIAL_CONTENT: StatusCode = StatusCode(206);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const SEE_OTHER: StatusCode = StatusCode(303);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const TEMPORARY_REDIRECT: StatusCode = StatusCode(307);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const CONFLICT: StatusCode = StatusCode(409);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const UPGRADE_REQUIRED: StatusCode = StatusCode(426);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);

    /// Wrap any numeric code; range checking is `status_category`'s job
    pub const fn from_u16(code: u16) -> Self {
        StatusCode(code)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn category(&self) -> StatusCodeClass {
        status_category(self.0)
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            102 => "Processing",
            103 => "Early Hints",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            207 => "Multi-Status",
            208 => "Already Reported",
            226 => "IM Used",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Range Not Satisfiable",
            417 => "Expectation Failed",
            421 => "Misdirected Request",
            422 => "Unprocessable Entity",
            423 => "Locked",
            424 => "Failed Dependency",
            425 => "Too Early",
            426 => "Upgrade Required",
            428 => "Precondition Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            451 => "Unavailable For Legal Reasons",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            506 => "Variant Also Negotiates",
            507 => "Insufficient Storage",
            508 => "Loop Detected",
            510 => "Not Extended",
            511 => "Network Authentication Required",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// The first line of a response: `HTTP/<major>.<minor> <code> <reason>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    http_version: String,
    version_major: u32,
    version_minor: u32,
    status_code: u16,
    reason_phrase: String,
}

impl StatusLine {
    /// A status line for `code` with its canonical reason phrase
    pub fn new(code: StatusCode) -> Self {
        StatusLine {
            http_version: VERS_1_1.to_string(),
            version_major: 1,
            version_minor: 1,
            status_code: code.as_u16(),
            reason_phrase: code.reason_phrase().to_string(),
        }
    }

    /// Parse a status line from the start of `data`.
    ///
    /// On `Valid` the returned length is the line including its CRLF.
    pub fn parse(&mut self, data: &[u8]) -> (FieldParseState, usize) {
        // Reject garbage early, without waiting for a line ending.
        let prefix_len = data.len().min(5);
        if data[..prefix_len] != b"HTTP/"[..prefix_len] {
            return (FieldParseState::Invalid, 0);
        }

        let line_len = match find_crlf(data) {
            Some(len) => len,
            None if data.len() > MAX_STATUS_LINE_LEN => return (FieldParseState::Invalid, 0),
            None => return (FieldParseState::Incomplete, 0),
        };
        if line_len + 2 > MAX_STATUS_LINE_LEN || line_len + 2 < MIN_STATUS_LINE_LEN {
            return (FieldParseState::Invalid, 0);
        }
        let line = &data[..line_len];

        let version = &line[..VERSION_LEN];
        let (major, minor) = match (version[5], version[6], version[7]) {
            (major, b'.', minor) if major.is_ascii_digit() && minor.is_ascii_digit() => {
                (u32::from(major - b'0'), u32::from(minor - b'0'))
            }
            _ => return (FieldParseState::Invalid, 0),
        };
        if line[VERSION_LEN] != b' ' {
            return (FieldParseState::Invalid, 0);
        }

        let code_start = VERSION_LEN + 1;
        let code_bytes = &line[code_start..code_start + STATUS_CODE_LEN];
        if !code_bytes.iter().all(u8::is_ascii_digit) {
            return (FieldParseState::Invalid, 0);
        }
        let code = code_bytes
            .iter()
            .fold(0u16, |acc, &b| acc * 10 + u16::from(b - b'0'));
        if status_category(code) == StatusCodeClass::Invalid {
            return (FieldParseState::Invalid, 0);
        }

        let rest = &line[code_start + STATUS_CODE_LEN..];
        let reason = match rest.split_first() {
            None => &[][..],
            Some((b' ', reason)) => reason.trim_ascii(),
            Some(_) => return (FieldParseState::Invalid, 0),
        };
        if reason.len() > MAX_REASON_PHRASE_LEN {
            return (FieldParseState::Invalid, 0);
        }

        self.http_version = String::from_utf8_lossy(version).into_owned();
        self.version_major = major;
        self.version_minor = minor;
        self.status_code = code;
        self.reason_phrase = String::from_utf8_lossy(reason).into_owned();
        (FieldParseState::Valid, line_len + 2)
    }

    /// Serialize the line including its CRLF
    pub fn write_data(&self, out: &mut BytesMut) {
        out.extend_from_slice(self.to_string().as_bytes());
        out.extend_from_slice(CRLF.as_bytes());
    }

    pub fn http_version(&self) -> &str {
        &self.http_version
    }

    pub fn version_major(&self) -> u32 {
        self.version_major
    }

    pub fn version_minor(&self) -> u32 {
        self.version_minor
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn status_category(&self) -> StatusCodeClass {
        status_category(self.status_code)
    }
}

/// An unparsed status line: version 1.1, code 0 (invalid), no reason.
impl Default for StatusLine {
    fn default() -> Self {
        StatusLine {
            http_version: VERS_1_1.to_string(),
            version_major: 1,
            version_minor: 1,
            status_code: 0,
            reason_phrase: String::new(),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.http_version, self.status_code, self.reason_phrase)
    }
}
