//! HTTP header fields
//!
//! An ordered list of name/value pairs with case-insensitive lookup.
//! Duplicates are kept (multiple `Cookie` or `Set-Cookie` entries), and
//! lookups return the first match. Field counts are small, so everything
//! is a linear scan.

use super::{find_crlf, CRLF};
use bytes::BytesMut;
use std::fmt;

/// Maximum number of fields in one header
pub const MAX_NUMBER_FIELDS: usize = 128;

/// Maximum length of a field name
pub const MAX_FIELD_NAME_LEN: usize = 512;

/// Maximum length of a field value
pub const MAX_FIELD_VALUE_LEN: usize = 9 * 1024;

/// Maximum length of a complete header
pub const MAX_HEADER_LEN: usize = MAX_NUMBER_FIELDS * (MAX_FIELD_NAME_LEN + MAX_FIELD_VALUE_LEN);

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CONNECTION: &str = "Connection";
pub const COOKIE: &str = "Cookie";

/// Result of parsing a header block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    New,
    Incomplete,
    InvalidField,
    TooManyFields,
    Complete,
}

/// The tokens of the `Connection` header we act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionToken {
    None,
    Close,
    KeepAlive,
    Upgrade,
}

/// HTTP header collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    /// Create a new empty header
    pub fn new() -> Self {
        Header { fields: Vec::new() }
    }

    /// Parse a complete header block from `data`.
    ///
    /// Nothing is consumed until the terminating blank line has arrived; on
    /// `Complete` the returned length includes it. Fields are appended to
    /// any already present.
    pub fn parse(&mut self, data: &[u8]) -> (HeaderState, usize) {
        let end = match find_header_end(data) {
            Some(end) => end,
            None if data.len() > MAX_HEADER_LEN => return (HeaderState::InvalidField, 0),
            None => return (HeaderState::Incomplete, 0),
        };
        if end > MAX_HEADER_LEN + 2 {
            return (HeaderState::InvalidField, 0);
        }

        let mut fields = Vec::new();
        let mut pos = 0;
        while pos < end {
            let line_len = match find_crlf(&data[pos..end]) {
                Some(len) => len,
                None => return (HeaderState::InvalidField, 0),
            };
            if line_len == 0 {
                pos += 2;
                break;
            }
            if fields.len() >= MAX_NUMBER_FIELDS {
                return (HeaderState::TooManyFields, 0);
            }

            match parse_field(&data[pos..pos + line_len]) {
                Some(field) => fields.push(field),
                None => return (HeaderState::InvalidField, 0),
            }
            pos += line_len + 2;
        }

        self.fields.extend(fields);
        (HeaderState::Complete, pos)
    }

    /// Append a field, keeping any existing ones with the same name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replace the value of the first field named `name`, or append it
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(field) => field.1 = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Check if a field exists
    pub fn has(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove the first field named `name`; returns whether one was found
    pub fn remove(&mut self, name: &str) -> bool {
        match self.fields.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(index) => {
                self.fields.remove(index);
                true
            }
            None => false,
        }
    }

    /// Get the first value for a field (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get the first value for a field, or `default`
    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Get all values for a field (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Iterate over all fields in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    pub fn has_content_type(&self) -> bool {
        self.has(CONTENT_TYPE)
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set(CONTENT_TYPE, content_type);
    }

    /// The `Content-Length` value, if present and a valid non-negative number
    pub fn content_length(&self) -> Option<u64> {
        self.get(CONTENT_LENGTH)
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    pub fn has_content_length(&self) -> bool {
        self.has(CONTENT_LENGTH)
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.set(CONTENT_LENGTH, length.to_string());
    }

    pub fn transfer_encoding(&self) -> Option<&str> {
        self.get(TRANSFER_ENCODING)
    }

    /// True when the final transfer coding is `chunked`.
    ///
    /// Only the last token of the last `Transfer-Encoding` field counts.
    pub fn is_chunked_transfer_encoding(&self) -> bool {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(TRANSFER_ENCODING))
            .and_then(|(_, v)| v.rsplit(',').next())
            .map_or(false, |token| token.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Check whether the `Connection` header lists `token`
    pub fn has_connection_token(&self, token: &str) -> bool {
        self.get(CONNECTION).map_or(false, |value| {
            value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    /// The `Connection` header interpreted as one of the tokens we handle
    pub fn connection_token(&self) -> ConnectionToken {
        if self.has_connection_token("close") {
            ConnectionToken::Close
        } else if self.has_connection_token("upgrade") {
            ConnectionToken::Upgrade
        } else if self.has_connection_token("keep-alive") {
            ConnectionToken::KeepAlive
        } else {
            ConnectionToken::None
        }
    }

    /// Set the `Connection` header; `None` removes it
    pub fn set_connection_token(&mut self, token: ConnectionToken) {
        match token {
            ConnectionToken::None => {
                self.remove(CONNECTION);
            }
            ConnectionToken::Close => self.set(CONNECTION, "close"),
            ConnectionToken::KeepAlive => self.set(CONNECTION, "Keep-Alive"),
            ConnectionToken::Upgrade => self.set(CONNECTION, "Upgrade"),
        }
    }

    /// Add a raw `Cookie` header
    pub fn add_cookie(&mut self, cookie: impl Into<String>) {
        self.add(COOKIE, cookie);
    }

    /// Add a `Cookie` header built from name/value pairs
    pub fn add_cookies<K: AsRef<str>, V: AsRef<str>>(&mut self, pairs: &[(K, V)]) {
        let cookie = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
            .collect::<Vec<_>>()
            .join("; ");
        self.add_cookie(cookie);
    }

    /// All cookies from every `Cookie` header, in order
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.get_all(COOKIE)
            .into_iter()
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                match pair.split_once('=') {
                    Some((name, value)) => Some((name.trim().to_string(), value.trim().to_string())),
                    None => Some((pair.to_string(), String::new())),
                }
            })
            .collect()
    }

    /// Serialize the fields, without the terminating blank line
    pub fn write_data(&self, out: &mut BytesMut) {
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF.as_bytes());
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            write!(f, "{}: {}{}", name, value, CRLF)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Header {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Header {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Offset just past the blank line ending a header block. A block that is
/// only the blank line is an empty header.
fn find_header_end(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\r\n") {
        return Some(2);
    }
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_field(line: &[u8]) -> Option<(String, String)> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];
    if name.is_empty()
        || name.len() > MAX_FIELD_NAME_LEN
        || name.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return None;
    }

    let value = line[colon + 1..].trim_ascii();
    if value.len() > MAX_FIELD_VALUE_LEN {
        return None;
    }

    Some((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}
