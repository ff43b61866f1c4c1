//! WebSocket protocol (RFC 6455)
//!
//! The handshake rides on the HTTP types in [`crate::http`]; afterwards a
//! [`WebSocketHandler`] replaces the HTTP handler on the socket and speaks
//! frames directly.
//!
//! - `frame`: frame header encoding and decoding, masking
//! - `handshake`: `Sec-WebSocket-Key` / `Sec-WebSocket-Accept`
//! - `handler`: the protocol handler, for both client and server roles

pub mod frame;
pub mod handler;
pub mod handshake;

pub use frame::{decode_header, encode_frame, FrameHeader};
pub use handler::{MessageHandler, WebSocketHandler};
pub use handshake::{compute_accept, generate_key};

use std::fmt;
use std::time::Duration;

/// Result type for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Socket is closed")]
    SocketClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Appended to the client key before hashing it into the accept value
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken
pub const WS_VERSION: &str = "13";

/// Interval between server pings
pub const PING_FREQUENCY: Duration = Duration::from_secs(18);

/// Delay before a fresh server handler sends its first ping
pub const INITIAL_PING_DELAY: Duration = Duration::from_millis(25);

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest message, after reassembling fragments, a handler accepts
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// `None` for the reserved opcodes
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Close, Ping and Pong
    pub fn is_control(&self) -> bool {
        self.as_u8() >= OpCode::Close.as_u8()
    }
}

/// Status code carried by a Close frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL_CLOSE: CloseCode = CloseCode(1000);
    pub const ENDPOINT_GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const PAYLOAD_NOT_ACCEPTABLE: CloseCode = CloseCode(1003);
    pub const RESERVED: CloseCode = CloseCode(1004);
    pub const RESERVED_NO_STATUS_CODE: CloseCode = CloseCode(1005);
    pub const RESERVED_ABNORMAL_CLOSE: CloseCode = CloseCode(1006);
    pub const MALFORMED_PAYLOAD: CloseCode = CloseCode(1007);
    pub const POLICY_VIOLATION: CloseCode = CloseCode(1008);
    pub const PAYLOAD_TOO_BIG: CloseCode = CloseCode(1009);
    pub const EXTENSION_REQUIRED: CloseCode = CloseCode(1010);
    pub const UNEXPECTED_CONDITION: CloseCode = CloseCode(1011);
    pub const RESERVED_TLS_FAILURE: CloseCode = CloseCode(1015);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Codes that only report a condition locally and must never appear
    /// in a Close frame.
    pub fn is_reserved(&self) -> bool {
        matches!(
            *self,
            CloseCode::RESERVED_NO_STATUS_CODE | CloseCode::RESERVED_ABNORMAL_CLOSE | CloseCode::RESERVED_TLS_FAILURE
        )
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
