//! Opening handshake keys

use super::WS_GUID;
use base64::{prelude::BASE64_STANDARD, Engine};
use sha1::{digest::Digest, Sha1};

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`
pub fn compute_accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A fresh random client nonce
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(nonce)
}
