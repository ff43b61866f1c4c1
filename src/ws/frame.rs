//! Frame header encoding and decoding

use super::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Final-fragment bit of the first header byte
pub const FIN: u8 = 0x80;

/// Mask bit of the second header byte
pub const MASK: u8 = 0x80;

/// Longest possible frame header: 2 + 8 length bytes + 4 mask bytes
pub const MAX_HEADER_LEN: usize = 14;

/// A decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// The raw first byte: FIN, RSV bits and opcode
    pub flags: u8,
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub header_len: usize,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Header plus payload
    pub fn frame_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// Decode the header at the start of `data`.
///
/// `Ok(None)` means more bytes are needed. The payload itself need not be
/// there yet.
pub fn decode_header(data: &[u8]) -> Result<Option<FrameHeader>> {
    if data.len() < 2 {
        return Ok(None);
    }

    let flags = data[0];
    let masked = data[1] & MASK != 0;
    let mut payload_len = u64::from(data[1] & 0x7f);
    let mut header_len = 2;

    if payload_len == 126 {
        if data.len() < 4 {
            return Ok(None);
        }
        payload_len = u64::from(u16::from_be_bytes([data[2], data[3]]));
        header_len = 4;
    } else if payload_len == 127 {
        if data.len() < 10 {
            return Ok(None);
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&data[2..10]);
        payload_len = u64::from_be_bytes(len);
        if payload_len & (1 << 63) != 0 {
            return Err(Error::Protocol("payload length has its top bit set".to_string()));
        }
        header_len = 10;
    }

    let mask = if masked {
        if data.len() < header_len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&data[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader {
        flags,
        fin: flags & FIN != 0,
        opcode: flags & 0x0f,
        mask,
        header_len,
        payload_len,
    }))
}

/// Append a frame to `out`, masking the payload with `mask` if given.
///
/// `flags` is the complete first byte, FIN included. Returns the number of
/// bytes appended.
pub fn encode_frame(out: &mut BytesMut, flags: u8, payload: &[u8], mask: Option<[u8; 4]>) -> usize {
    let start = out.len();
    let mask_bit = if mask.is_some() { MASK } else { 0 };
    let len = payload.len();

    out.reserve(MAX_HEADER_LEN + len);
    out.put_u8(flags);
    if len < 126 {
        out.put_u8(len as u8 | mask_bit);
    } else if len <= 0xffff {
        out.put_u8(126 | mask_bit);
        out.put_u16(len as u16);
    } else {
        out.put_u8(127 | mask_bit);
        out.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let offset = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[offset..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out.len() - start
}

/// XOR `data` with the masking key; applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
