//! Chunked transfer encoding support
//!
//! Incremental decoding of `Transfer-Encoding: chunked` response bodies,
//! and the encoding of single chunks for responses built by hand.

use super::{find_crlf, Error, Result, CRLF};
use bytes::BytesMut;
use std::io;

/// Longest chunk-size line (size plus extensions) we wait for
const MAX_CHUNK_LINE_LEN: usize = 1024;

/// Chunked decoder
///
/// Decodes HTTP chunked transfer encoding as bytes arrive, handing the
/// chunk payloads to a sink.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_size: u64,
    chunk_read: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData,
    ChunkEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    /// Decode as much of `input` as possible.
    ///
    /// Returns (bytes_consumed, is_complete). Partial size lines and
    /// trailers are left unconsumed until their CRLF arrives.
    pub fn decode<F>(&mut self, input: &[u8], mut sink: F) -> Result<(usize, bool)>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                DecoderState::ChunkSize => {
                    let Some(line_len) = find_crlf(&input[pos..]) else {
                        if input.len() - pos > MAX_CHUNK_LINE_LEN {
                            return Err(Error::InvalidChunkSize("chunk size line too long".to_string()));
                        }
                        break;
                    };

                    let line = String::from_utf8_lossy(&input[pos..pos + line_len]);
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    self.chunk_size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;

                    pos += line_len + 2;
                    self.chunk_read = 0;
                    self.state = if self.chunk_size == 0 {
                        DecoderState::Trailer
                    } else {
                        DecoderState::ChunkData
                    };
                }

                DecoderState::ChunkData => {
                    let remaining_in_chunk = self.chunk_size - self.chunk_read;
                    let available = (input.len() - pos) as u64;
                    let to_copy = remaining_in_chunk.min(available) as usize;

                    sink(&input[pos..pos + to_copy])?;
                    pos += to_copy;
                    self.chunk_read += to_copy as u64;

                    if self.chunk_read == self.chunk_size {
                        self.state = DecoderState::ChunkEnd;
                    }
                }

                DecoderState::ChunkEnd => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(Error::Parse("Expected CRLF after chunk".to_string()));
                    }
                    pos += 2;
                    self.state = DecoderState::ChunkSize;
                }

                DecoderState::Trailer => {
                    // Trailer fields are skipped up to the empty line.
                    let Some(line_len) = find_crlf(&input[pos..]) else {
                        break;
                    };
                    pos += line_len + 2;
                    if line_len == 0 {
                        self.state = DecoderState::Complete;
                    }
                }

                DecoderState::Complete => break,
            }
        }

        Ok((pos, self.state == DecoderState::Complete))
    }

    /// Check if decoding is complete
    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one chunk to `out`. An empty `data` writes the last chunk.
pub fn encode_chunk(out: &mut BytesMut, data: &[u8]) {
    out.extend_from_slice(format!("{:x}{}", data.len(), CRLF).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<(Vec<u8>, usize, bool)> {
        let mut decoder = ChunkedDecoder::new();
        let mut output = Vec::new();
        let (consumed, complete) = decoder.decode(input, |data| {
            output.extend_from_slice(data);
            Ok(())
        })?;
        Ok((output, consumed, complete))
    }

    #[test]
    fn test_encode_chunks() {
        let mut out = BytesMut::new();
        encode_chunk(&mut out, b"Hello");
        encode_chunk(&mut out, b"World");
        encode_chunk(&mut out, b"");
        assert_eq!(&out[..], b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n");
    }

    #[test]
    fn test_decode_multiple_chunks() {
        let input = b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n";
        let (output, consumed, complete) = decode_all(input).unwrap();
        assert_eq!(output, b"HelloWorld");
        assert_eq!(consumed, input.len());
        assert!(complete);
    }

    #[test]
    fn test_decode_with_extension_and_trailer() {
        let input = b"5;extension=value\r\nHello\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let (output, consumed, complete) = decode_all(input).unwrap();
        assert_eq!(output, b"Hello");
        assert!(complete);
        assert_eq!(&input[consumed..], b"NEXT");
    }

    #[test]
    fn test_decoder_incremental() {
        let input = b"a\r\n0123456789\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut output = Vec::new();
        let mut pending = Vec::new();

        for byte in input.iter() {
            pending.push(*byte);
            let (consumed, _) = decoder
                .decode(&pending, |data| {
                    output.extend_from_slice(data);
                    Ok(())
                })
                .unwrap();
            pending.drain(..consumed);
        }

        assert_eq!(output, b"0123456789abc");
        assert!(decoder.is_complete());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert!(matches!(decode_all(b"zz\r\n"), Err(Error::InvalidChunkSize(_))));
        assert!(matches!(decode_all(b"3\r\nabcX\r\n"), Err(Error::Parse(_))));

        let long_line = vec![b'1'; MAX_CHUNK_LINE_LEN + 1];
        assert!(decode_all(&long_line).is_err());
    }

    #[test]
    fn test_sink_error_propagates() {
        let mut decoder = ChunkedDecoder::new();
        let result = decoder.decode(b"3\r\nabc\r\n", |_| {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        });
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
