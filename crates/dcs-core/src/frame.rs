//! Self-delimiting JSON framing.
//!
//! Frames are bare UTF-8 JSON values written back to back with no length
//! prefix or delimiter; whitespace between frames is tolerated. The decoder
//! buffers incoming bytes and yields one value per successful parse, using
//! the streaming parser's consumed-byte offset to advance the cursor.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("malformed frame: {0}")]
    Syntax(String),
}

/// Serialize one value into the bytes of a single frame.
///
/// The caller is expected to issue exactly one socket write per returned
/// buffer so concurrent writers cannot interleave partial frames.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let encoded = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Incremental decoder for concatenated JSON frames.
///
/// Frames are pulled one at a time so that protocols which follow a frame
/// with raw bytes (the HTTP endpoint bridge) can drain those bytes via
/// [`take_buffered`](Self::take_buffered) before framing resumes.
pub struct JsonFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl JsonFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    /// Append raw bytes received from the transport.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Try to parse the next complete frame off the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffered prefix is an incomplete value;
    /// the caller reads more bytes and retries. A syntax error poisons the
    /// stream and clears the buffer.
    pub fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        let skip = self
            .pending
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(self.pending.len());
        if skip > 0 {
            self.pending.drain(..skip);
        }
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut stream = serde_json::Deserializer::from_slice(&self.pending).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.pending.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(err)) if err.is_eof() => {
                if self.pending.len() > self.max_frame_bytes {
                    let size = self.pending.len();
                    self.pending.clear();
                    return Err(FrameError::OversizedFrame {
                        size,
                        max: self.max_frame_bytes,
                    });
                }
                Ok(None)
            }
            Some(Err(err)) => {
                self.pending.clear();
                Err(FrameError::Syntax(err.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Pull up to `len` already-buffered raw bytes out of the decoder.
    pub fn take_buffered(&mut self, len: usize) -> Vec<u8> {
        let take = len.min(self.pending.len());
        self.pending.drain(..take).collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for JsonFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(decoder: &mut JsonFrameDecoder) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn yields_concatenated_values_in_order() {
        let mut decoder = JsonFrameDecoder::default();
        let values = [
            json!({"version": 12}),
            json!({"command": "GetObjectModel"}),
            json!([1, 2, 3]),
            json!("bare string"),
        ];
        for value in &values {
            decoder.push_bytes(&encode_frame(value, DEFAULT_MAX_FRAME_BYTES).expect("encode"));
        }

        assert_eq!(drain(&mut decoder), values);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn reassembles_frames_split_at_arbitrary_boundaries() {
        let value = json!({"command": "SimpleCode", "code": "G28", "channel": "HTTP"});
        let bytes = encode_frame(&value, DEFAULT_MAX_FRAME_BYTES).expect("encode");

        for split in 1..bytes.len() {
            let mut decoder = JsonFrameDecoder::default();
            decoder.push_bytes(&bytes[..split]);
            assert_eq!(decoder.next_frame().expect("first chunk"), None);
            decoder.push_bytes(&bytes[split..]);
            assert_eq!(decoder.next_frame().expect("second chunk"), Some(value.clone()));
        }
    }

    #[test]
    fn tolerates_whitespace_between_frames() {
        let mut decoder = JsonFrameDecoder::default();
        decoder.push_bytes(
            b"  {\"success\":true} \n\t {\"success\":false,\"errorType\":\"NotFound\",\"errorMessage\":\"x\"}\n",
        );
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], json!({"success": true}));
    }

    #[test]
    fn syntax_error_is_terminal() {
        let mut decoder = JsonFrameDecoder::default();
        decoder.push_bytes(b"{\"a\":}");
        let err = decoder.next_frame().expect_err("syntax");
        assert!(matches!(err, FrameError::Syntax(_)));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn rejects_unbounded_partial_frame() {
        let mut decoder = JsonFrameDecoder::new(64);
        let huge = format!("{{\"blob\":\"{}\"", "x".repeat(128));
        decoder.push_bytes(huge.as_bytes());
        let err = decoder.next_frame().expect_err("oversized");
        assert!(matches!(err, FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn raw_body_bytes_survive_between_frames() {
        let mut decoder = JsonFrameDecoder::default();
        let mut bytes =
            encode_frame(&json!({"contentLength": 4}), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        bytes.extend_from_slice(b"BODY{\"success\":true}");
        decoder.push_bytes(&bytes);

        assert_eq!(
            decoder.next_frame().expect("header"),
            Some(json!({"contentLength": 4}))
        );
        assert_eq!(decoder.take_buffered(4), b"BODY");
        assert_eq!(
            decoder.next_frame().expect("resume framing"),
            Some(json!({"success": true}))
        );
    }
}
