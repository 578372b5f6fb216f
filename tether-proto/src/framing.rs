//! Byte-level framing.
//!
//! Two framings are supported on the same connection model:
//!
//! * [`Framing::Line`]: each payload is terminated by `\n` (a preceding
//!   `\r` is tolerated). Used by most local automation hooks.
//! * [`Framing::LengthPrefixed`]: each payload is prefixed with its 4-byte
//!   little-endian length. Used by relays that ship binary-safe payloads.
//!
//! [`FrameDecoder`] is incremental: push whatever the socket returned and
//! pull complete frames until it reports that more bytes are needed.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Default upper bound on a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Which framing a connection uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Newline-delimited payloads.
    #[default]
    Line,
    /// `[4-byte LE length][payload]`.
    LengthPrefixed,
}

/// Append one framed payload to `out`.
pub fn encode(framing: Framing, payload: &[u8], out: &mut Vec<u8>) -> Result<(), FrameError> {
    match framing {
        Framing::Line => {
            if payload.contains(&b'\n') {
                return Err(FrameError::EmbeddedNewline);
            }
            out.reserve(payload.len() + 1);
            out.extend_from_slice(payload);
            out.push(b'\n');
        }
        Framing::LengthPrefixed => {
            let len = u32::try_from(payload.len())
                .map_err(|_| FrameError::TooLarge { len: payload.len(), max: u32::MAX as usize })?;
            out.reserve(payload.len() + LEN_PREFIX);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(payload);
        }
    }
    Ok(())
}

// ─── FrameDecoder ─────────────────────────────────────────────────────────────

/// Incremental frame splitter.
#[derive(Debug)]
pub struct FrameDecoder {
    framing:       Framing,
    max_frame_len: usize,
    buf:           Vec<u8>,
    /// Line framing only: bytes of `buf` already known to hold no `\n`.
    scanned:       usize,
}

impl FrameDecoder {
    /// A decoder with the default frame limit.
    pub fn new(framing: Framing) -> Self {
        Self::with_max_frame_len(framing, DEFAULT_MAX_FRAME_LEN)
    }

    /// A decoder rejecting frames longer than `max_frame_len`.
    pub fn with_max_frame_len(framing: Framing, max_frame_len: usize) -> Self {
        Self { framing, max_frame_len, buf: Vec::new(), scanned: 0 }
    }

    /// Buffer bytes read from the connection.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.framing {
            Framing::Line           => self.next_line(),
            Framing::LengthPrefixed => self.next_prefixed(),
        }
    }

    fn next_line(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame_len {
                    return Err(FrameError::TooLarge { len: self.buf.len(), max: self.max_frame_len });
                }
                return Ok(None);
            };
            let end = self.scanned + offset;
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            self.scanned = 0;

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                log::trace!("[framing] skipping empty line");
                continue;
            }
            if line.len() > self.max_frame_len {
                return Err(FrameError::TooLarge { len: line.len(), max: self.max_frame_len });
            }
            return Ok(Some(line));
        }
    }

    fn next_prefixed(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge { len, max: self.max_frame_len });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_frames_split_across_pushes() {
        let mut d = FrameDecoder::new(Framing::Line);
        d.push(b"{\"a\"");
        assert!(d.next_frame().unwrap().is_none());
        d.push(b":1}\n{\"b\":2}\r\n\n{\"c\"");
        assert_eq!(d.next_frame().unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(d.next_frame().unwrap().unwrap(), b"{\"b\":2}");
        assert!(d.next_frame().unwrap().is_none());
        assert_eq!(d.buffered(), 4);
    }

    #[test]
    fn prefixed_frames_wait_for_full_body() {
        let mut wire = Vec::new();
        encode(Framing::LengthPrefixed, b"hello", &mut wire).unwrap();
        encode(Framing::LengthPrefixed, b"", &mut wire).unwrap();

        let mut d = FrameDecoder::new(Framing::LengthPrefixed);
        d.push(&wire[..6]);
        assert!(d.next_frame().unwrap().is_none());
        d.push(&wire[6..]);
        assert_eq!(d.next_frame().unwrap().unwrap(), b"hello");
        assert_eq!(d.next_frame().unwrap().unwrap(), b"");
        assert!(d.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_fatal() {
        let mut d = FrameDecoder::with_max_frame_len(Framing::LengthPrefixed, 8);
        d.push(&100u32.to_le_bytes());
        let err = d.next_frame().unwrap_err();
        assert!(err.is_fatal());

        let mut d = FrameDecoder::with_max_frame_len(Framing::Line, 8);
        d.push(b"0123456789");
        assert!(matches!(d.next_frame(), Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn line_encoding_rejects_newlines() {
        let mut out = Vec::new();
        assert!(matches!(encode(Framing::Line, b"a\nb", &mut out), Err(FrameError::EmbeddedNewline)));
        assert!(out.is_empty());
    }
}
