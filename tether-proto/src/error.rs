//! Error type for frame encoding, decoding and byte framing.

use std::fmt;

/// Errors produced while turning bytes into frames or frames into bytes.
#[derive(Debug)]
pub enum FrameError {
    /// The payload was not valid JSON, or did not match the expected shape.
    Json(serde_json::Error),
    /// The payload parsed as JSON but is neither a response (non-zero `id`)
    /// nor a notification (`method` without `id`).
    Unclassified,
    /// A frame exceeded the configured maximum length.
    TooLarge {
        /// Declared or observed length of the offending frame.
        len: usize,
        /// The configured limit.
        max: usize,
    },
    /// A line-framed payload contained a raw `\n`.
    EmbeddedNewline,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e)             => write!(f, "invalid frame payload: {e}"),
            Self::Unclassified        => write!(f, "frame is neither a response nor a notification"),
            Self::TooLarge { len, max } => write!(f, "frame of {len} bytes exceeds limit of {max} bytes"),
            Self::EmbeddedNewline     => write!(f, "line-framed payload contains a newline"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _             => None,
        }
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self { Self::Json(e) }
}

impl FrameError {
    /// Returns `true` if the byte stream can no longer be resynchronised
    /// after this error (the connection must be torn down).
    ///
    /// Payload-level errors only affect one frame; size violations leave
    /// the decoder unable to find the next frame boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TooLarge { .. })
    }
}
