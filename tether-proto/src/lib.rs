//! Wire layer for tether provider connections.
//!
//! This crate handles:
//! * The frame model (requests, responses, notifications) as JSON objects
//! * Byte framing: newline-delimited or 4-byte length-prefixed
//! * Incremental decoding of partially received frames
//!
//! It is intentionally I/O-free: bring your own socket. The async client in
//! `tether-client` drives it over tokio streams.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod framing;

pub use error::FrameError;
pub use frame::{Incoming, NO_ID, Notification, RemoteError, Request, Response, decode, decode_request};
pub use framing::{DEFAULT_MAX_FRAME_LEN, FrameDecoder, Framing, encode};
