//! Error types for tether-client.
//!
//! The taxonomy follows what the caller can do about a failure:
//!
//! * [`ConnError`]: the connection could not be established; retry later.
//! * [`CallError`]: one call failed; other calls on the connection are
//!   unaffected unless [`CallError::is_transient`] says the link is gone.
//! * [`ReconnectError`]: a reconnect attempt failed; the reconnector retries.
//! * [`ConfigError`]: the configuration is unusable; surfaced once, never
//!   retried.
//!
//! Policy denials are not errors of this kind; see
//! [`crate::admission::Denial`].

use std::{fmt, io};
use std::time::Duration;

use tether_proto::{FrameError, RemoteError};

// ─── ConnError ────────────────────────────────────────────────────────────────

/// Failure to establish a transport connection.
#[derive(Debug)]
pub enum ConnError {
    /// The TCP dial failed.
    Dial { addr: String, source: io::Error },
    /// The dial did not complete within the connect timeout.
    Timeout { addr: String, after: Duration },
    /// The SOCKS5 proxy refused or broke the tunnel.
    Proxy { proxy: String, message: String },
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial { addr, source }      => write!(f, "dial {addr} failed: {source}"),
            Self::Timeout { addr, after }    => write!(f, "dial {addr} timed out after {after:?}"),
            Self::Proxy { proxy, message }   => write!(f, "SOCKS5 proxy {proxy}: {message}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dial { source, .. } => Some(source),
            _                         => None,
        }
    }
}

// ─── CallError ────────────────────────────────────────────────────────────────

/// The error type returned by [`crate::Transport::call`] and friends.
#[derive(Debug)]
pub enum CallError {
    /// No response within the call's timeout. The connection stays usable.
    Timeout(Duration),
    /// The caller's cancellation token fired first.
    Cancelled,
    /// The connection closed while the call was pending (or before it was sent).
    Closed,
    /// Writing the request failed; the connection has been torn down.
    Io(io::Error),
    /// The request could not be serialised or framed.
    Encode(FrameError),
    /// The result did not deserialise into the requested type.
    Decode(serde_json::Error),
    /// The remote rejected the call.
    Remote(RemoteError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(d)  => write!(f, "call timed out after {d:?}"),
            Self::Cancelled   => write!(f, "call cancelled"),
            Self::Closed      => write!(f, "connection closed"),
            Self::Io(e)       => write!(f, "I/O error: {e}"),
            Self::Encode(e)   => write!(f, "encode error: {e}"),
            Self::Decode(e)   => write!(f, "decode error: {e}"),
            Self::Remote(e)   => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e)     => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Remote(e) => Some(e),
            _               => None,
        }
    }
}

impl From<io::Error> for CallError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<FrameError> for CallError {
    fn from(e: FrameError) -> Self { Self::Encode(e) }
}

impl From<RemoteError> for CallError {
    fn from(e: RemoteError) -> Self { Self::Remote(e) }
}

impl CallError {
    /// Returns `true` if the failure means the connection itself is gone
    /// and the reconnector should take over.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

// ─── ReconnectError ───────────────────────────────────────────────────────────

/// Why one reconnect attempt failed.
#[derive(Debug)]
pub enum ReconnectError {
    /// Re-dialing failed.
    Conn(ConnError),
    /// The post-connect handshake call failed.
    Call(CallError),
    /// The attempt exceeded the reconnect timeout.
    TimedOut(Duration),
    /// Provider-specific failure.
    Other(String),
}

impl fmt::Display for ReconnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conn(e)     => write!(f, "{e}"),
            Self::Call(e)     => write!(f, "handshake failed: {e}"),
            Self::TimedOut(d) => write!(f, "reconnect attempt timed out after {d:?}"),
            Self::Other(s)    => write!(f, "{s}"),
        }
    }
}

impl std::error::Error for ReconnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Conn(e) => Some(e),
            Self::Call(e) => Some(e),
            _             => None,
        }
    }
}

impl From<ConnError> for ReconnectError {
    fn from(e: ConnError) -> Self { Self::Conn(e) }
}

impl From<CallError> for ReconnectError {
    fn from(e: CallError) -> Self { Self::Call(e) }
}

impl ReconnectError {
    /// Wrap a provider-specific failure message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

// ─── ConfigError ──────────────────────────────────────────────────────────────

/// The configuration cannot be used.
#[derive(Debug)]
pub enum ConfigError {
    /// A required capability (e.g. `check_alive`) was never supplied.
    MissingCapability(&'static str),
    /// An interval that drives a timer was zero.
    ZeroInterval(&'static str),
    /// A value is out of range or inconsistent.
    Invalid(String),
    /// The config file could not be read.
    Io(io::Error),
    /// The config file is not valid JSON for this schema.
    Json(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCapability(name) => write!(f, "missing required capability `{name}`"),
            Self::ZeroInterval(name)      => write!(f, "`{name}` must be greater than zero"),
            Self::Invalid(s)              => write!(f, "invalid configuration: {s}"),
            Self::Io(e)                   => write!(f, "cannot read configuration: {e}"),
            Self::Json(e)                 => write!(f, "cannot parse configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e)   => Some(e),
            Self::Json(e) => Some(e),
            _             => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self { Self::Json(e) }
}
