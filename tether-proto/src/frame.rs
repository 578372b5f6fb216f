//! Frame model: requests, responses and server-pushed notifications.
//!
//! Every frame is a single JSON object:
//!
//! | Shape        | Fields                                  |
//! |--------------|-----------------------------------------|
//! | Request      | `id`, `method`, `params`                |
//! | Response     | `id`, `result` *or* `error`             |
//! | Notification | `method`, `params` (no `id`)            |
//!
//! Id `0` is reserved and never assigned to a request, so a frame carrying
//! `"id": 0` is never routed to a pending call.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;

/// The reserved correlation id. Treated exactly like a missing `id`.
pub const NO_ID: u64 = 0;

// ─── Request ──────────────────────────────────────────────────────────────────

/// An outbound call awaiting a [`Response`] with the same `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique for the lifetime of a connection.
    pub id:     u64,
    /// Remote method name.
    pub method: String,
    /// Method parameters; `null` when the method takes none.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self { id, method: method.into(), params }
    }

    /// Serialise to a JSON payload (without framing).
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ─── Response ─────────────────────────────────────────────────────────────────

/// The reply to one [`Request`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id:     u64,
    /// Successful result; `null` if the call failed or returned nothing.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    /// Set when the remote rejected the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error:  Option<RemoteError>,
}

impl Response {
    /// A successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        Self { id, result, error: None }
    }

    /// A failed response.
    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self { id, result: Value::Null, error: Some(RemoteError { code, message: message.into() }) }
    }

    /// Split into the call outcome.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(e) => Err(e),
            None    => Ok(self.result),
        }
    }

    /// Serialise to a JSON payload (without framing).
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ─── RemoteError ──────────────────────────────────────────────────────────────

/// An error reported by the remote process for a single call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Provider-defined numeric code.
    pub code:    i64,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

// ─── Notification ─────────────────────────────────────────────────────────────

/// A server-pushed message with no corresponding request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Event name.
    pub method: String,
    /// Event payload.
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// Build a notification.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params }
    }

    /// Serialise to a JSON payload (without framing).
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// A frame received by the calling side of a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// Reply to an earlier request.
    Response(Response),
    /// Unsolicited push from the remote.
    Notification(Notification),
}

/// Superset of every frame shape; classification happens after parsing.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id:     Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error:  Option<RemoteError>,
}

/// Classify an incoming payload.
///
/// A non-zero `id` makes it a response, even if `method` is also present.
/// Otherwise a `method` makes it a notification.
pub fn decode(payload: &[u8]) -> Result<Incoming, FrameError> {
    let raw: RawFrame = serde_json::from_slice(payload)?;
    match (raw.id.filter(|&id| id != NO_ID), raw.method) {
        (Some(id), _) => Ok(Incoming::Response(Response {
            id,
            result: raw.result,
            error:  raw.error,
        })),
        (None, Some(method)) => Ok(Incoming::Notification(Notification {
            method,
            params: raw.params,
        })),
        (None, None) => Err(FrameError::Unclassified),
    }
}

/// Parse a payload as a [`Request`] (the serving side of a connection).
pub fn decode_request(payload: &[u8]) -> Result<Request, FrameError> {
    let req: Request = serde_json::from_slice(payload)?;
    if req.id == NO_ID {
        return Err(FrameError::Unclassified);
    }
    Ok(req)
}
