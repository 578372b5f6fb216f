//! # tether: resilient provider connections for messaging bridges
//!
//! `tether` is the convenience entry point over two focused sub-crates:
//!
//! | Sub-crate       | Role                                                        |
//! |-----------------|-------------------------------------------------------------|
//! | `tether-proto`  | Frames (request / response / notification) and byte framing |
//! | `tether-client` | Transport, Reconnector, AdmissionControl, Gateway, registry |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tether::{Gateway, ProviderConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config  = ProviderConfig::from_json_str(r#"{ "address": "127.0.0.1:19088" }"#)?;
//! let gateway = Gateway::from_config(&config)?;
//! gateway.start().await?;
//!
//! match gateway.send_message("sendText", serde_json::json!({ "text": "hi" })).await {
//!     Ok(result)              => println!("sent: {result}"),
//!     Err(e) if e.is_denial() => println!("refused by policy: {e}"),
//!     Err(e)                  => return Err(e.into()),
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`tether_proto`]: frames, framing and the incremental decoder.
pub use tether_proto as proto;

/// Re-export of [`tether_client`]: the async connection layer.
pub use tether_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use tether_client::{
    AdmissionControl, CallError, ConfigError, ConnError, ConnectionState, Denial, Gateway,
    GatewayError, Operation, Provider, ProviderConfig, ProviderLink, ProviderRegistry,
    ReconnectStats, Reconnector, Transport,
};
pub use tether_proto::{Framing, Notification, Request, Response};
