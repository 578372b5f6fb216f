//! # tether-client
//!
//! Resilience and admission control for messaging-bridge providers.
//!
//! ## Features
//! - [`Transport`]: many concurrent calls plus server-pushed notifications
//!   multiplexed over one persistent connection
//! - [`Reconnector`]: heartbeat-driven health checks and reconnects with
//!   exponential backoff and jitter
//! - [`AdmissionControl`]: daily per-category quotas, a silence period for
//!   fresh accounts and paced outbound messages
//! - [`ProviderLink`] / [`Gateway`]: the three wired together for one
//!   remote endpoint
//! - [`ProviderRegistry`]: provider kinds looked up by name
//! - SOCKS5 proxying and TCP keepalive
//!
//! ## Quick start
//! ```rust,no_run
//! use tether_client::{Gateway, ProviderConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config  = ProviderConfig::load("provider.json")?;
//! let gateway = Gateway::from_config(&config)?;
//! gateway.start().await?;
//!
//! let delivered = gateway
//!     .send_message("sendText", serde_json::json!({ "to": "alice", "text": "hi" }))
//!     .await?;
//! println!("{delivered}");
//! gateway.stop().await;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod errors;
mod retry;
mod transport;

pub mod admission;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod link;
pub mod reconnect;
pub mod registry;
pub mod socks5;

pub use admission::{AdmissionControl, Category, Denial, QuotaConfig, QuotaStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ProviderConfig;
pub use errors::{CallError, ConfigError, ConnError, ReconnectError};
pub use gateway::{Gateway, GatewayError, Operation};
pub use link::ProviderLink;
pub use reconnect::{
    ConnectionState, ReconnectConfig, ReconnectStats, Reconnector, ReconnectorBuilder, WeakReconnector,
};
pub use registry::{Provider, ProviderRegistry, RegistryError};
pub use retry::Backoff;
pub use socks5::{Socks5Auth, Socks5Config};
pub use transport::{CloseReason, NotificationHandler, Transport, TransportConfig};

pub use tether_proto::{Framing, Notification, RemoteError};
pub use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

/// A boxed, sendable future; the return type of injected async capabilities.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lock a std mutex, ignoring poisoning.
///
/// Every critical section in this crate leaves its data consistent before
/// any code that could panic runs, so a poisoned lock is still usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
