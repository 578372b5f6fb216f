//! Provider configuration.
//!
//! One JSON document describes one provider instance:
//!
//! ```json
//! {
//!   "kind": "rpc",
//!   "address": "127.0.0.1:19088",
//!   "ping_method": "ping",
//!   "transport": { "framing": "line", "call_timeout_ms": 30000 },
//!   "reconnect": { "heartbeat_interval_ms": 30000 },
//!   "quota": { "max_messages_per_day": 300, "silence_days": 3,
//!              "account_created_at": "2024-05-01T08:00:00Z" }
//! }
//! ```
//!
//! Every section and every field is optional and falls back to its
//! `Default`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, QuotaConfig, ReconnectConfig, TransportConfig};

/// Full configuration of one provider instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registry key selecting the provider implementation.
    pub kind:        String,
    /// `host:port` of the remote process.
    pub address:     String,
    /// Method called by the heartbeat to prove the peer is alive.
    /// `None` means "the connection is open" is proof enough.
    pub ping_method: Option<String>,
    pub transport:   TransportConfig,
    pub reconnect:   ReconnectConfig,
    pub quota:       QuotaConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind:        "rpc".to_string(),
            address:     "127.0.0.1:19088".to_string(),
            ping_method: Some("ping".to_string()),
            transport:   TransportConfig::default(),
            reconnect:   ReconnectConfig::default(),
            quota:       QuotaConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let cfg = Self::from_json_str(&text)?;
        tracing::info!("[config] Loaded {} ({} provider at {})", path.display(), cfg.kind, cfg.address);
        Ok(cfg)
    }

    /// Reject values that would make a component misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("`address` is empty".into()));
        }
        self.transport.validate()?;
        self.reconnect.validate()?;
        Ok(())
    }
}

/// `Duration` ⇄ integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` ⇄ optional integer milliseconds.
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None    => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tether_proto::Framing;

    #[test]
    fn empty_document_is_all_defaults() {
        let cfg = ProviderConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.kind, "rpc");
        assert_eq!(cfg.transport.call_timeout, Duration::from_secs(30));
        assert_eq!(cfg.reconnect.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.reconnect.base_backoff, Duration::from_secs(2));
        assert_eq!(cfg.reconnect.max_backoff, Duration::from_secs(300));
        assert_eq!(cfg.quota.max_messages_per_day, 500);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = ProviderConfig::from_json_str(r#"{
            "address": "10.0.0.5:7000",
            "ping_method": null,
            "transport": { "framing": "length_prefixed", "read_timeout_ms": 60000, "tcp_keepalive_ms": null },
            "quota": { "max_messages_per_day": 3, "silence_days": 3, "account_created_at": "2024-05-01T08:00:00Z" }
        }"#).unwrap();
        assert_eq!(cfg.address, "10.0.0.5:7000");
        assert_eq!(cfg.ping_method, None);
        assert_eq!(cfg.transport.framing, Framing::LengthPrefixed);
        assert_eq!(cfg.transport.read_timeout, Duration::from_secs(60));
        assert_eq!(cfg.transport.tcp_keepalive, None);
        assert_eq!(cfg.transport.call_timeout, Duration::from_secs(30));
        assert_eq!(cfg.quota.max_messages_per_day, 3);
        assert_eq!(cfg.quota.max_media_per_day, 100);
        assert!(cfg.quota.account_created_at.is_some());
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let err = ProviderConfig::from_json_str(r#"{"reconnect":{"heartbeat_interval_ms":0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval("heartbeat_interval")));
    }

    #[test]
    fn unknown_framing_is_a_parse_error() {
        assert!(matches!(
            ProviderConfig::from_json_str(r#"{"transport":{"framing":"carrier_pigeon"}}"#),
            Err(ConfigError::Json(_))
        ));
    }
}
