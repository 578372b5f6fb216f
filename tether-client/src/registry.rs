//! Provider kinds, looked up by name.
//!
//! The [`Provider`] trait abstracts over how a backend reaches its remote
//! process so the bridge can run any of them from configuration alone.
//! [`ProviderRegistry`] maps a kind name (the `kind` field of a
//! [`ProviderConfig`]) to a factory for it.
//!
//! One kind ships built in:
//! * `"rpc"`: a [`Gateway`] over a JSON-RPC-style TCP endpoint.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::{BoxFuture, ConfigError, ConnError, Gateway, GatewayError, Operation, ProviderConfig};

// ─── Trait ────────────────────────────────────────────────────────────────────

/// A running messaging backend.
pub trait Provider: Send + Sync {
    /// Kind name this provider was created under (for log messages).
    fn name(&self) -> &str;

    /// Connect and begin supervising the connection.
    fn start(&self) -> BoxFuture<'_, Result<(), ConnError>>;

    /// Stop supervising and disconnect. Idempotent.
    fn stop(&self) -> BoxFuture<'_, ()>;

    fn is_connected(&self) -> bool;

    /// Perform one admission-gated outbound call.
    fn execute<'a>(
        &'a self,
        op:     Operation,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>>;
}

impl Provider for Gateway {
    fn name(&self) -> &str { Gateway::name(self) }

    fn start(&self) -> BoxFuture<'_, Result<(), ConnError>> {
        Box::pin(Gateway::start(self))
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(Gateway::stop(self))
    }

    fn is_connected(&self) -> bool { Gateway::is_connected(self) }

    fn execute<'a>(
        &'a self,
        op:     Operation,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, GatewayError>> {
        Box::pin(Gateway::execute(self, op, method, params))
    }
}

// ─── RegistryError ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RegistryError {
    /// A factory is already registered under this name.
    Duplicate(String),
    /// No factory is registered under this name.
    Unknown(String),
    /// The factory rejected the configuration.
    Config(ConfigError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate(name) => write!(f, "provider kind `{name}` is already registered"),
            Self::Unknown(name)   => write!(f, "unknown provider kind `{name}`"),
            Self::Config(e)       => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            _               => None,
        }
    }
}

impl From<ConfigError> for RegistryError {
    fn from(e: ConfigError) -> Self { Self::Config(e) }
}

// ─── ProviderRegistry ─────────────────────────────────────────────────────────

type Factory = Arc<dyn Fn(&ProviderConfig) -> Result<Box<dyn Provider>, RegistryError> + Send + Sync>;

/// Name → factory table.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Factory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            "rpc".to_string(),
            Arc::new(|config: &ProviderConfig| {
                Ok(Box::new(Gateway::from_config(config)?) as Box<dyn Provider>)
            }),
        );
        registry
    }

    /// Register `factory` under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&ProviderConfig) -> Result<Box<dyn Provider>, RegistryError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!("[registry] Registered provider kind `{name}`");
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Build the provider `config.kind` names.
    pub fn create(&self, config: &ProviderConfig) -> Result<Box<dyn Provider>, RegistryError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| RegistryError::Unknown(config.kind.clone()))?;
        factory(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered kind names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry").field("kinds", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    impl Provider for Null {
        fn name(&self) -> &str { "null" }
        fn start(&self) -> BoxFuture<'_, Result<(), ConnError>> { Box::pin(async { Ok(()) }) }
        fn stop(&self) -> BoxFuture<'_, ()> { Box::pin(async {}) }
        fn is_connected(&self) -> bool { true }
        fn execute<'a>(&'a self, _: Operation, _: &'a str, params: Value) -> BoxFuture<'a, Result<Value, GatewayError>> {
            Box::pin(async move { Ok(params) })
        }
    }

    fn null_factory(_: &ProviderConfig) -> Result<Box<dyn Provider>, RegistryError> {
        Ok(Box::new(Null))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ProviderRegistry::new();
        registry.register("null", null_factory).unwrap();
        assert!(matches!(registry.register("null", null_factory), Err(RegistryError::Duplicate(n)) if n == "null"));
    }

    #[test]
    fn defaults_include_rpc() {
        let mut registry = ProviderRegistry::with_defaults();
        assert!(registry.contains("rpc"));
        assert!(matches!(registry.register("rpc", null_factory), Err(RegistryError::Duplicate(_))));
        registry.register("null", null_factory).unwrap();
        assert_eq!(registry.names(), ["null", "rpc"]);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let registry = ProviderRegistry::with_defaults();
        let config = ProviderConfig { kind: "carrier-pigeon".into(), ..Default::default() };
        assert!(matches!(registry.create(&config), Err(RegistryError::Unknown(k)) if k == "carrier-pigeon"));
    }

    #[test]
    fn factory_errors_surface() {
        let registry = ProviderRegistry::with_defaults();
        let config = ProviderConfig { address: "  ".into(), ..Default::default() };
        assert!(matches!(registry.create(&config), Err(RegistryError::Config(ConfigError::Invalid(_)))));
    }

    #[tokio::test]
    async fn created_provider_is_usable() {
        let mut registry = ProviderRegistry::new();
        registry.register("null", null_factory).unwrap();
        let config = ProviderConfig { kind: "null".into(), ..Default::default() };
        let provider = registry.create(&config).unwrap();
        provider.start().await.unwrap();
        let echoed = provider.execute(Operation::Message, "echo", serde_json::json!([1, 2])).await.unwrap();
        assert_eq!(echoed, serde_json::json!([1, 2]));
        provider.stop().await;
    }

    #[tokio::test]
    async fn rpc_provider_builds_without_dialing() {
        let registry = ProviderRegistry::with_defaults();
        let provider = registry.create(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.name(), "rpc");
        assert!(!provider.is_connected());
    }
}
