//! Admission-gated calls over a supervised link.
//!
//! Every outbound operation takes the same path:
//!
//! 1. refuse early if the link is not connected;
//! 2. ask [`AdmissionControl`] for permission and a pacing delay;
//! 3. wait out the delay;
//! 4. call through the current [`Transport`](crate::Transport).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::{
    AdmissionControl, CallError, ConfigError, ConnError, Denial, ProviderConfig, ProviderLink,
    Reconnector,
};

// ─── Operation ────────────────────────────────────────────────────────────────

/// Which quota an outbound call draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Message,
    Media,
    Group,
    Friend,
}

// ─── GatewayError ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum GatewayError {
    /// Refused by policy. Retrying before the policy changes is pointless.
    Denied(Denial),
    /// The link is down; the reconnector is (or will be) working on it.
    NotConnected,
    /// The call itself failed.
    Call(CallError),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(d)    => write!(f, "denied: {d}"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Call(e)      => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Denied(d)    => Some(d),
            Self::Call(e)      => Some(e),
            Self::NotConnected => None,
        }
    }
}

impl From<Denial> for GatewayError {
    fn from(d: Denial) -> Self { Self::Denied(d) }
}

impl From<CallError> for GatewayError {
    fn from(e: CallError) -> Self { Self::Call(e) }
}

impl GatewayError {
    /// `true` for policy denials, which the caller should surface rather
    /// than retry.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

// ─── Gateway ──────────────────────────────────────────────────────────────────

/// One provider endpoint with its reconnector and quota engine.
#[derive(Clone)]
pub struct Gateway {
    name:        String,
    link:        ProviderLink,
    reconnector: Reconnector,
    admission:   Arc<AdmissionControl>,
}

impl Gateway {
    /// Assemble from parts. `reconnector` should come from
    /// [`ProviderLink::supervisor`]; it is bound to `link` here.
    pub fn new(
        name:        impl Into<String>,
        link:        ProviderLink,
        reconnector: Reconnector,
        admission:   AdmissionControl,
    ) -> Self {
        link.bind(&reconnector);
        Self { name: name.into(), link, reconnector, admission: Arc::new(admission) }
    }

    /// A TCP-backed gateway described by `config`.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let link = ProviderLink::tcp(config.address.clone(), config.transport.clone())
            .with_ping(config.ping_method.clone());
        let reconnector = link.supervisor().config(config.reconnect.clone()).build()?;
        let admission   = AdmissionControl::new(config.quota.clone());
        Ok(Self::new(config.kind.clone(), link, reconnector, admission))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> &ProviderLink {
        &self.link
    }

    pub fn reconnector(&self) -> &Reconnector {
        &self.reconnector
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn is_connected(&self) -> bool {
        self.reconnector.is_connected()
    }

    /// Make the first connection and start the heartbeat.
    ///
    /// A failure here is returned as-is and not retried: an endpoint that
    /// is unreachable at startup is treated as misconfigured.
    pub async fn start(&self) -> Result<(), ConnError> {
        tracing::info!("[gateway] Starting {} ({})", self.name, self.link.name());
        self.link.connect().await?;
        self.reconnector.mark_connected();
        self.reconnector.start();
        Ok(())
    }

    /// Stop supervising and close the connection.
    pub async fn stop(&self) {
        self.reconnector.stop();
        self.link.close().await;
        tracing::info!("[gateway] Stopped {}", self.name);
    }

    pub async fn send_message(&self, method: &str, params: impl Serialize) -> Result<Value, GatewayError> {
        self.execute(Operation::Message, method, params).await
    }

    pub async fn send_media(&self, method: &str, params: impl Serialize) -> Result<Value, GatewayError> {
        self.execute(Operation::Media, method, params).await
    }

    pub async fn group_operation(&self, method: &str, params: impl Serialize) -> Result<Value, GatewayError> {
        self.execute(Operation::Group, method, params).await
    }

    pub async fn friend_operation(&self, method: &str, params: impl Serialize) -> Result<Value, GatewayError> {
        self.execute(Operation::Friend, method, params).await
    }

    /// Admit, pace and perform one outbound call.
    pub async fn execute(
        &self,
        op:     Operation,
        method: &str,
        params: impl Serialize,
    ) -> Result<Value, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let delay = match op {
            Operation::Message => self.admission.check_message()?,
            Operation::Media   => self.admission.check_media()?,
            Operation::Group   => self.admission.check_group_operation().map(|()| Duration::ZERO)?,
            Operation::Friend  => self.admission.check_friend_operation().map(|()| Duration::ZERO)?,
        };
        if !delay.is_zero() {
            tracing::debug!("[gateway] Pacing `{method}` by {delay:?}");
            tokio::time::sleep(delay).await;
        }
        let transport = self.link.transport().ok_or(GatewayError::NotConnected)?;
        Ok(transport.call(method, params, None).await?)
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.name)
            .field("link", &self.link)
            .field("reconnector", &self.reconnector)
            .finish_non_exhaustive()
    }
}
