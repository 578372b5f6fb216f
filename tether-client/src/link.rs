//! The live connection to one provider endpoint.
//!
//! [`ProviderLink`] owns the current [`Transport`] and supplies the two
//! capabilities a [`Reconnector`] needs: a health probe and a way to dial
//! again. Once bound to a reconnector it also reports unexpected closes,
//! so a dead peer is noticed immediately instead of at the next heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tether_proto::Notification;
use tokio_util::sync::CancellationToken;

use crate::reconnect::{ReconnectorBuilder, WeakReconnector};
use crate::{
    BoxFuture, CloseReason, ConnError, NotificationHandler, ReconnectError, Reconnector, Transport,
    TransportConfig, lock,
};

type Connector = Arc<dyn Fn() -> BoxFuture<'static, Result<Transport, ConnError>> + Send + Sync>;

struct LinkInner {
    name:        String,
    connector:   Connector,
    ping_method: Option<String>,
    current:     Mutex<Option<Transport>>,
    /// Bumped on every successful dial; lets a watcher tell whether the
    /// transport it watches is still the current one.
    generation:  AtomicU64,
    handler:     Mutex<Option<NotificationHandler>>,
    reconnector: Mutex<Option<WeakReconnector>>,
}

/// Owner of the current connection to one endpoint. Cheap to clone.
#[derive(Clone)]
pub struct ProviderLink {
    inner: Arc<LinkInner>,
}

impl ProviderLink {
    /// A link that dials `addr` over TCP with `config`.
    pub fn tcp(addr: impl Into<String>, config: TransportConfig) -> Self {
        let addr = addr.into();
        let name = addr.clone();
        Self::with_connector(name, move || {
            let addr   = addr.clone();
            let config = config.clone();
            Box::pin(async move { Transport::connect(&addr, &config).await })
        })
    }

    /// A link whose connections come from `connect`, e.g. an in-process
    /// pipe or a stream dialed by a collaborator.
    pub fn with_connector<F>(name: impl Into<String>, connect: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Transport, ConnError>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(LinkInner {
                name:        name.into(),
                connector:   Arc::new(connect),
                ping_method: None,
                current:     Mutex::new(None),
                generation:  AtomicU64::new(0),
                handler:     Mutex::new(None),
                reconnector: Mutex::new(None),
            }),
        }
    }

    /// Method the health probe calls; `None` trusts the socket state alone.
    ///
    /// Must be set before the link is shared.
    pub fn with_ping(mut self, method: Option<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.ping_method = method;
        } else {
            tracing::warn!("[link] {}: with_ping() on a shared link ignored", self.inner.name);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The current transport, if one has been established.
    pub fn transport(&self) -> Option<Transport> {
        lock(&self.inner.current).clone()
    }

    /// Route server-pushed notifications to `handler`, now and after every
    /// reconnect.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        *lock(&self.inner.handler) = Some(Arc::clone(&handler));
        if let Some(transport) = self.transport() {
            transport.set_shared_handler(handler);
        }
    }

    /// Report unexpected closes to `reconnector` from now on.
    pub fn bind(&self, reconnector: &Reconnector) {
        *lock(&self.inner.reconnector) = Some(reconnector.downgrade());
    }

    /// A reconnector builder with this link's probe and redial already
    /// installed. Call [`ProviderLink::bind`] with the result.
    pub fn supervisor(&self) -> ReconnectorBuilder {
        let probe  = self.clone();
        let redial = self.clone();
        Reconnector::builder()
            .check_alive(move |ctx| {
                let link = probe.clone();
                async move { link.check_alive(&ctx).await }
            })
            .do_reconnect(move |ctx| {
                let link = redial.clone();
                async move { link.reconnect(&ctx).await }
            })
    }

    /// Dial a fresh connection and make it current. Any previous connection
    /// is closed.
    pub async fn connect(&self) -> Result<Transport, ConnError> {
        let transport = (self.inner.connector)().await?;
        let handler = lock(&self.inner.handler).clone();
        if let Some(handler) = handler {
            transport.set_shared_handler(handler);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = lock(&self.inner.current).replace(transport.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.watch(&transport, generation);
        tracing::info!("[link] {} connected (generation {generation})", self.inner.name);
        Ok(transport)
    }

    /// `true` if the current connection is open and, when a ping method is
    /// configured, answers it.
    pub async fn check_alive(&self, ctx: &CancellationToken) -> bool {
        let Some(transport) = self.transport() else { return false };
        if !transport.is_connected() {
            return false;
        }
        let Some(method) = &self.inner.ping_method else { return true };
        match transport.call_with_cancel(method, Value::Null, None, ctx).await {
            Ok(_)  => true,
            Err(e) => {
                tracing::warn!("[link] {}: `{method}` probe failed: {e}", self.inner.name);
                false
            }
        }
    }

    /// One reconnect attempt: dial again and swap the new connection in.
    pub async fn reconnect(&self, ctx: &CancellationToken) -> Result<(), ReconnectError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(ReconnectError::other("reconnect cancelled")),
            dialed = self.connect() => dialed.map(|_| ()).map_err(ReconnectError::from),
        }
    }

    /// Close the current connection without reporting it as a failure.
    pub async fn close(&self) {
        let current = lock(&self.inner.current).take();
        if let Some(transport) = current {
            transport.close().await;
        }
    }

    fn watch(&self, transport: &Transport, generation: u64) {
        let closed = transport.watch_close();
        let link: Weak<LinkInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let reason = closed.await;
            if reason == CloseReason::Requested {
                return;
            }
            let Some(inner) = link.upgrade() else { return };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            tracing::warn!("[link] {} lost: {reason}", inner.name);
            let reconnector = lock(&inner.reconnector).as_ref().and_then(WeakReconnector::upgrade);
            if let Some(reconnector) = reconnector {
                reconnector.mark_disconnected();
                reconnector.reconnect_now();
            }
        });
    }
}

impl std::fmt::Debug for ProviderLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLink")
            .field("name", &self.inner.name)
            .field("ping_method", &self.inner.ping_method)
            .field("transport", &self.transport())
            .finish()
    }
}
