//! Connection health and recovery.
//!
//! A [`Reconnector`] knows nothing about sockets. It is given two
//! capabilities when built:
//!
//! * `check_alive(ctx)`: is the link still healthy? Run on every heartbeat
//!   tick while connected, bounded by `check_timeout`.
//! * `do_reconnect(ctx)`: tear down and re-establish the link. Run by the
//!   reconnect loop, bounded by `reconnect_timeout`.
//!
//! The `ctx` token handed to both is cancelled when the bound expires or the
//! reconnector is stopped.
//!
//! ```text
//! Disconnected ──tick──────────────▶ Reconnecting
//! Connected ──check_alive false──▶ Disconnected ──▶ Reconnecting
//! Reconnecting ──do_reconnect ok──▶ Connected
//! Reconnecting ──do_reconnect err─▶ Reconnecting (next backoff)
//! any ──stop──▶ Stopped
//! ```
//!
//! At most one reconnect loop runs per reconnector: each loop owns a token
//! stored in the state, and declaring the link connected cancels it. Neither
//! the heartbeat nor the loop keeps the reconnector alive; dropping the last
//! handle stops both. Hooks are always invoked with no lock held, so they may
//! call back into the reconnector.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::millis;
use crate::{Backoff, BoxFuture, ConfigError, ReconnectError, lock};

type CheckAliveFn  = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;
type DoReconnectFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), ReconnectError>> + Send + Sync>;
type HookFn        = Arc<dyn Fn() + Send + Sync>;

// ─── ReconnectConfig ──────────────────────────────────────────────────────────

/// Timing of heartbeats and reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "base_backoff_ms", with = "millis")]
    pub base_backoff:       Duration,
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff:        Duration,
    /// Bound on one `check_alive` probe.
    #[serde(rename = "check_timeout_ms", with = "millis")]
    pub check_timeout:      Duration,
    /// Bound on one `do_reconnect` attempt.
    #[serde(rename = "reconnect_timeout_ms", with = "millis")]
    pub reconnect_timeout:  Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            base_backoff:       Duration::from_secs(2),
            max_backoff:        Duration::from_secs(300),
            check_timeout:      Duration::from_secs(10),
            reconnect_timeout:  Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("base_backoff",       self.base_backoff),
            ("check_timeout",      self.check_timeout),
            ("reconnect_timeout",  self.reconnect_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.max_backoff < self.base_backoff {
            return Err(ConfigError::Invalid(format!(
                "max_backoff ({:?}) is below base_backoff ({:?})",
                self.max_backoff, self.base_backoff
            )));
        }
        Ok(())
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.base_backoff, self.max_backoff)
    }
}

// ─── State ────────────────────────────────────────────────────────────────────

/// Lifecycle of the supervised link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Terminal.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected    => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped      => "stopped",
        })
    }
}

/// Point-in-time view of a [`Reconnector`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectStats {
    pub connected:         bool,
    /// Two writers disagree on what this counts, and both are kept:
    ///
    /// * the reconnect loop sets it to the number of attempts made so far,
    ///   so after a success it holds how many attempts that recovery took;
    /// * [`Reconnector::mark_connected`] resets it to zero.
    ///
    /// Read it as "attempts spent in the most recent recovery", zeroed
    /// whenever the link is declared healthy out of band.
    pub reconnect_count:   u64,
    pub last_connected:    Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct State {
    conn:              ConnectionState,
    reconnect_count:   u64,
    last_connected:    Option<DateTime<Utc>>,
    last_disconnected: Option<DateTime<Utc>>,
    /// Cancels the live reconnect loop, if any.
    reconnect_loop:    Option<CancellationToken>,
}

impl State {
    /// Whether the loop holding `token` is still the live one.
    fn owns_loop(&self, token: &CancellationToken) -> bool {
        self.conn == ConnectionState::Reconnecting && !token.is_cancelled()
    }

    fn end_loop(&mut self) {
        if let Some(token) = self.reconnect_loop.take() {
            token.cancel();
        }
    }
}

struct Inner {
    config:          ReconnectConfig,
    check_alive:     CheckAliveFn,
    do_reconnect:    DoReconnectFn,
    on_connected:    Option<HookFn>,
    on_disconnected: Option<HookFn>,
    clock:           Arc<dyn Clock>,
    state:           Mutex<State>,
    stop:            CancellationToken,
    heartbeat:       Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Builder for [`Reconnector`]. `check_alive` and `do_reconnect` are required.
#[derive(Default)]
pub struct ReconnectorBuilder {
    config:          ReconnectConfig,
    check_alive:     Option<CheckAliveFn>,
    do_reconnect:    Option<DoReconnectFn>,
    on_connected:    Option<HookFn>,
    on_disconnected: Option<HookFn>,
    clock:           Option<Arc<dyn Clock>>,
}

impl ReconnectorBuilder {
    pub fn config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Probe used by the heartbeat while connected.
    pub fn check_alive<F, Fut>(mut self, f: F) -> Self
    where
        F:   Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.check_alive = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// One attempt at re-establishing the link.
    pub fn do_reconnect<F, Fut>(mut self, f: F) -> Self
    where
        F:   Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ReconnectError>> + Send + 'static,
    {
        self.do_reconnect = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(f));
        self
    }

    /// Source of the timestamps in [`ReconnectStats`]. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Reconnector, ConfigError> {
        self.config.validate()?;
        let check_alive  = self.check_alive.ok_or(ConfigError::MissingCapability("check_alive"))?;
        let do_reconnect = self.do_reconnect.ok_or(ConfigError::MissingCapability("do_reconnect"))?;
        Ok(Reconnector {
            inner: Arc::new(Inner {
                config: self.config,
                check_alive,
                do_reconnect,
                on_connected:    self.on_connected,
                on_disconnected: self.on_disconnected,
                clock:           self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                state: Mutex::new(State {
                    conn:              ConnectionState::Disconnected,
                    reconnect_count:   0,
                    last_connected:    None,
                    last_disconnected: None,
                    reconnect_loop:    None,
                }),
                stop:      CancellationToken::new(),
                heartbeat: Mutex::new(None),
            }),
        })
    }
}

// ─── Reconnector ──────────────────────────────────────────────────────────────

/// Health/backoff supervisor for one link. Cheap to clone.
#[derive(Clone)]
pub struct Reconnector {
    inner: Arc<Inner>,
}

/// A non-owning handle to a [`Reconnector`].
#[derive(Clone)]
pub struct WeakReconnector {
    inner: Weak<Inner>,
}

impl WeakReconnector {
    pub fn upgrade(&self) -> Option<Reconnector> {
        self.inner.upgrade().map(|inner| Reconnector { inner })
    }
}

impl Reconnector {
    pub fn builder() -> ReconnectorBuilder {
        ReconnectorBuilder::default()
    }

    pub fn downgrade(&self) -> WeakReconnector {
        WeakReconnector { inner: Arc::downgrade(&self.inner) }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Start the heartbeat. The first tick fires one interval from now.
    ///
    /// Does nothing if already started or stopped.
    pub fn start(&self) {
        if self.state() == ConnectionState::Stopped {
            tracing::warn!("[reconnect] start() after stop() ignored");
            return;
        }
        let mut slot = lock(&self.inner.heartbeat);
        if slot.is_some() {
            return;
        }

        let period = self.inner.config.heartbeat_interval;
        let stop   = self.inner.stop.clone();
        let weak   = self.downgrade();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(this) = weak.upgrade() else { break };
                this.tick().await;
            }
            tracing::debug!("[reconnect] Heartbeat stopped");
        }));
        tracing::info!("[reconnect] Heartbeat every {period:?}");
    }

    /// Enter the terminal state, stop the heartbeat and interrupt any
    /// backoff sleep or reconnect attempt in flight. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.conn == ConnectionState::Stopped {
                return;
            }
            state.conn = ConnectionState::Stopped;
            state.end_loop();
        }
        self.inner.stop.cancel();
        if let Some(heartbeat) = lock(&self.inner.heartbeat).take() {
            heartbeat.abort();
        }
        tracing::info!("[reconnect] Stopped");
    }

    /// Declare the link healthy, e.g. after an initial connect or an
    /// out-of-band login. Resets `reconnect_count` to zero and ends a running
    /// reconnect loop, interrupting its attempt if one is in flight.
    ///
    /// No-op if already connected or stopped.
    pub fn mark_connected(&self) {
        {
            let mut state = lock(&self.inner.state);
            match state.conn {
                ConnectionState::Connected | ConnectionState::Stopped => return,
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            }
            state.conn            = ConnectionState::Connected;
            state.reconnect_count = 0;
            state.last_connected  = Some(self.inner.clock.now());
            state.end_loop();
        }
        tracing::info!("[reconnect] Marked connected");
        if let Some(hook) = &self.inner.on_connected {
            hook();
        }
    }

    /// Declare the link broken. Only the `Connected → Disconnected` edge has
    /// any effect; `on_disconnected` fires once per such edge.
    ///
    /// Recovery starts on the next heartbeat tick, or immediately via
    /// [`Reconnector::reconnect_now`].
    pub fn mark_disconnected(&self) {
        if self.enter_disconnected() {
            tracing::warn!("[reconnect] Marked disconnected");
            if let Some(hook) = &self.inner.on_disconnected {
                hook();
            }
        }
    }

    /// Launch the reconnect loop now instead of waiting for the heartbeat.
    ///
    /// Returns `false` if a loop is already running or the reconnector is
    /// stopped.
    pub fn reconnect_now(&self) -> bool {
        let token = self.inner.stop.child_token();
        {
            let mut state = lock(&self.inner.state);
            match state.conn {
                ConnectionState::Reconnecting | ConnectionState::Stopped => return false,
                ConnectionState::Connected | ConnectionState::Disconnected => {}
            }
            state.conn = ConnectionState::Reconnecting;
            state.end_loop();
            state.reconnect_loop = Some(token.clone());
        }
        tokio::spawn(reconnect_loop(self.downgrade(), self.inner.config.clone(), token));
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).conn
    }

    pub fn stats(&self) -> ReconnectStats {
        let state = lock(&self.inner.state);
        ReconnectStats {
            connected:         state.conn == ConnectionState::Connected,
            reconnect_count:   state.reconnect_count,
            last_connected:    state.last_connected,
            last_disconnected: state.last_disconnected,
        }
    }

    // ── internals ──────────────────────────────────────────────────────────

    /// `Connected → Disconnected`. Returns whether the edge was taken.
    fn enter_disconnected(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.conn != ConnectionState::Connected {
            return false;
        }
        state.conn              = ConnectionState::Disconnected;
        state.last_disconnected = Some(self.inner.clock.now());
        true
    }

    async fn tick(&self) {
        match self.state() {
            ConnectionState::Stopped | ConnectionState::Reconnecting => {}
            ConnectionState::Disconnected => {
                self.reconnect_now();
            }
            ConnectionState::Connected => {
                if self.probe().await {
                    return;
                }
                if self.enter_disconnected() {
                    tracing::warn!("[reconnect] Health check failed, link is down");
                    if let Some(hook) = self.inner.on_disconnected.clone() {
                        tokio::spawn(async move { hook() });
                    }
                    self.reconnect_now();
                }
            }
        }
    }

    async fn probe(&self) -> bool {
        let bound = self.inner.config.check_timeout;
        let ctx   = self.inner.stop.child_token();
        let alive = tokio::time::timeout(bound, (self.inner.check_alive)(ctx.clone())).await;
        ctx.cancel();
        match alive {
            Ok(alive) => alive,
            Err(_) => {
                tracing::warn!("[reconnect] Health check timed out after {bound:?}");
                false
            }
        }
    }
}

// ─── Reconnect loop ───────────────────────────────────────────────────────────

/// Backoff, attempt, repeat until an attempt succeeds or `token` is
/// cancelled. Holds the reconnector only for the length of one attempt.
async fn reconnect_loop(weak: WeakReconnector, config: ReconnectConfig, token: CancellationToken) {
    let backoff = config.backoff();
    let bound   = config.reconnect_timeout;
    let mut attempt: u32 = 0;

    loop {
        let delay = backoff.delay(attempt, &mut rand::thread_rng());
        tracing::info!("[reconnect] Attempt {} in {delay:?}", attempt + 1);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let Some(this) = weak.upgrade() else { return };
        if !lock(&this.inner.state).owns_loop(&token) {
            return;
        }

        let ctx = token.child_token();
        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            outcome = tokio::time::timeout(bound, (this.inner.do_reconnect)(ctx.clone())) => outcome,
        };
        ctx.cancel();

        match outcome.unwrap_or(Err(ReconnectError::TimedOut(bound))) {
            Ok(()) => {
                {
                    let mut state = lock(&this.inner.state);
                    if !state.owns_loop(&token) {
                        return;
                    }
                    state.conn            = ConnectionState::Connected;
                    state.reconnect_count = u64::from(attempt) + 1;
                    state.last_connected  = Some(this.inner.clock.now());
                    state.reconnect_loop  = None;
                }
                tracing::info!("[reconnect] Reconnected after {} attempt(s) ✓", attempt + 1);
                if let Some(hook) = &this.inner.on_connected {
                    hook();
                }
                return;
            }
            Err(e) => {
                tracing::warn!("[reconnect] Attempt {} failed: {e}", attempt + 1);
                attempt = attempt.saturating_add(1);
                let mut state = lock(&this.inner.state);
                if !state.owns_loop(&token) {
                    return;
                }
                state.reconnect_count = u64::from(attempt);
            }
        }
    }
}

impl fmt::Debug for Reconnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconnector")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
