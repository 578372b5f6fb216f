//! Duplex RPC transport.
//!
//! Turns one byte stream into concurrent request/response calls plus
//! server-pushed notifications:
//!
//! * Outbound frames are queued to one writer task that owns the write half,
//!   so a frame is always written whole before the next one starts, even
//!   when the call that queued it is dropped midway.
//! * One background reader task owns the read half. Responses are routed to
//!   their waiter by `id` through the pending table; notifications are handed
//!   to the registered handler on a separate blocking-capable task so a slow
//!   handler never delays the next response.
//! * The pending table lock is never held across a read or a write.
//! * A rolling read deadline catches peers that vanished without closing
//!   the socket (NAT timeouts and the like).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_proto::{FrameDecoder, FrameError, Framing, Incoming, Notification, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{millis, opt_millis};
use crate::{CallError, ConfigError, ConnError, Socks5Config, lock};

/// Callback receiving server-pushed notifications.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

type Slot = oneshot::Sender<Result<Response, CallError>>;

const READ_CHUNK: usize = 8 * 1024;
const OUTBOUND_QUEUE: usize = 64;

/// One encoded frame waiting for the writer task.
struct Outbound {
    wire: Vec<u8>,
    done: oneshot::Sender<Result<(), CallError>>,
}

// ─── TransportConfig ──────────────────────────────────────────────────────────

/// Settings for one [`Transport`] connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Byte framing spoken by the remote.
    pub framing:         Framing,
    /// Default per-call timeout when `call()` is given `None`.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout:    Duration,
    /// Rolling read deadline; silence longer than this closes the connection.
    #[serde(rename = "read_timeout_ms", with = "millis")]
    pub read_timeout:    Duration,
    /// Deadline for writing one frame; expiry closes the connection.
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout:   Duration,
    /// Deadline for the TCP (or proxy) dial.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Frames longer than this are a fatal framing error.
    pub max_frame_len:   usize,
    /// TCP keepalive idle time; `None` leaves the OS default.
    #[serde(rename = "tcp_keepalive_ms", with = "opt_millis")]
    pub tcp_keepalive:   Option<Duration>,
    /// Route the dial through a SOCKS5 proxy.
    pub socks5:          Option<Socks5Config>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            framing:         Framing::Line,
            call_timeout:    Duration::from_secs(30),
            read_timeout:    Duration::from_secs(90),
            write_timeout:   Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_frame_len:   tether_proto::DEFAULT_MAX_FRAME_LEN,
            tcp_keepalive:   Some(Duration::from_secs(30)),
            socks5:          None,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, d) in [
            ("call_timeout",    self.call_timeout),
            ("read_timeout",    self.read_timeout),
            ("write_timeout",   self.write_timeout),
            ("connect_timeout", self.connect_timeout),
        ] {
            if d.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Invalid("`max_frame_len` must be greater than zero".into()));
        }
        if let Some(proxy) = &self.socks5 {
            proxy.validate()?;
        }
        Ok(())
    }
}

// ─── CloseReason ──────────────────────────────────────────────────────────────

/// Why a [`Transport`] stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Transport::close`] was called or every handle was dropped.
    Requested,
    /// The peer closed the stream.
    Eof,
    /// Nothing was received within the read deadline.
    ReadTimeout,
    /// Reading or writing failed.
    Io(String),
    /// The byte stream could not be split into frames any more.
    Framing(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested  => write!(f, "closed locally"),
            Self::Eof        => write!(f, "peer closed the connection"),
            Self::ReadTimeout => write!(f, "read deadline exceeded"),
            Self::Io(e)      => write!(f, "I/O error: {e}"),
            Self::Framing(e) => write!(f, "framing error: {e}"),
        }
    }
}

// ─── Shared state ─────────────────────────────────────────────────────────────

struct Shared {
    peer:          String,
    framing:       Framing,
    call_timeout:  Duration,
    next_id:       AtomicU64,
    pending:       Mutex<HashMap<u64, Slot>>,
    outbound:      mpsc::Sender<Outbound>,
    handler:       RwLock<Option<NotificationHandler>>,
    closed:        CancellationToken,
    close_reason:  Mutex<Option<CloseReason>>,
}

impl Shared {
    /// Mark the connection dead and fail every pending call.
    ///
    /// Only the first reason is kept; later calls are no-ops.
    fn shutdown(&self, reason: CloseReason) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_some() {
                return;
            }
            tracing::info!("[transport] {} closed: {reason}", self.peer);
            *slot = Some(reason);
        }
        self.closed.cancel();

        let drained: Vec<Slot> = lock(&self.pending).drain().map(|(_, slot)| slot).collect();
        if !drained.is_empty() {
            tracing::debug!("[transport] Failing {} pending call(s) on {}", drained.len(), self.peer);
        }
        for slot in drained {
            let _ = slot.send(Err(CallError::Closed));
        }
    }

    /// Queue `wire` for the writer task and wait until it is on the wire.
    ///
    /// Dropping the returned future does not abandon the frame: once queued
    /// it is written whole, or the connection is shut down.
    async fn write_frame(&self, wire: Vec<u8>) -> Result<(), CallError> {
        let (done, written) = oneshot::channel();
        self.outbound
            .send(Outbound { wire, done })
            .await
            .map_err(|_| CallError::Closed)?;
        written.await.unwrap_or(Err(CallError::Closed))
    }

    fn dispatch(&self, frame: &[u8]) {
        match tether_proto::decode(frame) {
            Ok(Incoming::Response(resp)) => {
                let slot = lock(&self.pending).remove(&resp.id);
                match slot {
                    Some(slot) => { let _ = slot.send(Ok(resp)); }
                    None => tracing::warn!(
                        "[transport] Dropping response for unknown call #{} from {} (timed out or cancelled)",
                        resp.id, self.peer,
                    ),
                }
            }
            Ok(Incoming::Notification(note)) => {
                let handler = self.handler.read().unwrap_or_else(|e| e.into_inner()).clone();
                match handler {
                    Some(handler) => {
                        tokio::task::spawn_blocking(move || handler(note));
                    }
                    None => tracing::debug!("[transport] Unhandled notification `{}` from {}", note.method, self.peer),
                }
            }
            Err(e) => tracing::warn!("[transport] Skipping malformed frame from {}: {e}", self.peer),
        }
    }
}

/// Removes a pending entry when the waiting call finishes, however it finishes.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, Slot>>,
    id:      u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

// ─── Reader task ──────────────────────────────────────────────────────────────

async fn read_loop<R>(shared: Arc<Shared>, mut reader: R, mut decoder: FrameDecoder, read_timeout: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let reason = 'read: loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => shared.dispatch(&frame),
                Ok(None)        => break,
                Err(e)          => break 'read CloseReason::Framing(e.to_string()),
            }
        }

        let read = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break 'read CloseReason::Requested,
            read = tokio::time::timeout(read_timeout, reader.read(&mut buf)) => read,
        };
        match read {
            Err(_)         => break CloseReason::ReadTimeout,
            Ok(Err(e))     => break CloseReason::Io(e.to_string()),
            Ok(Ok(0))      => break CloseReason::Eof,
            Ok(Ok(n))      => decoder.push(&buf[..n]),
        }
    };
    shared.shutdown(reason);
}

// ─── Writer task ──────────────────────────────────────────────────────────────

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut queue: mpsc::Receiver<Outbound>, write_timeout: Duration)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(Outbound { wire, done }) = next else { break };

        let write = async {
            writer.write_all(&wire).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => {
                let _ = done.send(Err(CallError::Closed));
                break;
            }
            r = tokio::time::timeout(write_timeout, write) => match r {
                Ok(r)  => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
            },
        };
        match result {
            Ok(()) => { let _ = done.send(Ok(())); }
            Err(e) => {
                tracing::warn!("[transport] Write to {} failed: {e}", shared.peer);
                shared.shutdown(CloseReason::Io(e.to_string()));
                let _ = done.send(Err(CallError::Io(e)));
                break;
            }
        }
    }

    // Queued frames behind a dead connection are never written.
    queue.close();
    while let Some(Outbound { done, .. }) = queue.recv().await {
        let _ = done.send(Err(CallError::Closed));
    }
    let _ = writer.shutdown().await;
}

// ─── Transport ────────────────────────────────────────────────────────────────

struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.shutdown(CloseReason::Requested);
    }
}

/// A multiplexed call/notify channel over one connection.
///
/// Cheap to clone. The connection closes when [`Transport::close`] is
/// called, when the peer goes away, or when the last clone is dropped.
#[derive(Clone)]
pub struct Transport {
    handle: Arc<Handle>,
}

impl Transport {
    /// Dial `addr` (directly or through the configured SOCKS5 proxy) and
    /// start the reader task.
    pub async fn connect(addr: &str, config: &TransportConfig) -> Result<Self, ConnError> {
        tracing::info!("[transport] Connecting to {addr} …");
        let stream = match tokio::time::timeout(config.connect_timeout, open_tcp(addr, config)).await {
            Ok(stream) => stream?,
            Err(_)     => return Err(ConnError::Timeout { addr: addr.to_string(), after: config.connect_timeout }),
        };
        tracing::info!("[transport] Connected to {addr} ✓");
        Ok(Self::spawn(stream, config, addr.to_string()))
    }

    /// Wrap an already-established stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(stream, config, "stream".to_string())
    }

    fn spawn<S>(stream: S, config: &TransportConfig, peer: String) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let shared = Arc::new(Shared {
            peer,
            framing:      config.framing,
            call_timeout: config.call_timeout,
            next_id:      AtomicU64::new(1),
            pending:      Mutex::new(HashMap::new()),
            outbound,
            handler:      RwLock::new(None),
            closed:       CancellationToken::new(),
            close_reason: Mutex::new(None),
        });
        let decoder = FrameDecoder::with_max_frame_len(config.framing, config.max_frame_len);
        tokio::spawn(read_loop(Arc::clone(&shared), reader, decoder, config.read_timeout));
        tokio::spawn(write_loop(Arc::clone(&shared), writer, queue, config.write_timeout));
        Self { handle: Arc::new(Handle { shared }) }
    }

    fn shared(&self) -> &Shared {
        &self.handle.shared
    }

    /// Register the callback for server-pushed notifications, replacing any
    /// previous one. Notifications arriving with no handler are dropped.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.set_shared_handler(Arc::new(handler));
    }

    pub(crate) fn set_shared_handler(&self, handler: NotificationHandler) {
        *self.shared().handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Call `method` and wait for its result.
    ///
    /// `timeout` defaults to [`TransportConfig::call_timeout`].
    pub async fn call(
        &self,
        method:  &str,
        params:  impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.call_inner(method, params, timeout, None).await
    }

    /// Like [`Transport::call`], but also gives up when `cancel` fires.
    pub async fn call_with_cancel(
        &self,
        method:  &str,
        params:  impl Serialize,
        timeout: Option<Duration>,
        cancel:  &CancellationToken,
    ) -> Result<Value, CallError> {
        self.call_inner(method, params, timeout, Some(cancel)).await
    }

    /// Call `method` and deserialise its result into `T`.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, params: impl Serialize) -> Result<T, CallError> {
        let value = self.call(method, params, None).await?;
        serde_json::from_value(value).map_err(CallError::Decode)
    }

    async fn call_inner(
        &self,
        method:  &str,
        params:  impl Serialize,
        timeout: Option<Duration>,
        cancel:  Option<&CancellationToken>,
    ) -> Result<Value, CallError> {
        let shared = self.shared();
        if shared.closed.is_cancelled() {
            return Err(CallError::Closed);
        }

        let params  = serde_json::to_value(params).map_err(|e| CallError::Encode(FrameError::Json(e)))?;
        let id      = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request { id, method: method.to_string(), params };
        let mut wire = Vec::new();
        tether_proto::encode(shared.framing, &request.to_bytes()?, &mut wire)?;

        // Register before writing: the response may beat the write's return.
        let (tx, rx) = oneshot::channel();
        lock(&shared.pending).insert(id, tx);
        let _guard = PendingGuard { pending: &shared.pending, id };

        shared.write_frame(wire).await?;

        let timeout = timeout.unwrap_or(shared.call_timeout);
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None        => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            outcome = rx => match outcome {
                Ok(Ok(resp)) => resp.into_result().map_err(CallError::Remote),
                Ok(Err(e))   => Err(e),
                Err(_)       => Err(CallError::Closed),
            },
            _ = shared.closed.cancelled() => Err(CallError::Closed),
            _ = cancelled => Err(CallError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!("[transport] `{method}` (#{id}) to {} timed out after {timeout:?}", shared.peer);
                Err(CallError::Timeout(timeout))
            }
        }
    }

    /// Stop the reader, fail every pending call with [`CallError::Closed`]
    /// and have the writer task shut down the write half.
    pub async fn close(&self) {
        self.shared().shutdown(CloseReason::Requested);
        tokio::task::yield_now().await;
    }

    /// Resolves once the connection has stopped, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let shared = self.shared();
        shared.closed.cancelled().await;
        self.close_reason().unwrap_or(CloseReason::Requested)
    }

    /// Like [`Transport::closed`], but the returned future does not count as
    /// a handle: dropping every `Transport` still closes the connection.
    pub(crate) fn watch_close(&self) -> impl Future<Output = CloseReason> + Send + 'static {
        let shared = Arc::clone(&self.handle.shared);
        async move {
            shared.closed.cancelled().await;
            lock(&shared.close_reason).clone().unwrap_or(CloseReason::Requested)
        }
    }

    /// The reason the connection stopped, or `None` while it is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.shared().close_reason).clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared().closed.is_cancelled()
    }

    /// Calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared().pending).len()
    }

    /// The remote address (or `"stream"` for [`Transport::from_stream`]).
    pub fn peer(&self) -> &str {
        &self.shared().peer
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer())
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

// ─── Dialing ──────────────────────────────────────────────────────────────────

async fn open_tcp(addr: &str, config: &TransportConfig) -> Result<TcpStream, ConnError> {
    let stream = match &config.socks5 {
        Some(proxy) => proxy.connect(addr).await?,
        None => TcpStream::connect(addr)
            .await
            .map_err(|source| ConnError::Dial { addr: addr.to_string(), source })?,
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("[transport] TCP_NODELAY on {addr} failed: {e}");
    }
    if let Some(idle) = config.tcp_keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::warn!("[transport] Could not enable TCP keepalive on {addr}: {e}");
        }
    }
    Ok(stream)
}
