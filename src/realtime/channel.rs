//! Realtime websocket channel with reconnect handling and listener fan-out.
//!
//! [`RealtimeChannel`] owns at most one live connection to the agent's push
//! endpoint. A background worker drives an explicit state machine
//! (disconnected, connecting, connected), recovers from drops with capped
//! exponential backoff, and delivers decoded frames and connection edges to
//! registered listeners. Listeners are identity-keyed: registering returns a
//! [`Subscription`] whose only operation is removing that exact registration.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::realtime::proto::Envelope;
use crate::retry::jitter_unit;

/// Path the agent serves its realtime push feed on.
pub const REALTIME_PATH: &str = "/ws/realtime";
/// Realtime endpoint of an agent running on this machine with default config.
pub const LOCAL_REALTIME_ENDPOINT: &str = "ws://localhost:9876/ws/realtime";

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;
type MessageCallback = Box<dyn Fn(&Envelope) + Send + Sync>;
type ConnectionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Connection lifecycle state of a [`RealtimeChannel`].
///
/// `Connecting` is a real internal state but is not announced to listeners;
/// only the edges into `Connected` and `Disconnected` are.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnection behavior after a transport drop or failed dial.
///
/// The delay before reconnect attempt `n` (0-based) is
/// `min(base_delay * 2^n, max_delay)` stretched by a random jitter factor in
/// `[1, 1 + jitter_fraction]`. After `max_attempts` scheduled attempts without
/// a successful connection the channel stays disconnected until an explicit
/// [`RealtimeChannel::connect`] call, which resets the counter.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound for the exponential delay growth.
    pub max_delay: Duration,
    /// Number of automatic reconnect attempts per connect cycle.
    pub max_attempts: u32,
    /// Relative jitter stretch, e.g. `0.25` for up to +25%.
    pub jitter_fraction: f64,
}

impl ReconnectPolicy {
    /// Computes the backoff delay for the given 0-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay);
        capped.mul_f64(1.0 + self.jitter_fraction * jitter_unit(u64::from(attempt)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter_fraction: 0.25,
        }
    }
}

/// Construction parameters for a [`RealtimeChannel`].
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// Full websocket endpoint, e.g. `ws://monitor.lan:9876/ws/realtime`.
    pub endpoint: String,
    /// Optional `x-api-key` header sent with the upgrade request.
    pub api_key: Option<SecretString>,
    /// Reconnection behavior.
    pub policy: ReconnectPolicy,
}

impl ChannelOptions {
    /// Options for an explicit endpoint with the default policy.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            api_key: None,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Options for an agent at `host` (with port), using the conventional
    /// realtime path.
    pub fn for_host(host: &str) -> Self {
        Self::new(format!("ws://{host}{REALTIME_PATH}"))
    }

    /// Sets the API key sent as `x-api-key` during the handshake.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Replaces the reconnect policy.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Errors produced while establishing the websocket transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),
}

/// Handle for removing one listener registration.
///
/// Returned by [`RealtimeChannel::on_message`] and
/// [`RealtimeChannel::on_connection_change`]. Dropping the handle does NOT
/// unsubscribe; only [`Subscription::cancel`] does. Once `cancel` returns,
/// the listener never sees a notification dispatched afterwards.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Removes the listener registration this handle was returned for.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

struct Slot<F> {
    alive: AtomicBool,
    callback: F,
}

struct SubscriberSetInner<F> {
    next_id: u64,
    entries: BTreeMap<u64, Arc<Slot<F>>>,
}

/// Insertion-ordered, identity-keyed listener registry.
///
/// Ids are handed out monotonically, so iterating the map visits listeners in
/// registration order and the same callback can be registered multiple times
/// under distinct ids.
struct SubscriberSet<F> {
    inner: Mutex<SubscriberSetInner<F>>,
}

impl<F: Send + Sync + 'static> SubscriberSet<F> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SubscriberSetInner {
                next_id: 0,
                entries: BTreeMap::new(),
            }),
        })
    }

    fn subscribe(set: &Arc<Self>, callback: F) -> Subscription {
        let slot = Arc::new(Slot {
            alive: AtomicBool::new(true),
            callback,
        });
        let id = {
            let mut inner = set.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.insert(id, Arc::clone(&slot));
            id
        };
        let set = Arc::downgrade(set);
        Subscription {
            cancel: Some(Box::new(move || {
                // The alive flag is the synchronous part of the guarantee: it
                // is checked immediately before every invocation.
                slot.alive.store(false, Ordering::SeqCst);
                if let Some(set) = set.upgrade() {
                    let mut inner = set.inner.lock().unwrap_or_else(PoisonError::into_inner);
                    inner.entries.remove(&id);
                }
            })),
        }
    }

    fn snapshot(&self) -> Vec<Arc<Slot<F>>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.values().cloned().collect()
    }
}

struct ChannelShared {
    endpoint: String,
    api_key: Option<SecretString>,
    policy: ReconnectPolicy,
    state: Mutex<ConnectionState>,
    /// Intentionally-closed flag; set by `disconnect`, cleared by `connect`.
    closed: AtomicBool,
    /// Bumped by `disconnect`. Dispatches carry the epoch they were born
    /// under and are suppressed once it goes stale.
    lifecycle_epoch: AtomicU64,
    /// Bumped once per opened transport; outbound frames are tagged with it
    /// so a frame can never outlive the connection it was sent on.
    session_seq: AtomicU64,
    message_listeners: Arc<SubscriberSet<MessageCallback>>,
    connection_listeners: Arc<SubscriberSet<ConnectionCallback>>,
}

impl ChannelShared {
    fn new(options: ChannelOptions) -> Arc<Self> {
        Arc::new(Self {
            endpoint: options.endpoint,
            api_key: options.api_key,
            policy: options.policy,
            state: Mutex::new(ConnectionState::Disconnected),
            closed: AtomicBool::new(false),
            lifecycle_epoch: AtomicU64::new(0),
            session_seq: AtomicU64::new(0),
            message_listeners: SubscriberSet::new(),
            connection_listeners: SubscriberSet::new(),
        })
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn dispatch_envelope(&self, envelope: &Envelope, epoch: u64) {
        for slot in self.message_listeners.snapshot() {
            if self.lifecycle_epoch.load(Ordering::SeqCst) != epoch {
                debug!(event = "dispatch_suppressed", kind = "message");
                return;
            }
            if !slot.alive.load(Ordering::SeqCst) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (slot.callback)(envelope))).is_err() {
                error!(event = "listener_panicked", kind = "message");
            }
        }
    }

    fn notify_connection(&self, connected: bool, epoch: u64) {
        for slot in self.connection_listeners.snapshot() {
            if self.lifecycle_epoch.load(Ordering::SeqCst) != epoch {
                debug!(event = "dispatch_suppressed", kind = "connection");
                return;
            }
            if !slot.alive.load(Ordering::SeqCst) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (slot.callback)(connected))).is_err() {
                error!(event = "listener_panicked", kind = "connection");
            }
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    Transmit { text: String, session: u64 },
}

/// One logical push-connection to the agent's realtime endpoint.
///
/// Cloning yields another handle to the same channel. The channel is meant to
/// be constructed once by the application's composition root and handed to
/// whatever needs live telemetry; it holds no global state.
///
/// Must be created inside a Tokio runtime: construction spawns the connection
/// worker that owns the transport and all reconnect timers.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<ChannelShared>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl RealtimeChannel {
    /// Creates an idle channel. No connection is attempted until
    /// [`connect`](Self::connect) is called.
    pub fn new(options: ChannelOptions) -> Self {
        let shared = ChannelShared::new(options);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(channel_worker(Arc::clone(&shared), command_rx));
        Self { shared, command_tx }
    }

    /// Endpoint this channel dials.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Opens the connection if it is not already open.
    ///
    /// Idempotent and non-blocking. Clears the intentionally-closed flag and
    /// resets the reconnect-attempt counter; the outcome surfaces through
    /// connection listeners.
    pub fn connect(&self) {
        self.shared.closed.store(false, Ordering::SeqCst);
        if self.state() == ConnectionState::Connected {
            debug!(event = "connect_ignored", reason = "already_connected");
            return;
        }
        let _ = self.command_tx.send(Command::Connect);
    }

    /// Closes the connection and suppresses all automatic reconnects until
    /// the next [`connect`](Self::connect).
    ///
    /// Once this returns, no further listener notifications fire and any
    /// pending reconnect timer is dead.
    pub fn disconnect(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.lifecycle_epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Disconnect);
    }

    /// Serializes `payload` to JSON and transmits it on the live connection.
    ///
    /// Fire-and-forget: while not connected this is a no-op that logs a
    /// warning. Nothing is ever queued for a later connection and no error
    /// reaches the caller.
    pub fn send<T: Serialize>(&self, payload: &T) {
        if self.shared.closed.load(Ordering::SeqCst)
            || self.state() != ConnectionState::Connected
        {
            warn!(event = "send_skipped", state = ?self.state());
            return;
        }
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                error!(event = "send_encode_failed", error = %err);
                return;
            }
        };
        let session = self.shared.session_seq.load(Ordering::SeqCst);
        let _ = self.command_tx.send(Command::Transmit { text, session });
    }

    /// Registers a listener invoked once per successfully decoded inbound
    /// frame, in arrival order.
    ///
    /// Listeners run in registration order; a panicking listener is caught,
    /// logged, and does not stop delivery to the rest.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        SubscriberSet::subscribe(&self.shared.message_listeners, Box::new(listener))
    }

    /// Registers a listener invoked with `true` on the edge into connected
    /// and `false` on the edge into disconnected.
    pub fn on_connection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        SubscriberSet::subscribe(&self.shared.connection_listeners, Box::new(listener))
    }
}

impl fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

enum SessionOutcome {
    IntentionalClose,
    TransportLost,
    HandlesDropped,
}

enum CycleEnd {
    Idle,
    Shutdown,
}

enum RetryWait {
    Elapsed,
    Redial,
    Abort,
    Shutdown,
}

async fn channel_worker(
    shared: Arc<ChannelShared>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        // Idle until an explicit connect request.
        let Some(command) = command_rx.recv().await else {
            return;
        };
        match command {
            Command::Connect => {}
            Command::Disconnect => continue,
            Command::Transmit { .. } => {
                debug!(event = "frame_dropped", reason = "not_connected");
                continue;
            }
        }
        if let CycleEnd::Shutdown = run_connect_cycle(&shared, &mut command_rx).await {
            return;
        }
    }
}

/// Dials, runs the open session, and schedules reconnects until the cycle
/// ends by intentional close, exhaustion, or channel teardown.
async fn run_connect_cycle(
    shared: &Arc<ChannelShared>,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> CycleEnd {
    let mut attempts: u32 = 0;
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            shared.set_state(ConnectionState::Disconnected);
            return CycleEnd::Idle;
        }

        // Notifications born in this iteration die with this epoch.
        let epoch = shared.lifecycle_epoch.load(Ordering::SeqCst);
        shared.set_state(ConnectionState::Connecting);
        debug!(event = "connect_attempt", endpoint = %shared.endpoint);

        match open_transport(shared).await {
            Ok(transport) => {
                attempts = 0;
                let session = shared.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
                shared.set_state(ConnectionState::Connected);
                info!(event = "connected", endpoint = %shared.endpoint);
                shared.notify_connection(true, epoch);

                match run_open_session(shared, transport, command_rx, epoch, session).await {
                    SessionOutcome::IntentionalClose => {
                        shared.set_state(ConnectionState::Disconnected);
                        info!(event = "disconnected", reason = "requested");
                        return CycleEnd::Idle;
                    }
                    SessionOutcome::HandlesDropped => {
                        shared.set_state(ConnectionState::Disconnected);
                        return CycleEnd::Shutdown;
                    }
                    SessionOutcome::TransportLost => {
                        shared.set_state(ConnectionState::Disconnected);
                        info!(event = "disconnected", reason = "transport");
                        shared.notify_connection(false, epoch);
                    }
                }
            }
            Err(err) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(event = "connect_failed", endpoint = %shared.endpoint, error = %err);
                shared.notify_connection(false, epoch);
            }
        }

        if shared.closed.load(Ordering::SeqCst) {
            return CycleEnd::Idle;
        }
        if attempts >= shared.policy.max_attempts {
            warn!(event = "reconnect_exhausted", attempts, endpoint = %shared.endpoint);
            return CycleEnd::Idle;
        }
        let delay = shared.policy.delay_for_attempt(attempts);
        debug!(
            event = "reconnect_scheduled",
            attempt = attempts,
            delay_ms = delay.as_millis() as u64
        );
        attempts += 1;

        match wait_for_retry(command_rx, delay).await {
            RetryWait::Elapsed => {}
            RetryWait::Redial => attempts = 0,
            RetryWait::Abort => return CycleEnd::Idle,
            RetryWait::Shutdown => return CycleEnd::Shutdown,
        }
    }
}

async fn open_transport(shared: &ChannelShared) -> Result<Transport, ChannelError> {
    let mut request = shared.endpoint.as_str().into_client_request()?;
    if let Some(api_key) = &shared.api_key {
        let header = api_key.expose_secret().parse()?;
        request.headers_mut().insert("x-api-key", header);
    }
    let (transport, _) = connect_async(request).await?;
    Ok(transport)
}

async fn run_open_session(
    shared: &Arc<ChannelShared>,
    mut transport: Transport,
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    epoch: u64,
    session: u64,
) -> SessionOutcome {
    loop {
        tokio::select! {
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(Command::Transmit { text, session: tagged }) => {
                        // A frame queued before a disconnect or for an older
                        // connection is dropped, never replayed.
                        if tagged != session || shared.closed.load(Ordering::SeqCst) {
                            debug!(event = "frame_dropped", reason = "stale_session");
                            continue;
                        }
                        if let Err(err) = transport.send(Message::Text(text.into())).await {
                            warn!(event = "send_failed", error = %err);
                            return SessionOutcome::TransportLost;
                        }
                    }
                    Some(Command::Connect) => {
                        // Already connected; connect() is idempotent.
                    }
                    Some(Command::Disconnect) => {
                        let _ = transport.close(None).await;
                        return SessionOutcome::IntentionalClose;
                    }
                    None => {
                        let _ = transport.close(None).await;
                        return SessionOutcome::HandlesDropped;
                    }
                }
            }
            maybe_frame = transport.next() => {
                match maybe_frame {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::from_text(&text) {
                            Ok(envelope) => shared.dispatch_envelope(&envelope, epoch),
                            Err(err) => warn!(event = "decode_failed", error = %err),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if transport.send(Message::Pong(payload)).await.is_err() {
                            return SessionOutcome::TransportLost;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return SessionOutcome::TransportLost,
                    Some(Ok(_)) => {
                        debug!(event = "frame_dropped", reason = "non_text");
                    }
                    Some(Err(err)) => {
                        warn!(event = "transport_error", error = %err);
                        return SessionOutcome::TransportLost;
                    }
                    None => return SessionOutcome::TransportLost,
                }
            }
        }
    }
}

/// Sleeps out the backoff delay while still reacting to commands. An explicit
/// connect during the wait redials immediately with a fresh attempt counter.
async fn wait_for_retry(
    command_rx: &mut mpsc::UnboundedReceiver<Command>,
    delay: Duration,
) -> RetryWait {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return RetryWait::Elapsed,
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(Command::Connect) => return RetryWait::Redial,
                    Some(Command::Disconnect) => return RetryWait::Abort,
                    Some(Command::Transmit { .. }) => {
                        debug!(event = "frame_dropped", reason = "not_connected");
                    }
                    None => return RetryWait::Shutdown,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{
        ChannelOptions, ChannelShared, ConnectionState, RealtimeChannel, ReconnectPolicy,
        SubscriberSet, LOCAL_REALTIME_ENDPOINT,
    };
    use crate::realtime::proto::Envelope;

    fn test_shared() -> Arc<ChannelShared> {
        ChannelShared::new(ChannelOptions::new("ws://localhost:9/ws/realtime"))
    }

    fn sample_envelope() -> Envelope {
        Envelope::from_text(r#"{"timestamp":1}"#).expect("sample envelope")
    }

    fn current_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let started = tokio::time::Instant::now();
        while started.elapsed() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[test]
    fn for_host_follows_the_local_endpoint_convention() {
        let options = ChannelOptions::for_host("localhost:9876");
        assert_eq!(options.endpoint, LOCAL_REALTIME_ENDPOINT);
    }

    #[test]
    fn reconnect_delay_stays_within_policy_bounds() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 8,
            jitter_fraction: 0.25,
        };

        for attempt in 0..8u32 {
            let floor = std::cmp::min(
                policy.base_delay.saturating_mul(1 << attempt),
                policy.max_delay,
            );
            let ceiling = floor.mul_f64(1.0 + policy.jitter_fraction);
            for _ in 0..32 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(
                    delay >= floor && delay <= ceiling,
                    "attempt {attempt}: {delay:?} outside [{floor:?}, {ceiling:?}]"
                );
            }
        }
    }

    #[test]
    fn reconnect_delay_caps_at_max_delay() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 64,
            jitter_fraction: 0.25,
        };

        let delay = policy.delay_for_attempt(40);
        assert!(delay >= policy.max_delay);
        assert!(delay <= policy.max_delay.mul_f64(1.25));
    }

    #[test]
    fn zero_jitter_gives_exact_exponential_delays() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_attempts: 8,
            jitter_fraction: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn cancelled_listener_misses_later_dispatches() {
        let shared = test_shared();
        let count = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let count = Arc::clone(&count);
            SubscriberSet::subscribe(
                &shared.message_listeners,
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        let envelope = sample_envelope();
        let epoch = shared.lifecycle_epoch.load(Ordering::SeqCst);
        shared.dispatch_envelope(&envelope, epoch);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        subscription.cancel();
        shared.dispatch_envelope(&envelope, epoch);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registrations_are_removed_independently() {
        let shared = test_shared();
        let count = Arc::new(AtomicUsize::new(0));

        let make_listener = || {
            let count = Arc::clone(&count);
            move |_: &Envelope| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        let first = SubscriberSet::subscribe(&shared.message_listeners, Box::new(make_listener()));
        let _second =
            SubscriberSet::subscribe(&shared.message_listeners, Box::new(make_listener()));

        let envelope = sample_envelope();
        let epoch = shared.lifecycle_epoch.load(Ordering::SeqCst);
        shared.dispatch_envelope(&envelope, epoch);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        first.cancel();
        shared.dispatch_envelope(&envelope, epoch);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_listener_does_not_block_later_listeners() {
        let shared = test_shared();
        let survived = Arc::new(AtomicUsize::new(0));

        let _noisy = SubscriberSet::subscribe(
            &shared.message_listeners,
            Box::new(|_| panic!("listener bug")),
        );
        let _quiet = {
            let survived = Arc::clone(&survived);
            SubscriberSet::subscribe(
                &shared.message_listeners,
                Box::new(move |_| {
                    survived.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));

        let envelope = sample_envelope();
        let epoch = shared.lifecycle_epoch.load(Ordering::SeqCst);
        shared.dispatch_envelope(&envelope, epoch);
        shared.dispatch_envelope(&envelope, epoch);

        std::panic::set_hook(previous_hook);

        assert_eq!(survived.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let shared = test_shared();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            // Dropping the handle keeps the listener registered.
            let _ = SubscriberSet::subscribe(
                &shared.connection_listeners,
                Box::new(move |_connected| {
                    order.lock().expect("order lock").push(tag);
                }),
            );
        }

        let epoch = shared.lifecycle_epoch.load(Ordering::SeqCst);
        shared.notify_connection(true, epoch);
        assert_eq!(*order.lock().expect("order lock"), ["first", "second", "third"]);
    }

    #[test]
    fn stale_epoch_suppresses_dispatch() {
        let shared = test_shared();
        let count = Arc::new(AtomicUsize::new(0));

        let _subscription = {
            let count = Arc::clone(&count);
            SubscriberSet::subscribe(
                &shared.connection_listeners,
                Box::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };

        let epoch = shared.lifecycle_epoch.load(Ordering::SeqCst);
        shared.lifecycle_epoch.fetch_add(1, Ordering::SeqCst);
        shared.notify_connection(false, epoch);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn send_while_disconnected_is_a_quiet_no_op() {
        let runtime = current_runtime();
        runtime.block_on(async {
            let channel = RealtimeChannel::new(ChannelOptions::new("ws://127.0.0.1:9/ws/realtime"));
            channel.send(&serde_json::json!({ "probe": true }));
            assert_eq!(channel.state(), ConnectionState::Disconnected);
        });
    }

    #[test]
    fn failed_dials_notify_and_stop_after_exhaustion() {
        let runtime = current_runtime();
        runtime.block_on(async {
            // Bind and drop a listener so the port is known to refuse.
            let refused_port = {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
                listener.local_addr().expect("probe addr").port()
            };

            let options = ChannelOptions::new(format!("ws://127.0.0.1:{refused_port}/ws/realtime"))
                .with_policy(ReconnectPolicy {
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(10),
                    max_attempts: 2,
                    jitter_fraction: 0.0,
                });
            let channel = RealtimeChannel::new(options);

            let drops = Arc::new(AtomicUsize::new(0));
            let _subscription = {
                let drops = Arc::clone(&drops);
                channel.on_connection_change(move |connected| {
                    if !connected {
                        drops.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };

            channel.connect();

            // Initial dial plus max_attempts reconnects, then silence.
            let drops_probe = Arc::clone(&drops);
            assert!(
                wait_until(Duration::from_secs(2), move || {
                    drops_probe.load(Ordering::SeqCst) == 3
                })
                .await,
                "expected 3 failed dials, saw {}",
                drops.load(Ordering::SeqCst)
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(drops.load(Ordering::SeqCst), 3);
            assert_eq!(channel.state(), ConnectionState::Disconnected);

            // Explicit connect resets the attempt counter and tries again.
            channel.connect();
            let drops_probe = Arc::clone(&drops);
            assert!(
                wait_until(Duration::from_secs(2), move || {
                    drops_probe.load(Ordering::SeqCst) == 6
                })
                .await,
                "expected 3 more failed dials, saw {}",
                drops.load(Ordering::SeqCst)
            );
        });
    }
}
