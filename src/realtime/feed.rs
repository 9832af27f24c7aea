//! Typed telemetry feed layered on a [`RealtimeChannel`].
//!
//! [`TelemetryFeed`] decodes each inbound envelope into a
//! [`TelemetrySnapshot`], keeps the most recent snapshot and the connection
//! flag, and exposes an async event stream. This is the layer an application
//! state store or TUI sits on instead of wiring raw listeners itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::realtime::channel::{ConnectionState, RealtimeChannel, Subscription};
use crate::realtime::proto::{Envelope, TelemetrySnapshot};

/// Feed-level event emitted by [`TelemetryFeed::recv`].
#[derive(Clone, Debug)]
pub enum TelemetryEvent {
    /// A new snapshot arrived.
    Snapshot(TelemetrySnapshot),
    /// The underlying connection came up (`true`) or went down (`false`).
    ConnectionChanged(bool),
}

struct FeedState {
    latest: RwLock<Option<TelemetrySnapshot>>,
    connected: AtomicBool,
    events_tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl FeedState {
    fn apply_envelope(&self, envelope: &Envelope) {
        match envelope.decode::<TelemetrySnapshot>() {
            Ok(snapshot) => {
                if let Ok(mut guard) = self.latest.write() {
                    *guard = Some(snapshot.clone());
                }
                let _ = self.events_tx.send(TelemetryEvent::Snapshot(snapshot));
            }
            Err(err) => warn!(event = "snapshot_decode_failed", error = %err),
        }
    }

    fn apply_connection(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let _ = self
            .events_tx
            .send(TelemetryEvent::ConnectionChanged(connected));
    }
}

/// Stateful consumer of one channel's telemetry stream.
///
/// The feed owns its two listener registrations and cancels them when
/// dropped; it never drives the channel's lifecycle.
pub struct TelemetryFeed {
    events_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    state: Arc<FeedState>,
    message_sub: Option<Subscription>,
    connection_sub: Option<Subscription>,
}

impl TelemetryFeed {
    /// Attaches a feed to the channel.
    pub fn attach(channel: &RealtimeChannel) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(FeedState {
            latest: RwLock::new(None),
            connected: AtomicBool::new(channel.state() == ConnectionState::Connected),
            events_tx,
        });

        let message_sub = {
            let state = Arc::clone(&state);
            channel.on_message(move |envelope| state.apply_envelope(envelope))
        };
        let connection_sub = {
            let state = Arc::clone(&state);
            channel.on_connection_change(move |connected| state.apply_connection(connected))
        };

        Self {
            events_rx,
            state,
            message_sub: Some(message_sub),
            connection_sub: Some(connection_sub),
        }
    }

    /// Receives the next feed event.
    ///
    /// Returns `None` only after [`detach`](Self::detach) or once the feed's
    /// sender side is gone.
    pub async fn recv(&mut self) -> Option<TelemetryEvent> {
        self.events_rx.recv().await
    }

    /// Most recent snapshot seen, if any.
    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        self.state
            .latest
            .read()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Whether the underlying channel was connected at the last edge seen.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Cancels the feed's listener registrations.
    pub fn detach(mut self) {
        self.cancel_subscriptions();
    }

    fn cancel_subscriptions(&mut self) {
        if let Some(sub) = self.message_sub.take() {
            sub.cancel();
        }
        if let Some(sub) = self.connection_sub.take() {
            sub.cancel();
        }
    }
}

impl Drop for TelemetryFeed {
    fn drop(&mut self) {
        self.cancel_subscriptions();
    }
}
