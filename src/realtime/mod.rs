//! Realtime telemetry modules.
//!
//! - `channel`: websocket transport, reconnect handling, and listener
//!   fan-out.
//! - `proto`: telemetry payload types pushed by the agent.
//! - `feed`: typed snapshot feed layered on a channel.

/// Websocket connection manager and subscriptions.
pub mod channel;
/// Typed snapshot feed with latest-value tracking.
pub mod feed;
/// Envelope and telemetry wire types.
pub mod proto;
