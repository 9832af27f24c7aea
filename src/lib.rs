//! User-facing Rust SDK for the Pulsedeck server-monitoring agent.
//!
//! The crate is organized by transport surface:
//! - `agent_api`: HTTP client for the agent's static/system endpoints.
//! - `realtime`: realtime telemetry channel, wire types, and feed helpers.
//! - `retry`: shared retry and timeout utilities.

/// Agent HTTP API client and response types.
pub mod agent_api;
/// Realtime telemetry channel, protocol types, and feed helpers.
pub mod realtime;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
