//! Shared types for a single turn's lifecycle (spec.md §3): the
//! client-facing sink abstraction the core relays through, the hand-off
//! signals a connection driver feeds in, and the before/after
//! instrumentation hooks.

use async_trait::async_trait;
use gproxy_protocol::ResponseUsage;
use serde_json::Value;

use crate::errors::TurnError;

/// Usage and request-id accumulated so far this turn, carried both on a
/// clean [`TurnOutcome::Terminal`] and on an aborted [`TurnError`] (spec.md
/// §3's `TurnError.partial`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialTurnResult {
    pub request_id: Option<String>,
    pub usage: ResponseUsage,
}

impl PartialTurnResult {
    pub fn accumulate_usage(&mut self, usage: ResponseUsage) {
        self.usage.accumulate(usage);
    }
}

/// The result of one `sendAndRelay` pass (spec.md §4.4).
#[derive(Debug)]
pub enum TurnOutcome {
    /// Reached a terminal upstream event, or the client disconnected and
    /// the drain-mode deadline expired waiting for one.
    Terminal {
        response_id: Option<String>,
        partial: PartialTurnResult,
        wrote_downstream: bool,
    },
}

/// What the ingress connection driver hands the forwarder mid-turn.
#[derive(Debug, Clone)]
pub enum ClientSignal {
    /// A new `response.create` arrived while this turn was still relaying;
    /// carries the payload for the caller's next `run_turn`.
    Preempt(Value),
    /// The client's read loop observed a disconnect.
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
#[error("client write failed: {0}")]
pub struct ClientWriteError(pub String);

/// Abstraction over the downstream ingress connection, so the forwarder's
/// core loop doesn't depend on any particular WS server framework.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn write_json(&self, value: &Value) -> Result<(), ClientWriteError>;
}

/// Invoked exactly once per turn regardless of internal retries (spec.md
/// §4.4's "BeforeTurn/AfterTurn hooks" requirement).
#[async_trait]
pub trait TurnHooks: Send + Sync {
    async fn before_turn(&self, turn_index: u32);
    async fn after_turn(&self, turn_index: u32, outcome: Result<&TurnOutcome, &TurnError>);
}

/// Hooks for callers that don't need instrumentation.
pub struct NoopHooks;

#[async_trait]
impl TurnHooks for NoopHooks {
    async fn before_turn(&self, _turn_index: u32) {}
    async fn after_turn(&self, _turn_index: u32, _outcome: Result<&TurnOutcome, &TurnError>) {}
}
