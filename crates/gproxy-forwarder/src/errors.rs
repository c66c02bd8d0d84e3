//! The C5 Recovery Engine's abort-reason taxonomy and disposition table
//! (spec.md §4.5, §7): every way a turn can stop short of a clean terminal
//! event collapses onto one of these stage tags, and the stage tag alone
//! decides what the connection driver does next.

use std::fmt;

use serde_json::Value;

use crate::turn::PartialTurnResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    PreviousResponse,
    ToolOutput,
    UpstreamError,
    ClientPreempted,
    UpstreamRestart,
    ContextCanceled,
    ClientClosed,
    PolicyViolation,
    ContextDeadline,
    WriteUpstream,
    ReadUpstream,
    WriteClient,
    ContinuationUnavailable,
    Unknown,
}

impl AbortReason {
    /// The `error.code` spec.md §7 puts on the synthesized client event.
    pub fn code(self) -> &'static str {
        match self {
            AbortReason::PreviousResponse => "previous_response_not_found",
            AbortReason::ToolOutput => "tool_output_not_found",
            AbortReason::UpstreamError => "upstream_error",
            AbortReason::ClientPreempted => "client_preempted",
            AbortReason::UpstreamRestart => "upstream_restart",
            AbortReason::ContextCanceled => "context_canceled",
            AbortReason::ClientClosed => "client_closed",
            AbortReason::PolicyViolation => "policy_violation",
            AbortReason::ContextDeadline => "context_deadline",
            AbortReason::WriteUpstream => "write_upstream",
            AbortReason::ReadUpstream => "read_upstream",
            AbortReason::WriteClient => "write_client",
            AbortReason::ContinuationUnavailable => "continuation_unavailable",
            AbortReason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The session survives; the connection driver starts a fresh turn
    /// (either replaying internally or waiting on the client's next
    /// `response.create`, depending on the reason).
    ContinueTurn,
    /// No error: end the ingress WS connection cleanly.
    CloseGracefully,
    /// Surface a terminal failure for this request.
    FailRequest,
}

pub fn disposition_for(reason: AbortReason) -> Disposition {
    use AbortReason::*;
    match reason {
        PreviousResponse | ToolOutput | UpstreamError | ClientPreempted | UpstreamRestart => Disposition::ContinueTurn,
        ContextCanceled | ClientClosed => Disposition::CloseGracefully,
        PolicyViolation
        | ContextDeadline
        | WriteUpstream
        | ReadUpstream
        | WriteClient
        | ContinuationUnavailable
        | Unknown => Disposition::FailRequest,
    }
}

/// spec.md §7's disposition table, "send error to client?" column. A
/// `FailRequest` only sends when nothing has reached the client yet; the
/// `ContinueTurn` reasons send unconditionally except `client_preempted`,
/// which is a normal hand-off rather than a failure.
pub fn should_send_error_to_client(reason: AbortReason, wrote_downstream: bool) -> bool {
    match disposition_for(reason) {
        Disposition::ContinueTurn => !matches!(reason, AbortReason::ClientPreempted),
        Disposition::CloseGracefully => false,
        Disposition::FailRequest => !wrote_downstream,
    }
}

/// spec.md §7's "clear session `last_response_id`?" column.
pub fn should_clear_session_last_response_id(reason: AbortReason) -> bool {
    !matches!(
        reason,
        AbortReason::ClientPreempted | AbortReason::ContextCanceled | AbortReason::ClientClosed
    )
}

/// One of the recognized upstream WS close codes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamCloseClass {
    ClientDisconnect,
    UpstreamRestart,
    PolicyViolation,
    Other,
}

pub fn classify_close_code(code: u16) -> UpstreamCloseClass {
    match code {
        1000 | 1001 | 1005 | 1006 => UpstreamCloseClass::ClientDisconnect,
        1012 | 1013 => UpstreamCloseClass::UpstreamRestart,
        1008 => UpstreamCloseClass::PolicyViolation,
        _ => UpstreamCloseClass::Other,
    }
}

/// Raised instead of a [`TurnError`] when a WS close code demands the
/// ingress connection itself be closed with a specific code/reason, rather
/// than merely failing the in-flight turn (spec.md §6's 1008 handling).
#[derive(Debug, thiserror::Error)]
#[error("ingress websocket must close: code={code} reason={reason}")]
pub struct ClientCloseError {
    pub code: u16,
    pub reason: String,
}

/// Why a turn stopped short of a clean terminal event (spec.md §3). Carries
/// the stage tag the disposition table keys on, whether any byte has
/// already reached the client this turn, and (when available) the partial
/// usage/request-id accumulated before the abort.
#[derive(Debug)]
pub struct TurnError {
    pub stage: AbortReason,
    pub wrote_downstream: bool,
    pub partial: Option<PartialTurnResult>,
    pub cause: anyhow::Error,
    /// Set only for [`AbortReason::ClientPreempted`]: the payload the
    /// client sent mid-relay, queued for the connection driver's next turn.
    pub preempt_payload: Option<Value>,
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn aborted at stage {:?}: {}", self.stage, self.cause)
    }
}

impl std::error::Error for TurnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.source()
    }
}

impl TurnError {
    pub fn new(stage: AbortReason, wrote_downstream: bool, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            wrote_downstream,
            partial: None,
            cause: cause.into(),
            preempt_payload: None,
        }
    }

    pub fn with_partial(mut self, partial: PartialTurnResult) -> Self {
        self.partial = Some(partial);
        self
    }

    /// The synthesized `{"type":"error",...}` event spec.md §7 sends to the
    /// client when the disposition calls for it.
    pub fn synthesized_event(&self) -> Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": "server_error",
                "code": self.stage.code(),
                "message": format!("turn failed: {}", self.stage.code()),
            }
        })
    }
}

/// Everything a connection driver needs to react to a failed/aborted turn,
/// derived from a single [`TurnError`].
#[derive(Debug, Clone)]
pub struct ErrorResolution {
    pub disposition: Disposition,
    pub client_event: Option<Value>,
    pub clear_session_last_response_id: bool,
}

pub fn resolve_turn_error(err: &TurnError) -> ErrorResolution {
    ErrorResolution {
        disposition: disposition_for(err.stage),
        client_event: should_send_error_to_client(err.stage, err.wrote_downstream).then(|| err.synthesized_event()),
        clear_session_last_response_id: should_clear_session_last_response_id(err.stage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_table_matches_spec() {
        use AbortReason::*;
        use Disposition::*;
        let cases = [
            (PreviousResponse, ContinueTurn),
            (ToolOutput, ContinueTurn),
            (UpstreamError, ContinueTurn),
            (ClientPreempted, ContinueTurn),
            (UpstreamRestart, ContinueTurn),
            (ContextCanceled, CloseGracefully),
            (ClientClosed, CloseGracefully),
            (PolicyViolation, FailRequest),
            (ContextDeadline, FailRequest),
            (WriteUpstream, FailRequest),
            (ReadUpstream, FailRequest),
            (WriteClient, FailRequest),
            (ContinuationUnavailable, FailRequest),
            (Unknown, FailRequest),
        ];
        for (reason, expected) in cases {
            assert_eq!(disposition_for(reason), expected, "{reason:?}");
        }
    }

    #[test]
    fn client_preempted_never_sends_an_error_event() {
        assert!(!should_send_error_to_client(AbortReason::ClientPreempted, false));
        assert!(!should_send_error_to_client(AbortReason::ClientPreempted, true));
    }

    #[test]
    fn fail_request_reasons_gate_on_wrote_downstream() {
        assert!(should_send_error_to_client(AbortReason::WriteUpstream, false));
        assert!(!should_send_error_to_client(AbortReason::WriteUpstream, true));
    }

    #[test]
    fn continue_turn_reasons_other_than_preempt_always_send() {
        assert!(should_send_error_to_client(AbortReason::PreviousResponse, true));
        assert!(should_send_error_to_client(AbortReason::UpstreamRestart, false));
    }

    #[test]
    fn close_gracefully_never_sends_an_error_event() {
        assert!(!should_send_error_to_client(AbortReason::ContextCanceled, false));
        assert!(!should_send_error_to_client(AbortReason::ClientClosed, true));
    }

    #[test]
    fn session_last_response_id_survives_benign_reasons() {
        assert!(!should_clear_session_last_response_id(AbortReason::ClientPreempted));
        assert!(!should_clear_session_last_response_id(AbortReason::ContextCanceled));
        assert!(!should_clear_session_last_response_id(AbortReason::ClientClosed));
        assert!(should_clear_session_last_response_id(AbortReason::PreviousResponse));
        assert!(should_clear_session_last_response_id(AbortReason::WriteUpstream));
    }

    #[test]
    fn policy_violation_close_fails_the_request_without_retry() {
        let close_err = ClientCloseError {
            code: 1008,
            reason: "prompt violates usage policy".to_string(),
        };
        let err = TurnError::new(AbortReason::PolicyViolation, false, close_err);
        let resolution = resolve_turn_error(&err);
        assert_eq!(resolution.disposition, Disposition::FailRequest);
        let event = resolution.client_event.expect("should send");
        assert_eq!(event["error"]["code"], "policy_violation");
    }

    #[test]
    fn close_code_classification_matches_spec_table() {
        assert_eq!(classify_close_code(1000), UpstreamCloseClass::ClientDisconnect);
        assert_eq!(classify_close_code(1006), UpstreamCloseClass::ClientDisconnect);
        assert_eq!(classify_close_code(1012), UpstreamCloseClass::UpstreamRestart);
        assert_eq!(classify_close_code(1013), UpstreamCloseClass::UpstreamRestart);
        assert_eq!(classify_close_code(1008), UpstreamCloseClass::PolicyViolation);
        assert_eq!(classify_close_code(4000), UpstreamCloseClass::Other);
    }

    #[test]
    fn resolve_turn_error_synthesizes_the_error_event_shape() {
        let err = TurnError::new(AbortReason::WriteUpstream, false, anyhow::anyhow!("boom"));
        let resolution = resolve_turn_error(&err);
        assert_eq!(resolution.disposition, Disposition::FailRequest);
        let event = resolution.client_event.expect("should send");
        assert_eq!(event["type"], "error");
        assert_eq!(event["error"]["code"], "write_upstream");
    }
}
