//! Payload rewriting and recovery decisions (spec.md §4.4 step 1-2, §4.5):
//! resolving `previous_response_id` before send, the proactive
//! `tool_output_not_found` check, and recovering from an upstream
//! `previous_response_not_found` error without ever dropping
//! `previous_response_id` while a `function_call_output` item depends on it.

use gproxy_protocol::RequestEnvelope;

use crate::errors::{AbortReason, TurnError};

/// Resolves the session's remembered `previous_response_id` onto `payload`
/// just before send, unless the client already supplied its own value
/// (spec.md §4.4 step 1). A no-op when there is nothing to resolve — the
/// idempotence law spec.md §8 requires of `normalize`.
pub fn normalize_previous_response_id(mut payload: RequestEnvelope, expected: Option<&str>) -> RequestEnvelope {
    if payload.previous_response_id().is_some() {
        return payload;
    }
    if let Some(expected) = expected {
        payload.set_previous_response_id(expected);
    }
    payload
}

/// The proactive `tool_output_not_found` check (spec.md §4.4 step 2): in
/// store-disabled mode, a `function_call_output` item with no
/// `previous_response_id` and no `item_reference` to anchor it can never be
/// resolved upstream, so the turn fails before a single byte is written.
pub fn preflight_tool_output_check(payload: &RequestEnvelope) -> Result<(), TurnError> {
    if payload.has_function_call_output() && payload.previous_response_id().is_none() && !payload.has_item_reference() {
        return Err(TurnError::new(
            AbortReason::ToolOutput,
            false,
            anyhow::anyhow!(
                "function_call_output present without previous_response_id, a stored turn, or item_reference"
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousResponseRecovery {
    /// Replay with `previous_response_id` set (was missing) or aligned (was
    /// stale) to the session's remembered value. Transparent to the client.
    Replay,
    /// `function_call_output` items are present and there is no remembered
    /// value to align to; dropping would orphan them. Abort instead
    /// (`ContinueTurn` disposition — the client must reissue the request).
    AbortPreserveToolOutputs,
    /// No `function_call_output` items: safe to drop the stale id and
    /// replay bare. Transparent to the client.
    DropAndReplay,
}

/// Decides how to recover from an upstream `previous_response_not_found`
/// error (spec.md §4.5). Never drops `previous_response_id` while
/// `function_call_output` items are present in the same request.
pub fn recover_previous_response_not_found(
    payload: &RequestEnvelope,
    expected: Option<&str>,
) -> PreviousResponseRecovery {
    if let Some(expected) = expected {
        if payload.previous_response_id() != Some(expected) {
            // Covers both "missing" (None != Some) and "stale" (mismatch).
            return PreviousResponseRecovery::Replay;
        }
    }
    if payload.has_function_call_output() {
        PreviousResponseRecovery::AbortPreserveToolOutputs
    } else {
        PreviousResponseRecovery::DropAndReplay
    }
}

/// Applies a [`PreviousResponseRecovery`] decision, returning the rewritten
/// payload and whether a replay is warranted.
pub fn apply_previous_response_recovery(
    payload: RequestEnvelope,
    expected: Option<&str>,
    decision: PreviousResponseRecovery,
) -> (RequestEnvelope, bool) {
    match decision {
        PreviousResponseRecovery::Replay => {
            let mut payload = payload;
            if let Some(expected) = expected {
                payload.set_previous_response_id(expected);
            }
            (payload, true)
        }
        PreviousResponseRecovery::DropAndReplay => {
            let (payload, _removed) = payload.drop_previous_response_id();
            (payload, true)
        }
        PreviousResponseRecovery::AbortPreserveToolOutputs => (payload, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_is_a_no_op_without_an_expected_value() {
        let payload = RequestEnvelope::from_value(json!({"model": "gpt-5"}));
        let out = normalize_previous_response_id(payload, None);
        assert!(out.previous_response_id().is_none());
    }

    #[test]
    fn normalize_never_overrides_a_client_supplied_value() {
        let payload = RequestEnvelope::from_value(json!({"previous_response_id": "resp_client"}));
        let out = normalize_previous_response_id(payload, Some("resp_session"));
        assert_eq!(out.previous_response_id(), Some("resp_client"));
    }

    #[test]
    fn normalize_fills_in_the_session_value_when_missing() {
        let payload = RequestEnvelope::from_value(json!({"model": "gpt-5"}));
        let out = normalize_previous_response_id(payload, Some("resp_session"));
        assert_eq!(out.previous_response_id(), Some("resp_session"));
    }

    #[test]
    fn preflight_rejects_bare_tool_output_in_store_disabled_mode() {
        let payload = RequestEnvelope::from_value(json!({
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        }));
        let err = preflight_tool_output_check(&payload).unwrap_err();
        assert_eq!(err.stage, AbortReason::ToolOutput);
        assert!(!err.wrote_downstream);
    }

    #[test]
    fn preflight_allows_tool_output_anchored_by_previous_response_id() {
        let payload = RequestEnvelope::from_value(json!({
            "previous_response_id": "resp_1",
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        }));
        assert!(preflight_tool_output_check(&payload).is_ok());
    }

    #[test]
    fn preflight_allows_tool_output_anchored_by_item_reference() {
        let payload = RequestEnvelope::from_value(json!({
            "input": [
                {"type": "item_reference", "id": "resp_1"},
                {"type": "function_call_output", "call_id": "call_1"},
            ],
        }));
        assert!(preflight_tool_output_check(&payload).is_ok());
    }

    #[test]
    fn recovers_a_missing_previous_response_id_by_replaying() {
        let payload = RequestEnvelope::from_value(json!({"model": "gpt-5"}));
        let decision = recover_previous_response_not_found(&payload, Some("resp_session"));
        assert_eq!(decision, PreviousResponseRecovery::Replay);
        let (rewritten, replay) = apply_previous_response_recovery(payload, Some("resp_session"), decision);
        assert!(replay);
        assert_eq!(rewritten.previous_response_id(), Some("resp_session"));
    }

    #[test]
    fn aligns_a_stale_previous_response_id_while_preserving_tool_outputs() {
        let payload = RequestEnvelope::from_value(json!({
            "previous_response_id": "resp_stale",
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        }));
        let decision = recover_previous_response_not_found(&payload, Some("resp_fresh"));
        assert_eq!(decision, PreviousResponseRecovery::Replay);
        let (rewritten, replay) = apply_previous_response_recovery(payload, Some("resp_fresh"), decision);
        assert!(replay);
        assert_eq!(rewritten.previous_response_id(), Some("resp_fresh"));
        assert!(rewritten.has_function_call_output());
    }

    #[test]
    fn never_drops_previous_response_id_while_tool_outputs_are_pending() {
        let payload = RequestEnvelope::from_value(json!({
            "previous_response_id": "resp_unknown",
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        }));
        // No remembered session value to align to.
        let decision = recover_previous_response_not_found(&payload, None);
        assert_eq!(decision, PreviousResponseRecovery::AbortPreserveToolOutputs);
        let (rewritten, replay) = apply_previous_response_recovery(payload, None, decision);
        assert!(!replay);
        assert!(rewritten.has_function_call_output());
    }

    #[test]
    fn drops_and_replays_a_stale_id_with_no_tool_outputs_at_stake() {
        let payload = RequestEnvelope::from_value(json!({"previous_response_id": "resp_unknown"}));
        let decision = recover_previous_response_not_found(&payload, None);
        assert_eq!(decision, PreviousResponseRecovery::DropAndReplay);
        let (rewritten, replay) = apply_previous_response_recovery(payload, None, decision);
        assert!(replay);
        assert!(rewritten.previous_response_id().is_none());
    }
}
