//! The hot-path event parser (spec.md §4.4): pulls only `type`, `id`, and
//! `response.id` out of an upstream message. `serde_json` skips every other
//! field during deserialization, so this is cheap even on a large payload;
//! callers reach for [`crate::openai::StreamEnvelope`] only once the event
//! type signals usage or a tool call.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LightFields {
    #[serde(rename = "type")]
    event_type: Option<String>,
    id: Option<String>,
    response: Option<LightResponse>,
}

#[derive(Debug, Deserialize)]
struct LightResponse {
    id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightEvent {
    pub event_type: Option<String>,
    pub id: Option<String>,
    pub response_id: Option<String>,
}

impl LightEvent {
    /// Terminal events (spec.md §4.4 step 7): exact `type` match, not a prefix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_deref(),
            Some(
                "response.completed"
                    | "response.done"
                    | "response.failed"
                    | "response.incomplete"
                    | "response.cancelled"
                    | "response.canceled"
            )
        )
    }

    /// Streamed-token deltas; everything else that isn't terminal is treated
    /// as a structural event (created, output_item.added, ...).
    pub fn is_token_event(&self) -> bool {
        self.event_type.as_deref().is_some_and(|t| t.ends_with(".delta"))
    }

    pub fn is_error(&self) -> bool {
        self.event_type.as_deref() == Some("error")
    }

    pub fn is_function_call(&self) -> bool {
        matches!(
            self.event_type.as_deref(),
            Some("response.output_item.done" | "response.function_call_arguments.done")
        )
    }
}

pub fn parse_light(bytes: &[u8]) -> Option<LightEvent> {
    let fields: LightFields = serde_json::from_slice(bytes).ok()?;
    Some(LightEvent {
        event_type: fields.event_type,
        id: fields.id,
        response_id: fields.response.and_then(|r| r.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_type_id_and_nested_response_id() {
        let bytes = br#"{"type":"response.completed","id":"evt_1","response":{"id":"resp_1","usage":{"input_tokens":5}}}"#;
        let ev = parse_light(bytes).unwrap();
        assert_eq!(ev.event_type.as_deref(), Some("response.completed"));
        assert_eq!(ev.id.as_deref(), Some("evt_1"));
        assert_eq!(ev.response_id.as_deref(), Some("resp_1"));
        assert!(ev.is_terminal());
    }

    #[test]
    fn delta_events_are_token_events_not_terminal() {
        let bytes = br#"{"type":"response.output_text.delta","id":"evt_2"}"#;
        let ev = parse_light(bytes).unwrap();
        assert!(ev.is_token_event());
        assert!(!ev.is_terminal());
    }

    #[test]
    fn malformed_json_returns_none() {
        assert!(parse_light(b"not json").is_none());
    }
}
