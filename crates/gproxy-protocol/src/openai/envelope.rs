//! Full-parse accessors over the recognized fields of spec.md §6. Built on
//! `serde_json::Value` rather than a typed request/response schema so a
//! field this core has never heard of still survives a normalize-and-replay
//! round trip untouched.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputItemKind {
    FunctionCallOutput,
    ToolCall,
    FunctionCall,
    ItemReference,
    InputText,
    Other,
}

impl InputItemKind {
    fn from_type(ty: &str) -> Self {
        match ty {
            "function_call_output" => InputItemKind::FunctionCallOutput,
            "tool_call" => InputItemKind::ToolCall,
            "function_call" => InputItemKind::FunctionCall,
            "item_reference" => InputItemKind::ItemReference,
            "input_text" => InputItemKind::InputText,
            _ => InputItemKind::Other,
        }
    }
}

/// A client `response.create` payload (or upstream replay of one). Wraps the
/// raw JSON object so fields outside spec.md §6's recognized set are
/// preserved verbatim across normalize/rewrite/replay.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    value: Value,
}

impl RequestEnvelope {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value = serde_json::from_slice(bytes)?;
        Ok(Self { value })
    }

    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.value)
    }

    fn object(&self) -> Option<&Map<String, Value>> {
        self.value.as_object()
    }

    fn object_mut(&mut self) -> &mut Map<String, Value> {
        if !self.value.is_object() {
            self.value = Value::Object(Map::new());
        }
        self.value.as_object_mut().expect("just ensured object")
    }

    pub fn model(&self) -> Option<&str> {
        self.object()?.get("model")?.as_str()
    }

    pub fn stream(&self) -> Option<bool> {
        self.object()?.get("stream")?.as_bool()
    }

    pub fn store(&self) -> Option<bool> {
        self.object()?.get("store")?.as_bool()
    }

    pub fn prompt_cache_key(&self) -> Option<&str> {
        self.object()?.get("prompt_cache_key")?.as_str()
    }

    pub fn reasoning_effort(&self) -> Option<&str> {
        let obj = self.object()?;
        if let Some(v) = obj.get("reasoning_effort").and_then(Value::as_str) {
            return Some(v);
        }
        obj.get("reasoning")?.get("effort")?.as_str()
    }

    pub fn previous_response_id(&self) -> Option<&str> {
        self.object()?.get("previous_response_id")?.as_str()
    }

    /// Idempotent: the value at the field if already absent is simply
    /// overwritten with `None`'s no-op, matching spec.md §8's
    /// normalize/drop idempotence laws.
    pub fn set_previous_response_id(&mut self, id: &str) {
        self.object_mut()
            .insert("previous_response_id".to_string(), Value::String(id.to_string()));
    }

    /// Returns `(payload, removed)`; `removed` is `false` if the field was
    /// already absent, per spec.md §8's idempotence law for this operation.
    pub fn drop_previous_response_id(mut self) -> (Self, bool) {
        let removed = self
            .object_mut()
            .remove("previous_response_id")
            .is_some();
        (self, removed)
    }

    fn input_items(&self) -> Vec<&Value> {
        self.object()
            .and_then(|o| o.get("input"))
            .and_then(Value::as_array)
            .map(|items| items.iter().collect())
            .unwrap_or_default()
    }

    pub fn input_item_kinds(&self) -> Vec<InputItemKind> {
        self.input_items()
            .into_iter()
            .map(|item| {
                item.get("type")
                    .and_then(Value::as_str)
                    .map(InputItemKind::from_type)
                    .unwrap_or(InputItemKind::Other)
            })
            .collect()
    }

    pub fn has_function_call_output(&self) -> bool {
        self.input_item_kinds()
            .iter()
            .any(|k| matches!(k, InputItemKind::FunctionCallOutput))
    }

    pub fn has_item_reference(&self) -> bool {
        self.input_item_kinds()
            .iter()
            .any(|k| matches!(k, InputItemKind::ItemReference))
    }

    pub fn function_call_output_call_ids(&self) -> Vec<String> {
        self.input_items()
            .into_iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call_output"))
            .filter_map(|item| item.get("call_id").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
}

impl ResponseUsage {
    pub fn accumulate(&mut self, other: ResponseUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamErrorInfo {
    pub code: Option<String>,
    pub kind: Option<String>,
    pub message: Option<String>,
}

impl UpstreamErrorInfo {
    /// One of the codes enumerated in spec.md §6 that the Recovery Engine
    /// treats as a request to re-anchor `previous_response_id`.
    pub fn is_previous_response_not_found(&self) -> bool {
        self.code.as_deref() == Some("previous_response_not_found")
    }

    pub fn is_tool_output_not_found(&self) -> bool {
        self.code.as_deref() == Some("tool_output_not_found")
    }

    /// Maps `error.type` to the HTTP status the SSE-fallback path would use
    /// (spec.md §6's "HTTP status mapping for WS error events").
    pub fn http_status(&self) -> Option<u16> {
        match self.kind.as_deref()? {
            "invalid_request" => Some(400),
            "authentication" => Some(401),
            "permission" => Some(403),
            "rate_limit" => Some(429),
            "server_error" => Some(502),
            _ => None,
        }
    }
}

/// An upstream message (event or terminal) once full parsing is warranted.
#[derive(Debug, Clone)]
pub struct StreamEnvelope {
    value: Value,
}

impl StreamEnvelope {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value = serde_json::from_slice(bytes)?;
        Ok(Self { value })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.value.get("type")?.as_str()
    }

    pub fn response_id(&self) -> Option<&str> {
        self.value.get("response")?.get("id")?.as_str()
    }

    pub fn usage(&self) -> Option<ResponseUsage> {
        let usage = self.value.get("response")?.get("usage")?;
        Some(ResponseUsage {
            input_tokens: usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0),
            output_tokens: usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0),
            cached_tokens: usage
                .get("input_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(Value::as_i64)
                .unwrap_or(0),
        })
    }

    pub fn error(&self) -> Option<UpstreamErrorInfo> {
        let error = self.value.get("error")?;
        Some(UpstreamErrorInfo {
            code: error.get("code").and_then(Value::as_str).map(str::to_string),
            kind: error.get("type").and_then(Value::as_str).map(str::to_string),
            message: error.get("message").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// `call_id`s of `function_call` items surfaced on a terminal event's
    /// output, used to populate the pending-tool-call binding (spec.md §4.3).
    pub fn function_call_ids(&self) -> Vec<String> {
        let Some(output) = self.value.get("response").and_then(|r| r.get("output")).and_then(Value::as_array)
        else {
            return Vec::new();
        };
        output
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            .filter_map(|item| item.get("call_id").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_previous_response_id_is_idempotent() {
        let env = RequestEnvelope::from_value(serde_json::json!({"model": "gpt-5"}));
        let (env, removed) = env.drop_previous_response_id();
        assert!(!removed);
        assert!(env.previous_response_id().is_none());
    }

    #[test]
    fn set_then_get_previous_response_id_round_trips() {
        let mut env = RequestEnvelope::from_value(serde_json::json!({"model": "gpt-5"}));
        env.set_previous_response_id("resp_latest");
        assert_eq!(env.previous_response_id(), Some("resp_latest"));
    }

    #[test]
    fn detects_function_call_output_and_call_ids() {
        let env = RequestEnvelope::from_value(serde_json::json!({
            "previous_response_id": "resp_stale",
            "input": [{"type": "function_call_output", "call_id": "call_1"}],
        }));
        assert!(env.has_function_call_output());
        assert_eq!(env.function_call_output_call_ids(), vec!["call_1".to_string()]);
    }

    #[test]
    fn stream_envelope_extracts_usage_and_error() {
        let bytes = br#"{"type":"response.completed","response":{"id":"resp_1","usage":{"input_tokens":2,"output_tokens":1,"input_tokens_details":{"cached_tokens":0}}}}"#;
        let env = StreamEnvelope::from_bytes(bytes).unwrap();
        assert_eq!(env.response_id(), Some("resp_1"));
        let usage = env.usage().unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (2, 1));

        let err_bytes = br#"{"type":"error","error":{"code":"previous_response_not_found","type":"invalid_request","message":"not found"}}"#;
        let err_env = StreamEnvelope::from_bytes(err_bytes).unwrap();
        let err = err_env.error().unwrap();
        assert!(err.is_previous_response_not_found());
        assert_eq!(err.http_status(), Some(400));
    }
}
