//! The C7 Tool-Call Corrector: in-band rewriting of upstream tool-call
//! events into the names and argument field casing the downstream client
//! expects (spec.md §4.7). A byte-level substring gate skips the common
//! case (no tool call in this event) before paying for a JSON parse.

use std::collections::HashMap;
use std::sync::Mutex;

use gproxy_protocol::tool_names::{BASH_WORKDIR_ALIASES, BASH_WORKDIR_CANONICAL, EDIT_FIELD_RENAMES, canonical_tool_name};
use serde_json::{Map, Value};

/// Per-rename counters, recorded under one mutex (spec.md §4.7).
#[derive(Default)]
pub struct CorrectorStats {
    renames: Mutex<HashMap<String, u64>>,
}

impl CorrectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_rename(&self, canonical_name: &str) {
        let mut renames = self.renames.lock().expect("corrector stats mutex poisoned");
        *renames.entry(canonical_name.to_string()).or_insert(0) += 1;
    }

    pub fn count_for(&self, canonical_name: &str) -> u64 {
        *self
            .renames
            .lock()
            .expect("corrector stats mutex poisoned")
            .get(canonical_name)
            .unwrap_or(&0)
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn fast_gate(bytes: &[u8]) -> bool {
    contains_bytes(bytes, b"tool_calls") || contains_bytes(bytes, b"function_call") || contains_bytes(bytes, br#""function":{"name""#)
}

/// Renames the first present alias in `map` to `canonical`, skipping if
/// `canonical` is already present. Never evicts the canonical value.
fn rename_field(map: &mut Map<String, Value>, canonical: &str, aliases: &[&str]) -> bool {
    if map.contains_key(canonical) {
        return false;
    }
    for alias in aliases {
        if let Some(value) = map.remove(*alias) {
            map.insert(canonical.to_string(), value);
            return true;
        }
    }
    false
}

fn rewrite_bash_args(args: &mut Value) -> bool {
    match args {
        Value::Object(map) => rename_field(map, BASH_WORKDIR_CANONICAL, BASH_WORKDIR_ALIASES),
        Value::String(raw) => rewrite_stringified_args(raw, |map| rename_field(map, BASH_WORKDIR_CANONICAL, BASH_WORKDIR_ALIASES)),
        _ => false,
    }
}

fn rewrite_edit_args(args: &mut Value) -> bool {
    match args {
        Value::Object(map) => rewrite_edit_fields(map),
        Value::String(raw) => rewrite_stringified_args(raw, rewrite_edit_fields),
        _ => false,
    }
}

fn rewrite_edit_fields(map: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    for (canonical, aliases) in EDIT_FIELD_RENAMES {
        changed |= rename_field(map, canonical, aliases);
    }
    changed
}

/// Tool arguments are frequently wire-encoded as a JSON string rather than a
/// nested object; parse, apply `rewrite`, and re-encode only if it changed
/// something.
fn rewrite_stringified_args(raw: &mut String, rewrite: impl FnOnce(&mut Map<String, Value>) -> bool) -> bool {
    let Ok(Value::Object(mut parsed)) = serde_json::from_str::<Value>(raw) else {
        return false;
    };
    if !rewrite(&mut parsed) {
        return false;
    }
    if let Ok(reencoded) = serde_json::to_string(&Value::Object(parsed)) {
        *raw = reencoded;
        true
    } else {
        false
    }
}

/// Rewrites one `{name, arguments}` function-call object in place.
fn rewrite_function_object(obj: &mut Map<String, Value>, stats: &CorrectorStats) -> bool {
    let Some(name) = obj.get("name").and_then(Value::as_str).map(str::to_string) else {
        return false;
    };
    let canonical = canonical_tool_name(&name);
    let mut changed = false;
    if let Some(canonical_name) = canonical {
        obj.insert("name".to_string(), Value::String(canonical_name.to_string()));
        stats.record_rename(canonical_name);
        changed = true;
    }
    let effective_name = canonical.unwrap_or(name.as_str());
    if let Some(args) = obj.get_mut("arguments") {
        changed |= match effective_name {
            "bash" => rewrite_bash_args(args),
            "edit" => rewrite_edit_args(args),
            _ => false,
        };
    }
    changed
}

/// Applies the `tool_calls[*].function` / `function_call` rewrite to any
/// object that might hold them directly: the event root, a `delta` object,
/// or a Chat-Completions-style `message` object.
fn rewrite_container(obj: &mut Map<String, Value>, stats: &CorrectorStats) -> bool {
    let mut changed = false;
    if let Some(Value::Array(items)) = obj.get_mut("tool_calls") {
        for item in items.iter_mut() {
            if let Value::Object(item_obj) = item {
                if let Some(Value::Object(func_obj)) = item_obj.get_mut("function") {
                    changed |= rewrite_function_object(func_obj, stats);
                }
            }
        }
    }
    if let Some(Value::Object(func_obj)) = obj.get_mut("function_call") {
        changed |= rewrite_function_object(func_obj, stats);
    }
    changed
}

fn rewrite_value(value: &mut Value, stats: &CorrectorStats) -> bool {
    let Value::Object(root) = value else {
        return false;
    };
    let mut changed = rewrite_container(root, stats);
    if let Some(Value::Object(delta)) = root.get_mut("delta") {
        changed |= rewrite_container(delta, stats);
    }
    if let Some(Value::Array(choices)) = root.get_mut("choices") {
        for choice in choices.iter_mut() {
            let Value::Object(choice_obj) = choice else { continue };
            if let Some(Value::Object(delta)) = choice_obj.get_mut("delta") {
                changed |= rewrite_container(delta, stats);
            }
            if let Some(Value::Object(message)) = choice_obj.get_mut("message") {
                changed |= rewrite_container(message, stats);
            }
        }
    }
    changed
}

/// Returns the (possibly unchanged) bytes and whether a rewrite happened.
pub fn correct_bytes(bytes: &[u8], stats: &CorrectorStats) -> (Vec<u8>, bool) {
    if !fast_gate(bytes) {
        return (bytes.to_vec(), false);
    }
    let Ok(mut value) = serde_json::from_slice::<Value>(bytes) else {
        return (bytes.to_vec(), false);
    };
    if !rewrite_value(&mut value, stats) {
        return (bytes.to_vec(), false);
    }
    match serde_json::to_vec(&value) {
        Ok(out) => (out, true),
        Err(_) => (bytes.to_vec(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_gate_skips_events_with_no_tool_call_markers() {
        let bytes = br#"{"type":"response.output_text.delta","delta":"hi"}"#;
        let stats = CorrectorStats::new();
        let (out, changed) = correct_bytes(bytes, &stats);
        assert!(!changed);
        assert_eq!(out, bytes);
    }

    #[test]
    fn renames_legacy_tool_name_in_function_call() {
        let bytes = br#"{"type":"response.output_item.done","function_call":{"name":"apply_patch","arguments":"{}"}}"#;
        let stats = CorrectorStats::new();
        let (out, changed) = correct_bytes(bytes, &stats);
        assert!(changed);
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["function_call"]["name"], "edit");
        assert_eq!(stats.count_for("edit"), 1);
    }

    #[test]
    fn bash_work_dir_alias_is_renamed_to_workdir_in_stringified_args() {
        let bytes = br#"{"tool_calls":[{"function":{"name":"execute_bash","arguments":"{\"work_dir\":\"/tmp\",\"command\":\"ls\"}"}}]}"#;
        let stats = CorrectorStats::new();
        let (out, changed) = correct_bytes(bytes, &stats);
        assert!(changed);
        let value: Value = serde_json::from_slice(&out).unwrap();
        let args_str = value["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        let args: Value = serde_json::from_str(args_str).unwrap();
        assert_eq!(args["workdir"], "/tmp");
        assert!(args.get("work_dir").is_none());
    }

    #[test]
    fn edit_field_renames_pick_first_non_conflicting_source() {
        let bytes = br#"{"delta":{"function_call":{"name":"apply_patch","arguments":{"path":"a.rs","old_string":"x","new_string":"y"}}}}"#;
        let stats = CorrectorStats::new();
        let (out, changed) = correct_bytes(bytes, &stats);
        assert!(changed);
        let value: Value = serde_json::from_slice(&out).unwrap();
        let args = &value["delta"]["function_call"]["arguments"];
        assert_eq!(args["filePath"], "a.rs");
        assert_eq!(args["oldString"], "x");
        assert_eq!(args["newString"], "y");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let bytes = br#"{"tool_calls":[{"function":{"name":"apply_patch","arguments":{"file_path":"a.rs"}}}]}"#;
        let stats = CorrectorStats::new();
        let (once, _) = correct_bytes(bytes, &stats);
        let (twice, changed_again) = correct_bytes(&once, &stats);
        assert!(!changed_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn already_canonical_name_is_left_alone() {
        let bytes = br#"{"function_call":{"name":"bash","arguments":{"workdir":"/tmp"}}}"#;
        let stats = CorrectorStats::new();
        let (_, changed) = correct_bytes(bytes, &stats);
        assert!(!changed);
    }
}
