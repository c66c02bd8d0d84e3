//! Opaque OpenAI Responses wire envelope (spec.md §1 non-goal: "does not
//! standardize the wire format itself"; §6 lists the only fields this core
//! ever inspects). Both directions are modeled as a thin wrapper over
//! `serde_json::Value` rather than a full typed schema: unknown fields
//! round-trip untouched, which is the property the Recovery Engine (C5)
//! depends on when it rewrites `previous_response_id` in place.

pub mod envelope;
pub mod light;

pub use envelope::{InputItemKind, RequestEnvelope, ResponseUsage, StreamEnvelope, UpstreamErrorInfo};
pub use light::{LightEvent, parse_light};
