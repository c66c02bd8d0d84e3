//! Opaque OpenAI Responses wire envelope, the incremental SSE parser, and
//! the tool-name canonicalization table shared by the forwarder and the
//! tool-call corrector.

pub mod openai;
pub mod sse;
pub mod tool_names;

pub use openai::{InputItemKind, LightEvent, RequestEnvelope, ResponseUsage, StreamEnvelope, UpstreamErrorInfo, parse_light};
pub use sse::{SseEvent, SseParser};
