//! The C4 Turn Forwarder and C5 Recovery Engine (spec.md §4.4, §4.5). They
//! share a crate because every abort the forwarder's relay loop can hit is
//! resolved, in the same call, by the recovery engine's disposition table —
//! there is no useful boundary to draw between "drive the turn" and
//! "decide what a failed turn means" at runtime.

pub mod errors;
pub mod forwarder;
pub mod recovery;
pub mod turn;

pub use errors::{
    AbortReason, ClientCloseError, Disposition, ErrorResolution, TurnError, UpstreamCloseClass, classify_close_code,
    disposition_for, resolve_turn_error, should_clear_session_last_response_id, should_send_error_to_client,
};
pub use forwarder::{ForwarderConfig, SessionParams, TurnForwarder};
pub use recovery::{
    PreviousResponseRecovery, apply_previous_response_recovery, normalize_previous_response_id,
    preflight_tool_output_check, recover_previous_response_not_found,
};
pub use turn::{ClientSignal, ClientSink, ClientWriteError, NoopHooks, PartialTurnResult, TurnHooks, TurnOutcome};
