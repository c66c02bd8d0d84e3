//! The C7 Tool-Call Corrector: rewrites upstream tool-call names and
//! argument field casing in-band, before an event reaches the client.

pub mod corrector;

pub use corrector::{CorrectorStats, correct_bytes};
