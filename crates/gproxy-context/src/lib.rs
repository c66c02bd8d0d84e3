//! The C2 Ingress Context Pool: per-session reservation of a dedicated
//! upstream connection, built on top of the C1 [`gproxy_pool`] dialer
//! abstraction. Scheduling policy (stickiness tiers, migration scoring) is
//! split out into [`stickiness`] as pure functions so it can be tested
//! without a running pool.

pub mod context;
pub mod errors;
pub mod stickiness;

pub use context::{
    AcquireContextRequest, ContextLease, ContextPool, ContextPoolConfig, CtxId, IngressContextEntry, SessionKey,
    session_key,
};
pub use errors::ContextError;
pub use stickiness::{MigrationScoreInputs, Stickiness, StickinessInputs, compute_stickiness, migration_score};
