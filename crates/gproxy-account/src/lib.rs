//! Account and credential model shared by the pool, context, forwarder and
//! refresh-scheduler crates, plus the process-wide fallback-cooldown map and
//! the operational event hub they all emit into.

pub mod account;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod headers;

pub use account::{
    AccountId, AccountSnapshot, AccountStatus, AuthType, Credential, OAuthCredential,
};
pub use errors::AccountError;
pub use events::{Event, EventHub, EventSink, OperationalEvent};
pub use fallback::FallbackCooldownMap;
pub use headers::{Headers, header_get, header_remove, header_set};
