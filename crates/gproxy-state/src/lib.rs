//! The C3 Distributed Session & Response State Store: sharded local
//! bindings for response↔conn and session turn state, plus a
//! cache-confirmed response→account mapping for cross-instance stickiness.

pub mod sharded;
pub mod state;

pub use sharded::ShardedMap;
pub use state::{StateStore, StateStoreConfig, TurnState, response_cache_key, session_key};
