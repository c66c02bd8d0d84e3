//! The C1 Upstream Conn Pool (spec.md §4.1): per-account pools of
//! persistent upstream WebSocket connections with lease, health-check,
//! idle eviction and prewarming.

pub mod conn;
pub mod dial;
pub mod errors;
pub mod lease;
pub mod pool;

pub use conn::{ConnId, UpstreamConn};
pub use dial::{Dialer, TungsteniteDialer, WsStream};
pub use errors::{DialError, PoolError};
pub use lease::{Lease, LeaseMetrics};
pub use pool::{AcquireRequest, ConnPool, ConnPoolConfig};
