//! The C6 Token-Refresh Scheduler: drives a pluggable [`Refresher`] across
//! all active accounts on a timer, bounded by a worker pool and coordinated
//! across instances by a [`gproxy_storage::DistributedLock`].

pub mod http_refresher;
pub mod refresher;
pub mod scheduler;

pub use http_refresher::HttpOAuthRefresher;
pub use refresher::{ErrorClass, RefreshError, Refresher, classify_refresh_error};
pub use scheduler::RefreshScheduler;
