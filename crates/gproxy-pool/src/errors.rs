use thiserror::Error;

use gproxy_account::Headers;

#[derive(Debug, Error)]
#[error("dial failed (status={status:?}): {cause}")]
pub struct DialError {
    pub status: Option<u16>,
    pub headers: Headers,
    pub cause: String,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("account has no spare capacity")]
    ConnQueueFull,
    #[error("preferred conn is unavailable")]
    PreferredConnUnavailable,
    #[error("invalid acquire request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write upstream failed: {0}")]
    WriteUpstream(String),
    #[error("read upstream failed: {0}")]
    ReadUpstream(String),
    #[error("ping timed out")]
    PingTimeout,
    #[error("connection closed")]
    ConnClosed,
    #[error("account {0} is unknown to the pool")]
    UnknownAccount(gproxy_account::AccountId),
}
