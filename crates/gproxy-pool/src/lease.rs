use std::sync::Arc;
use std::time::Duration;

use gproxy_account::Headers;
use tokio_tungstenite::tungstenite::Message;

use crate::conn::{ConnId, UpstreamConn};
use crate::errors::PoolError;

#[derive(Debug, Clone, Copy, Default)]
pub struct LeaseMetrics {
    pub queue_wait: Duration,
    pub conn_pick_duration: Duration,
    pub reused: bool,
}

/// A capacity-1 hold on one [`UpstreamConn`]. Dropping it releases the
/// underlying semaphore permit immediately; `mark_broken` additionally
/// closes the socket so the conn is never handed out again.
pub struct Lease {
    conn: Arc<UpstreamConn>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    metrics: LeaseMetrics,
}

impl Lease {
    pub(crate) fn new(
        conn: Arc<UpstreamConn>,
        permit: tokio::sync::OwnedSemaphorePermit,
        metrics: LeaseMetrics,
    ) -> Self {
        Self {
            conn,
            _permit: permit,
            metrics,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn.conn_id
    }

    pub fn handshake_headers(&self) -> &Headers {
        &self.conn.handshake_headers
    }

    pub fn metrics(&self) -> LeaseMetrics {
        self.metrics
    }

    pub async fn write_json(&self, value: &serde_json::Value) -> Result<(), PoolError> {
        self.conn.write_json(value).await
    }

    pub async fn read_message(&self) -> Result<Option<Message>, PoolError> {
        self.conn.read_message().await
    }

    pub async fn ping(&self, budget: Duration) -> Result<(), PoolError> {
        self.conn.ping(budget).await
    }

    /// Closes the underlying conn and flags it so the pool never selects it
    /// again; the next acquire for this account dials fresh.
    pub async fn mark_broken(self) {
        self.conn.close().await;
    }

    /// Explicit release; equivalent to letting the lease drop.
    pub fn release(self) {}
}
