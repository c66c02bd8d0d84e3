//! Process-wide operational event hub. Every subsystem (pool, context,
//! forwarder, refresh scheduler) emits into the same hub so a single
//! terminal/log sink can observe the whole gateway.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::AccountId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    AccountCooldownStart {
        at: SystemTime,
        account_id: AccountId,
        reason: String,
        until: SystemTime,
    },
    AccountCooldownEnd {
        at: SystemTime,
        account_id: AccountId,
    },
    ConnDialFailed {
        at: SystemTime,
        account_id: AccountId,
        status: Option<u16>,
        message: String,
    },
    ConnEvicted {
        at: SystemTime,
        account_id: AccountId,
        conn_id: u64,
        reason: &'static str,
    },
    ContextMigrated {
        at: SystemTime,
        account_id: AccountId,
        from_session: String,
        to_session: String,
        score: i32,
    },
    TurnFailed {
        at: SystemTime,
        account_id: AccountId,
        stage: String,
        wrote_downstream: bool,
    },
    TokenRefreshed {
        at: SystemTime,
        account_id: AccountId,
    },
    TokenRefreshFailed {
        at: SystemTime,
        account_id: AccountId,
        retryable: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Operational(OperationalEvent),
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event_ref = event.clone();
            tokio::spawn(async move {
                sink.write(&event_ref).await;
            });
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// An [`EventSink`] that writes to `tracing`, used as the default sink in
/// `apps/gproxy-gateway` so every operational event lands in structured logs.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Event::Operational(op) = event;
            match op {
                OperationalEvent::AccountCooldownStart {
                    account_id, reason, ..
                } => {
                    tracing::warn!(account_id, reason, "account entered fallback cooldown");
                }
                OperationalEvent::AccountCooldownEnd { account_id, .. } => {
                    tracing::info!(account_id, "account fallback cooldown expired");
                }
                OperationalEvent::ConnDialFailed {
                    account_id,
                    status,
                    message,
                    ..
                } => {
                    tracing::warn!(account_id, status, message, "upstream dial failed");
                }
                OperationalEvent::ConnEvicted {
                    account_id,
                    conn_id,
                    reason,
                    ..
                } => {
                    tracing::debug!(account_id, conn_id, reason, "upstream conn evicted");
                }
                OperationalEvent::ContextMigrated {
                    account_id,
                    from_session,
                    to_session,
                    score,
                    ..
                } => {
                    tracing::info!(
                        account_id,
                        from_session,
                        to_session,
                        score,
                        "ingress context migrated"
                    );
                }
                OperationalEvent::TurnFailed {
                    account_id,
                    stage,
                    wrote_downstream,
                    ..
                } => {
                    tracing::warn!(account_id, stage, wrote_downstream, "turn failed");
                }
                OperationalEvent::TokenRefreshed { account_id, .. } => {
                    tracing::info!(account_id, "oauth token refreshed");
                }
                OperationalEvent::TokenRefreshFailed {
                    account_id,
                    retryable,
                    message,
                    ..
                } => {
                    tracing::error!(account_id, retryable, message, "oauth token refresh failed");
                }
            }
        })
    }
}
