use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use gproxy_account::{AccountId, Headers};

use crate::dial::WsStream;
use crate::errors::PoolError;

pub type ConnId = uuid::Uuid;

/// One persistent upstream WS connection (spec §3 `UpstreamConn`).
///
/// The write half and read half are split once at dial time and live behind
/// their own mutexes, so writes are totally ordered independently of reads:
/// a ping issued while nobody holds the lease never blocks behind a reader
/// that is mid-message.
pub struct UpstreamConn {
    pub conn_id: ConnId,
    pub account_id: AccountId,
    pub handshake_headers: Headers,
    pub created_at: Instant,
    last_used_at: Mutex<Instant>,
    pub(crate) lease_sem: Arc<tokio::sync::Semaphore>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    prewarmed: AtomicBool,
    pin_count: AtomicUsize,
    write_half: Mutex<SplitSink<WsStream, Message>>,
    read_half: Mutex<SplitStream<WsStream>>,
}

impl UpstreamConn {
    pub fn new(account_id: AccountId, handshake_headers: Headers, stream: WsStream) -> Arc<Self> {
        let (write_half, read_half) = stream.split();
        Arc::new(Self {
            conn_id: uuid::Uuid::now_v7(),
            account_id,
            handshake_headers,
            created_at: Instant::now(),
            last_used_at: Mutex::new(Instant::now()),
            lease_sem: Arc::new(tokio::sync::Semaphore::new(1)),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            prewarmed: AtomicBool::new(false),
            pin_count: AtomicUsize::new(0),
            write_half: Mutex::new(write_half),
            read_half: Mutex::new(read_half),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let _ = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    pub fn mark_prewarmed(&self) {
        self.prewarmed.store(true, Ordering::Release);
    }

    pub fn is_prewarmed(&self) -> bool {
        self.prewarmed.load(Ordering::Acquire)
    }

    pub async fn last_used_at(&self) -> Instant {
        *self.last_used_at.lock().await
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_used_at().await.elapsed()
    }

    async fn touch(&self) {
        *self.last_used_at.lock().await = Instant::now();
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Tracks the waiter count used by the pool's least-busy selection, then
    /// blocks on the capacity-1 lease semaphore.
    pub(crate) async fn acquire_lease(self: &Arc<Self>) -> tokio::sync::OwnedSemaphorePermit {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let permit = self
            .lease_sem
            .clone()
            .acquire_owned()
            .await
            .expect("lease semaphore is never closed while the conn is in the pool");
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        permit
    }

    pub async fn write_json(&self, value: &serde_json::Value) -> Result<(), PoolError> {
        let text = serde_json::to_string(value)?;
        {
            let mut sink = self.write_half.lock().await;
            sink.send(Message::Text(text.into()))
                .await
                .map_err(|e| PoolError::WriteUpstream(e.to_string()))?;
        }
        self.touch().await;
        Ok(())
    }

    pub async fn read_message(&self) -> Result<Option<Message>, PoolError> {
        let msg = {
            let mut stream = self.read_half.lock().await;
            stream.next().await
        };
        match msg {
            Some(Ok(msg)) => {
                self.touch().await;
                Ok(Some(msg))
            }
            Some(Err(e)) => Err(PoolError::ReadUpstream(e.to_string())),
            None => Ok(None),
        }
    }

    /// Synchronous health-check ping. Only safe to call on a conn nobody
    /// else is reading from (`waiters() == 0` and not currently leased).
    pub async fn ping(&self, budget: Duration) -> Result<(), PoolError> {
        {
            let mut sink = self.write_half.lock().await;
            sink.send(Message::Ping(Bytes::new()))
                .await
                .map_err(|e| PoolError::WriteUpstream(e.to_string()))?;
        }
        let deadline = tokio::time::Instant::now() + budget;
        let mut stream = self.read_half.lock().await;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::PingTimeout);
            }
            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(Message::Pong(_)))) => return Ok(()),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(PoolError::ReadUpstream(e.to_string())),
                Ok(None) => return Err(PoolError::ConnClosed),
                Err(_) => return Err(PoolError::PingTimeout),
            }
        }
    }

    pub async fn close(&self) {
        self.mark_closed();
        let mut sink = self.write_half.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}
