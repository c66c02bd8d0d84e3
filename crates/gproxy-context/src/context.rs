//! The C2 Ingress Context Pool (spec.md §4.2): session-affinity layer on
//! top of the Upstream Conn Pool (C1). A context is a session's reservation
//! of exactly one physical upstream conn for the session's lifetime —
//! unlike C1's pooled, reusable conns, a context's conn is dedicated and
//! closed (not returned to a shared pool) on release.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use gproxy_account::{AccountId, AccountSnapshot, Headers};
use gproxy_pool::dial::{Dialer, TungsteniteDialer};
use gproxy_pool::{AcquireRequest, ConnId, ConnPool, ConnPoolConfig, Lease, PoolError};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::errors::ContextError;
use crate::stickiness::{MigrationScoreInputs, Stickiness, StickinessInputs, compute_stickiness, migration_score};

pub type SessionKey = String;
pub type CtxId = Uuid;

pub fn session_key(group_id: &str, session_hash: &str, owner_id: &str) -> SessionKey {
    if session_hash.is_empty() {
        format!("conn:{owner_id}")
    } else {
        format!("{group_id}:{session_hash}")
    }
}

#[derive(Debug, Clone)]
pub struct AcquireContextRequest {
    pub account: AccountSnapshot,
    pub group_id: String,
    pub session_hash: String,
    pub owner_id: String,
    pub ws_url: String,
    pub headers: Headers,
    pub proxy: Option<String>,
    pub turn_index: u32,
    pub has_previous_response_id: bool,
    pub strict_affinity: bool,
    pub store_disabled: bool,
    /// A conn this session was bound to before (state store's
    /// session→conn hint); threaded through to C1 as `preferred_conn_id`
    /// so a context that re-dials after a migration or restart prefers
    /// its old physical conn over a fresh one.
    pub preferred_conn_id: Option<ConnId>,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextPoolConfig {
    pub idle_ttl: Duration,
}

impl Default for ContextPoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(600),
        }
    }
}

struct ContextState {
    owner_id: Mutex<Option<String>>,
    /// The C1 lease this context currently holds. A `Lease` owns a
    /// non-cloneable `OwnedSemaphorePermit`, so only one context ever
    /// holds it at a time; a plain `Mutex<Option<Lease>>` models that.
    conn: Mutex<Option<Lease>>,
    /// Cached `conn_id` of the held lease, kept outside the async mutex
    /// above so [`ContextLease::conn_id`] can stay a synchronous call —
    /// the forwarder reads it from a non-async context.
    conn_id: StdMutex<Option<ConnId>>,
    dialing: Mutex<bool>,
    dial_done: Notify,
    last_used_at: Mutex<Instant>,
    expires_at: Mutex<Option<Instant>>,
    broken: AtomicBool,
    failure_streak: AtomicU32,
    failure_at: Mutex<Option<Instant>>,
    last_migration_at: Mutex<Option<Instant>>,
    migration_count: AtomicU32,
}

impl ContextState {
    fn new() -> Self {
        Self {
            owner_id: Mutex::new(None),
            conn: Mutex::new(None),
            conn_id: StdMutex::new(None),
            dialing: Mutex::new(false),
            dial_done: Notify::new(),
            last_used_at: Mutex::new(Instant::now()),
            expires_at: Mutex::new(None),
            broken: AtomicBool::new(false),
            failure_streak: AtomicU32::new(0),
            failure_at: Mutex::new(None),
            last_migration_at: Mutex::new(None),
            migration_count: AtomicU32::new(0),
        }
    }
}

pub struct IngressContextEntry {
    pub ctx_id: CtxId,
    pub account_id: AccountId,
    pub session_key: SessionKey,
    state: ContextState,
}

impl IngressContextEntry {
    fn new(account_id: AccountId, session_key: SessionKey) -> Arc<Self> {
        Arc::new(Self {
            ctx_id: Uuid::now_v7(),
            account_id,
            session_key,
            state: ContextState::new(),
        })
    }

    pub async fn is_idle(&self) -> bool {
        self.state.owner_id.lock().await.is_none()
    }

    pub fn is_broken(&self) -> bool {
        self.state.broken.load(Ordering::Acquire)
    }

    pub async fn had_recent_failure(&self, within: Duration) -> bool {
        self.state
            .failure_at
            .lock()
            .await
            .is_some_and(|at| at.elapsed() < within)
    }

    pub async fn used_within(&self, within: Duration) -> bool {
        self.state.last_used_at.lock().await.elapsed() < within
    }

    pub async fn idle_for(&self) -> Duration {
        self.state.last_used_at.lock().await.elapsed()
    }

    pub fn failure_streak(&self) -> u32 {
        self.state.failure_streak.load(Ordering::Acquire)
    }

    pub fn migration_count(&self) -> u32 {
        self.state.migration_count.load(Ordering::Acquire)
    }

    async fn migrated_within_last_minute(&self) -> bool {
        self.state
            .last_migration_at
            .lock()
            .await
            .is_some_and(|at| at.elapsed() < Duration::from_secs(60))
    }

    async fn mark_broken(&self) {
        if let Some(lease) = self.state.conn.lock().await.take() {
            lease.mark_broken().await;
        }
        *self.state.conn_id.lock().unwrap() = None;
        self.state.broken.store(true, Ordering::Release);
        self.state.failure_streak.fetch_add(1, Ordering::AcqRel);
        *self.state.failure_at.lock().await = Some(Instant::now());
    }

    async fn take_for_migration(&self) {
        self.mark_broken().await;
        self.state.migration_count.fetch_add(1, Ordering::AcqRel);
        *self.state.last_migration_at.lock().await = Some(Instant::now());
        *self.state.owner_id.lock().await = None;
    }

    /// Releases ownership after a failed dial so the entry goes back to
    /// idle instead of being permanently wedged: `ensure_dialed`'s error
    /// branch already marks the entry broken, but never ran `release()`
    /// (no lease was ever created), so without this `owner_id` would stay
    /// set forever and the entry would never be eligible for idle eviction
    /// or migration.
    async fn release_after_dial_failure(&self, idle_ttl: Duration) {
        *self.state.owner_id.lock().await = None;
        *self.state.expires_at.lock().await = Some(Instant::now() + idle_ttl);
    }
}

/// A session's hold on its [`IngressContextEntry`], whose conn is a C1
/// [`Lease`] the context keeps for the session's whole lifetime instead of
/// returning it to C1's shared pool after one turn. Releasing marks the
/// underlying conn broken and drops the lease (freeing C1's per-account
/// slot); the entry itself survives until the idle sweep evicts it or
/// another session migrates it.
pub struct ContextLease {
    entry: Arc<IngressContextEntry>,
}

impl ContextLease {
    pub fn ctx_id(&self) -> CtxId {
        self.entry.ctx_id
    }

    pub fn conn_id(&self) -> ConnId {
        self.entry
            .state
            .conn_id
            .lock()
            .unwrap()
            .expect("a context lease is only handed out once ensure_dialed has stored a conn")
    }

    pub async fn write_json(&self, value: &serde_json::Value) -> Result<(), PoolError> {
        let guard = self.entry.state.conn.lock().await;
        guard.as_ref().expect("dialed").write_json(value).await
    }

    pub async fn read_message(&self) -> Result<Option<Message>, PoolError> {
        let guard = self.entry.state.conn.lock().await;
        guard.as_ref().expect("dialed").read_message().await
    }

    pub async fn ping(&self, budget: Duration) -> Result<(), PoolError> {
        let guard = self.entry.state.conn.lock().await;
        guard.as_ref().expect("dialed").ping(budget).await
    }

    /// Closes the upstream, marks the context broken, bumps the failure
    /// streak. The next acquire for this session re-dials.
    pub async fn mark_broken(self) {
        self.entry.mark_broken().await;
        *self.entry.state.owner_id.lock().await = None;
    }

    /// Releases the held C1 lease (one session = one physical conn for its
    /// lifetime, never returned to the shared pool for reuse by another
    /// session), clears ownership, and sets the idle expiry.
    pub async fn release(self, idle_ttl: Duration) {
        if let Some(lease) = self.entry.state.conn.lock().await.take() {
            lease.mark_broken().await;
        }
        *self.entry.state.conn_id.lock().unwrap() = None;
        *self.entry.state.owner_id.lock().await = None;
        *self.entry.state.last_used_at.lock().await = Instant::now();
        *self.entry.state.expires_at.lock().await = Some(Instant::now() + idle_ttl);
    }
}

/// Session-affinity layer on top of C1: every dial a context needs goes
/// through the shared [`ConnPool`] so C1's per-account capacity cap, idle
/// health checks, and prewarming stay load-bearing even though a context
/// holds its lease for the session's lifetime instead of one turn.
pub struct ContextPool<D: Dialer = TungsteniteDialer> {
    contexts: DashMap<SessionKey, Arc<IngressContextEntry>>,
    by_account: DashMap<AccountId, HashSet<SessionKey>>,
    config: ContextPoolConfig,
    conn_pool: Arc<ConnPool<D>>,
}

impl ContextPool<TungsteniteDialer> {
    pub fn new(config: ContextPoolConfig) -> Self {
        Self::with_conn_pool(config, Arc::new(ConnPool::new(ConnPoolConfig::default())))
    }
}

impl<D: Dialer> ContextPool<D> {
    pub fn with_conn_pool(config: ContextPoolConfig, conn_pool: Arc<ConnPool<D>>) -> Self {
        Self {
            contexts: DashMap::new(),
            by_account: DashMap::new(),
            config,
            conn_pool,
        }
    }

    pub fn with_dialer(config: ContextPoolConfig, dialer: D) -> Self {
        Self::with_conn_pool(config, Arc::new(ConnPool::with_dialer(ConnPoolConfig::default(), dialer)))
    }

    fn account_context_count(&self, account_id: AccountId) -> usize {
        self.by_account.get(&account_id).map(|s| s.len()).unwrap_or(0)
    }

    pub async fn acquire(&self, req: AcquireContextRequest) -> Result<ContextLease, ContextError> {
        let key = session_key(&req.group_id, &req.session_hash, &req.owner_id);

        // L0 exact: an existing context for this session, unowned or
        // already owned by this same ingress conn.
        if let Some(entry_ref) = self.contexts.get(&key) {
            let entry = entry_ref.value().clone();
            drop(entry_ref);
            let mut owner = entry.state.owner_id.lock().await;
            if owner.is_none() || owner.as_deref() == Some(req.owner_id.as_str()) {
                *owner = Some(req.owner_id.clone());
                drop(owner);
                if let Err(e) = self.ensure_dialed(&entry, &req).await {
                    entry.release_after_dial_failure(self.config.idle_ttl).await;
                    return Err(e);
                }
                *entry.state.last_used_at.lock().await = Instant::now();
                return Ok(ContextLease { entry });
            }
            return Err(ContextError::ContextBusy);
        }

        // L1 new: spare account capacity.
        let cap = req.account.concurrency;
        if cap <= 0 || self.account_context_count(req.account.id) < cap as usize {
            let fresh = IngressContextEntry::new(req.account.id, key.clone());
            // Entry's internal shard lock is sync and must not be held
            // across an await, so resolve the race to a plain Arc first.
            let (entry, is_fresh) = match self.contexts.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(fresh.clone());
                    (fresh, true)
                }
                dashmap::mapref::entry::Entry::Occupied(existing) => (existing.get().clone(), false),
            };

            if is_fresh {
                self.by_account.entry(req.account.id).or_insert_with(HashSet::new).insert(key.clone());
                *entry.state.owner_id.lock().await = Some(req.owner_id.clone());
                if let Err(e) = self.ensure_dialed(&entry, &req).await {
                    entry.release_after_dial_failure(self.config.idle_ttl).await;
                    return Err(e);
                }
                return Ok(ContextLease { entry });
            }

            // Lost the race; another acquirer created it first.
            let mut owner = entry.state.owner_id.lock().await;
            if owner.is_none() {
                *owner = Some(req.owner_id.clone());
                drop(owner);
                if let Err(e) = self.ensure_dialed(&entry, &req).await {
                    entry.release_after_dial_failure(self.config.idle_ttl).await;
                    return Err(e);
                }
                return Ok(ContextLease { entry });
            }
            return Err(ContextError::ContextBusy);
        }

        // L2 migration: only if stickiness tier permits.
        let tier = compute_stickiness(StickinessInputs {
            strict_affinity: req.strict_affinity,
            has_previous_response_id: req.has_previous_response_id,
            store_disabled: req.store_disabled,
            turn_index: req.turn_index,
            ..Default::default()
        });
        let Some(threshold) = tier.migration_threshold() else {
            return Err(ContextError::QueueFull);
        };

        if let Some(victim_key) = self.find_migration_candidate(req.account.id, threshold).await {
            if let Some((_, victim)) = self.contexts.remove(&victim_key) {
                victim.take_for_migration().await;
                if let Some(mut set) = self.by_account.get_mut(&req.account.id) {
                    set.remove(&victim_key);
                }
                tracing::debug!(
                    account_id = req.account.id,
                    victim = %victim_key,
                    new_session = %key,
                    "migrating ingress context to a new session"
                );
                let entry = IngressContextEntry::new(req.account.id, key.clone());
                entry.state.migration_count.store(victim.migration_count() + 1, Ordering::Release);
                self.contexts.insert(key.clone(), entry.clone());
                self.by_account.entry(req.account.id).or_insert_with(HashSet::new).insert(key.clone());
                *entry.state.owner_id.lock().await = Some(req.owner_id.clone());
                if let Err(e) = self.ensure_dialed(&entry, &req).await {
                    entry.release_after_dial_failure(self.config.idle_ttl).await;
                    return Err(e);
                }
                return Ok(ContextLease { entry });
            }
        }

        Err(ContextError::QueueFull)
    }

    async fn find_migration_candidate(&self, account_id: AccountId, threshold: i32) -> Option<SessionKey> {
        let keys: Vec<SessionKey> = self
            .by_account
            .get(&account_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut best: Option<(SessionKey, i32, Instant)> = None;
        for key in keys {
            let Some(entry) = self.contexts.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            if !entry.is_idle().await {
                continue;
            }
            let score = migration_score(MigrationScoreInputs {
                broken: entry.is_broken(),
                failure_streak: entry.failure_streak(),
                recent_failure: entry.had_recent_failure(Duration::from_secs(120)).await,
                migrated_within_last_minute: entry.migrated_within_last_minute().await,
                migration_count: entry.migration_count(),
                idle: entry.idle_for().await,
            });
            if score < threshold {
                continue;
            }
            let last_used = *entry.state.last_used_at.lock().await;
            match &best {
                Some((_, best_score, best_used)) if *best_score > score || (*best_score == score && *best_used < last_used) => {}
                _ => best = Some((key, score, last_used)),
            }
        }
        best.map(|(key, _, _)| key)
    }

    /// Acquires a C1 lease on demand if the context has no live conn yet.
    /// Concurrent acquirers for the same context wait on `dial_done` rather
    /// than racing C1 to lease twice for one session.
    async fn ensure_dialed(&self, entry: &Arc<IngressContextEntry>, req: &AcquireContextRequest) -> Result<(), ContextError> {
        loop {
            if entry.state.conn.lock().await.is_some() {
                return Ok(());
            }

            let mut dialing = entry.state.dialing.lock().await;
            if *dialing {
                drop(dialing);
                entry.state.dial_done.notified().await;
                continue;
            }
            *dialing = true;
            drop(dialing);

            let leased = self
                .conn_pool
                .acquire(
                    &req.account,
                    AcquireRequest {
                        ws_url: req.ws_url.clone(),
                        headers: req.headers.clone(),
                        proxy: req.proxy.clone(),
                        preferred_conn_id: req.preferred_conn_id,
                        force_new_conn: false,
                        force_preferred_conn: false,
                    },
                )
                .await;

            let result = match leased {
                Ok(lease) => {
                    *entry.state.conn_id.lock().unwrap() = Some(lease.conn_id());
                    *entry.state.conn.lock().await = Some(lease);
                    Ok(())
                }
                Err(e) => {
                    entry.state.broken.store(true, Ordering::Release);
                    entry.state.failure_streak.fetch_add(1, Ordering::AcqRel);
                    *entry.state.failure_at.lock().await = Some(Instant::now());
                    Err(ContextError::Pool(e))
                }
            };

            *entry.state.dialing.lock().await = false;
            entry.state.dial_done.notify_waiters();
            return result;
        }
    }

    /// Evicts idle contexts whose `expires_at` has passed. Run every 30s.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        for item in self.contexts.iter() {
            let (key, entry) = (item.key().clone(), item.value().clone());
            if let Ok(expires_at) = entry.state.expires_at.try_lock() {
                if expires_at.is_some_and(|at| at <= now) {
                    dead.push((key, entry.account_id));
                }
            }
        }
        for (key, account_id) in dead {
            self.contexts.remove(&key);
            if let Some(mut set) = self.by_account.get_mut(&account_id) {
                set.remove(&key);
            }
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn idle_ttl(&self) -> Duration {
        self.config.idle_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_account::{AccountStatus, AuthType, Credential};
    use gproxy_pool::dial::WsStream;
    use gproxy_pool::DialError;
    use std::future::Future;
    use std::pin::Pin;

    #[derive(Clone, Default)]
    struct RejectAllDialer;

    impl Dialer for RejectAllDialer {
        fn dial<'a>(
            &'a self,
            _url: &'a str,
            _headers: &'a Headers,
            _proxy: Option<&'a str>,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<(WsStream, Headers), DialError>> + Send + 'a>> {
            Box::pin(async move {
                Err(DialError {
                    status: None,
                    headers: Vec::new(),
                    cause: "refused".to_string(),
                })
            })
        }
    }

    fn sample_account() -> AccountSnapshot {
        AccountSnapshot {
            id: 1,
            platform: "openai".into(),
            auth_type: AuthType::ApiKey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency: 2,
            credential: Credential::ApiKey { api_key: "sk-test".into() },
            base_url: "wss://example.test".into(),
            model_mapping: Default::default(),
            extra_flags: Default::default(),
        }
    }

    fn sample_req(owner: &str, session_hash: &str) -> AcquireContextRequest {
        AcquireContextRequest {
            account: sample_account(),
            group_id: "g1".into(),
            session_hash: session_hash.into(),
            owner_id: owner.into(),
            ws_url: "wss://example.test".into(),
            headers: Vec::new(),
            proxy: None,
            turn_index: 1,
            has_previous_response_id: false,
            strict_affinity: false,
            store_disabled: false,
            preferred_conn_id: None,
        }
    }

    #[test]
    fn empty_session_hash_degrades_to_conn_scoped_key() {
        assert_eq!(session_key("g1", "", "conn-7"), "conn:conn-7");
        assert_eq!(session_key("g1", "hash-1", "conn-7"), "g1:hash-1");
    }

    #[tokio::test]
    async fn dial_failure_surfaces_but_still_registers_the_context() {
        let pool = ContextPool::with_dialer(ContextPoolConfig::default(), RejectAllDialer);
        let err = pool.acquire(sample_req("owner-a", "sess-1")).await.unwrap_err();
        assert!(matches!(err, ContextError::Pool(PoolError::Dial(_))));
        assert_eq!(pool.context_count(), 1);
    }

    #[tokio::test]
    async fn dial_failure_clears_ownership_so_a_retry_is_not_permanently_busy() {
        let pool = ContextPool::with_dialer(ContextPoolConfig::default(), RejectAllDialer);
        // owner-a's dial fails; the context stays registered but becomes
        // idle again (owner cleared), so a fresh reconnect under a new
        // owner_id for the same session key is free to take it over
        // instead of hitting ContextBusy forever.
        let _ = pool.acquire(sample_req("owner-a", "sess-1")).await;
        let err = pool.acquire(sample_req("owner-b", "sess-1")).await.unwrap_err();
        assert!(matches!(err, ContextError::Pool(PoolError::Dial(_))));
    }
}
