//! Per-account pool of persistent upstream WS connections (spec.md §4.1).
//! Top-level map is a `DashMap` (lock-free key lookups, grounded on
//! `unicity-astrid-astrid`'s use of `dashmap` for this exact shape); each
//! account's conn list lives behind its own `tokio::sync::RwLock`, mirroring
//! the teacher's `CredentialPool` one-mutex-per-account-entry pattern.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use gproxy_account::{AccountId, AccountSnapshot, AuthType, Headers};

use crate::conn::{ConnId, UpstreamConn};
use crate::dial::{Dialer, TungsteniteDialer};
use crate::errors::PoolError;
use crate::lease::{Lease, LeaseMetrics};

#[derive(Debug, Clone)]
pub struct ConnPoolConfig {
    pub max_conns_per_account: u32,
    pub min_idle_per_account: u32,
    pub max_idle_per_account: u32,
    pub queue_limit_per_conn: u32,
    pub dial_timeout: Duration,
    pub idle_ping_threshold: Duration,
    pub ping_budget: Duration,
    pub max_conn_age: Duration,
    pub mode_router_v2_enabled: bool,
    pub oauth_max_conns_factor: f64,
    pub api_key_max_conns_factor: f64,
    pub pool_target_utilization: f64,
    pub prewarm_cooldown: Duration,
}

impl Default for ConnPoolConfig {
    fn default() -> Self {
        Self {
            max_conns_per_account: 8,
            min_idle_per_account: 1,
            max_idle_per_account: 4,
            queue_limit_per_conn: 64,
            dial_timeout: Duration::from_secs(10),
            idle_ping_threshold: Duration::from_secs(90),
            ping_budget: Duration::from_secs(2),
            max_conn_age: Duration::from_secs(60 * 60),
            mode_router_v2_enabled: true,
            oauth_max_conns_factor: 1.0,
            api_key_max_conns_factor: 1.0,
            pool_target_utilization: 0.75,
            prewarm_cooldown: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquireRequest {
    pub ws_url: String,
    pub headers: Headers,
    pub proxy: Option<String>,
    pub preferred_conn_id: Option<ConnId>,
    pub force_new_conn: bool,
    pub force_preferred_conn: bool,
}

struct PrewarmState {
    active: bool,
    cooldown_until: Instant,
    failure_streak: u32,
    failure_at: Option<Instant>,
}

impl Default for PrewarmState {
    fn default() -> Self {
        Self {
            active: false,
            cooldown_until: Instant::now(),
            failure_streak: 0,
            failure_at: None,
        }
    }
}

#[derive(Default)]
struct AccountEntry {
    conns: RwLock<Vec<Arc<UpstreamConn>>>,
    creating: AtomicUsize,
    last_acquire_hint: Mutex<Option<ConnId>>,
    prewarm: Mutex<PrewarmState>,
}

/// The C1 Upstream Conn Pool. One instance lives for the process lifetime;
/// `Arc<ConnPool<_>>` is shared by the Ingress Context Pool (C2) and the
/// Turn Forwarder (C4).
pub struct ConnPool<D: Dialer = TungsteniteDialer> {
    accounts: DashMap<AccountId, Arc<AccountEntry>>,
    config: ConnPoolConfig,
    dialer: D,
}

impl ConnPool<TungsteniteDialer> {
    pub fn new(config: ConnPoolConfig) -> Self {
        Self::with_dialer(config, TungsteniteDialer)
    }
}

impl<D: Dialer> ConnPool<D> {
    pub fn with_dialer(config: ConnPoolConfig, dialer: D) -> Self {
        Self {
            accounts: DashMap::new(),
            config,
            dialer,
        }
    }

    fn entry(&self, account_id: AccountId) -> Arc<AccountEntry> {
        self.accounts.entry(account_id).or_default().clone()
    }

    /// `effectiveMaxConns` (spec.md §4.1). `concurrency <= 0` means
    /// unlimited in the data model but the acquire path rejects it outright
    /// per the boundary test in spec.md §8 — callers check this first.
    pub fn effective_max_conns(&self, account: &AccountSnapshot) -> u32 {
        if account.concurrency <= 0 {
            return 0;
        }
        if self.config.mode_router_v2_enabled {
            account.concurrency as u32
        } else {
            let factor = match account.auth_type {
                AuthType::OAuth => self.config.oauth_max_conns_factor,
                AuthType::ApiKey => self.config.api_key_max_conns_factor,
            };
            let scaled = (account.concurrency as f64 * factor).round() as u32;
            scaled.min(self.config.max_conns_per_account)
        }
    }

    pub async fn acquire(&self, account: &AccountSnapshot, req: AcquireRequest) -> Result<Lease, PoolError> {
        self.acquire_with_retries(account, req, 1).await
    }

    async fn acquire_with_retries(
        &self,
        account: &AccountSnapshot,
        req: AcquireRequest,
        retries_left: u32,
    ) -> Result<Lease, PoolError> {
        if req.ws_url.trim().is_empty() {
            return Err(PoolError::InvalidRequest("ws_url must not be empty".to_string()));
        }
        let max_conns = self.effective_max_conns(account);
        if max_conns == 0 {
            return Err(PoolError::ConnQueueFull);
        }

        let start = Instant::now();
        let entry = self.entry(account.id);

        let picked = self.pick_conn(&entry, &req, max_conns, account).await?;
        let conn = match picked {
            Picked::Existing(conn) => conn,
            Picked::Dial => self.dial_and_register(&entry, account, &req).await?,
        };

        let pick_duration = start.elapsed();
        let reused = matches!(conn.idle_for().await, idle if idle < self.config.idle_ping_threshold)
            || conn.is_prewarmed();

        if conn.idle_for().await >= self.config.idle_ping_threshold {
            if let Err(_e) = conn.ping(self.config.ping_budget).await {
                conn.close().await;
                self.remove_conn(&entry, conn.conn_id).await;
                if retries_left == 0 {
                    return Err(PoolError::PingTimeout);
                }
                return Box::pin(self.acquire_with_retries(account, req, retries_left - 1)).await;
            }
        }

        *entry.last_acquire_hint.lock().await = Some(conn.conn_id);

        let queue_wait_start = Instant::now();
        let permit = conn.acquire_lease().await;
        let metrics = LeaseMetrics {
            queue_wait: queue_wait_start.elapsed(),
            conn_pick_duration: pick_duration,
            reused,
        };
        Ok(Lease::new(conn, permit, metrics))
    }

    async fn pick_conn(
        &self,
        entry: &Arc<AccountEntry>,
        req: &AcquireRequest,
        max_conns: u32,
        account: &AccountSnapshot,
    ) -> Result<Picked, PoolError> {
        if req.force_new_conn {
            return Ok(Picked::Dial);
        }

        let conns = entry.conns.read().await;

        if req.force_preferred_conn {
            let Some(preferred) = req.preferred_conn_id else {
                return Err(PoolError::PreferredConnUnavailable);
            };
            return conns
                .iter()
                .find(|c| c.conn_id == preferred && !c.is_closed() && c.waiters() == 0)
                .cloned()
                .map(Picked::Existing)
                .ok_or(PoolError::PreferredConnUnavailable);
        }

        if let Some(preferred) = req.preferred_conn_id
            && let Some(conn) = conns.iter().find(|c| c.conn_id == preferred && !c.is_closed())
            && conn.waiters() == 0
        {
            return Ok(Picked::Existing(conn.clone()));
        }

        if let Some(least_busy) = least_busy(&conns).await {
            return Ok(Picked::Existing(least_busy));
        }
        drop(conns);

        let creating = entry.creating.load(Ordering::Acquire) as u32;
        let current = entry.conns.read().await.len() as u32;
        if current + creating < max_conns {
            return Ok(Picked::Dial);
        }

        // At capacity: enqueue on the least-busy conn's lease, bounded by
        // the per-conn queue limit.
        let conns = entry.conns.read().await;
        let target = conns
            .iter()
            .min_by_key(|c| c.waiters())
            .cloned()
            .ok_or(PoolError::ConnQueueFull)?;
        if target.waiters() as u32 >= self.config.queue_limit_per_conn {
            return Err(PoolError::ConnQueueFull);
        }
        let _ = account;
        Ok(Picked::Existing(target))
    }

    async fn dial_and_register(
        &self,
        entry: &Arc<AccountEntry>,
        account: &AccountSnapshot,
        req: &AcquireRequest,
    ) -> Result<Arc<UpstreamConn>, PoolError> {
        entry.creating.fetch_add(1, Ordering::AcqRel);
        let dialed = self
            .dialer
            .dial(&req.ws_url, &req.headers, req.proxy.as_deref(), self.config.dial_timeout)
            .await;
        entry.creating.fetch_sub(1, Ordering::AcqRel);

        let (stream, handshake_headers) = dialed.map_err(|e| {
            let mut prewarm_state = entry.prewarm.try_lock();
            if let Ok(ref mut state) = prewarm_state {
                state.failure_streak += 1;
                state.failure_at = Some(Instant::now());
            }
            PoolError::Dial(e)
        })?;

        let conn = UpstreamConn::new(account.id, handshake_headers, stream);
        entry.conns.write().await.push(conn.clone());
        Ok(conn)
    }

    async fn remove_conn(&self, entry: &Arc<AccountEntry>, conn_id: ConnId) {
        entry.conns.write().await.retain(|c| c.conn_id != conn_id);
    }

    pub fn pin_conn(&self, account_id: AccountId, conn_id: ConnId) {
        if let Some(entry) = self.accounts.get(&account_id)
            && let Ok(conns) = entry.conns.try_read()
            && let Some(conn) = conns.iter().find(|c| c.conn_id == conn_id)
        {
            conn.pin();
        }
    }

    pub fn unpin_conn(&self, account_id: AccountId, conn_id: ConnId) {
        if let Some(entry) = self.accounts.get(&account_id)
            && let Ok(conns) = entry.conns.try_read()
            && let Some(conn) = conns.iter().find(|c| c.conn_id == conn_id)
        {
            conn.unpin();
        }
    }

    pub async fn conn_count(&self, account_id: AccountId) -> usize {
        match self.accounts.get(&account_id) {
            Some(entry) => entry.conns.read().await.len(),
            None => 0,
        }
    }

    /// Best-effort prewarm (spec.md §4.1). Computes the idle target and, if
    /// short, dials the delta in the background, gated by a cooldown and a
    /// failure-streak circuit breaker.
    pub async fn ensure_target_idle(self: &Arc<Self>, account: AccountSnapshot, demand_hint: u32)
    where
        D: Clone + 'static,
    {
        let entry = self.entry(account.id);
        let max_conns = self.effective_max_conns(&account);
        if max_conns == 0 {
            return;
        }
        let utilization = self.config.pool_target_utilization.max(0.01);
        let target = (self.config.min_idle_per_account as f64)
            .max((demand_hint as f64 / utilization).ceil())
            .min(max_conns as f64) as u32;

        let current = entry.conns.read().await.len() as u32;
        if current >= target {
            return;
        }

        let now = Instant::now();
        {
            let mut state = entry.prewarm.lock().await;
            if state.active || now < state.cooldown_until {
                return;
            }
            if state.failure_streak >= 2
                && state.failure_at.is_some_and(|at| now.duration_since(at) < Duration::from_secs(30))
            {
                return;
            }
            state.active = true;
        }

        let delta = target - current;
        let pool = self.clone();
        let dialer = self.dialer.clone();
        let account_for_task = account;
        let req_headers: Headers = Vec::new();
        tokio::spawn(async move {
            for _ in 0..delta {
                let entry = pool.entry(account_for_task.id);
                let dialed = dialer
                    .dial(&account_for_task.base_url, &req_headers, None, pool.config.dial_timeout)
                    .await;
                match dialed {
                    Ok((stream, headers)) => {
                        let conn = UpstreamConn::new(account_for_task.id, headers, stream);
                        conn.mark_prewarmed();
                        entry.conns.write().await.push(conn);
                        let mut state = entry.prewarm.lock().await;
                        state.failure_streak = 0;
                    }
                    Err(_) => {
                        let mut state = entry.prewarm.lock().await;
                        state.failure_streak += 1;
                        state.failure_at = Some(Instant::now());
                        break;
                    }
                }
            }
            let entry = pool.entry(account_for_task.id);
            let mut state = entry.prewarm.lock().await;
            state.active = false;
            state.cooldown_until = Instant::now() + pool.config.prewarm_cooldown;
        });
    }

    /// Pings up to `max_concurrent` idle (waiters==0) conns across every
    /// account; failed ones are evicted. Intended to run every 30s.
    pub async fn sweep_ping(&self, max_concurrent: usize) {
        let candidates: Vec<(AccountId, Arc<UpstreamConn>)> = self
            .accounts
            .iter()
            .flat_map(|entry| {
                let account_id = *entry.key();
                let conns = entry.value().conns.try_read();
                conns
                    .map(|conns| {
                        conns
                            .iter()
                            .filter(|c| c.waiters() == 0 && !c.is_closed())
                            .cloned()
                            .map(move |c| (account_id, c))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            })
            .take(max_concurrent)
            .collect();

        for (account_id, conn) in candidates {
            if conn.idle_for().await < self.config.idle_ping_threshold {
                continue;
            }
            if conn.ping(self.config.ping_budget).await.is_err() {
                conn.close().await;
                if let Some(entry) = self.accounts.get(&account_id) {
                    self.remove_conn(entry.value(), conn.conn_id).await;
                }
            }
        }
    }

    /// Evicts conns older than `max_conn_age` and trims idle surplus beyond
    /// `max_idle_per_account`. A conn that is leased or pinned is exempt.
    pub async fn sweep_cleanup(&self) {
        for entry in self.accounts.iter() {
            let entry = entry.value().clone();
            let mut conns = entry.conns.write().await;

            let mut keep = Vec::with_capacity(conns.len());
            for conn in conns.drain(..) {
                let too_old = conn.created_at.elapsed() >= self.config.max_conn_age;
                if too_old && conn.waiters() == 0 && !conn.is_pinned() {
                    conn.close().await;
                    continue;
                }
                keep.push(conn);
            }

            let idle_surplus = keep
                .iter()
                .filter(|c| c.waiters() == 0 && !c.is_pinned())
                .count()
                .saturating_sub(self.config.max_idle_per_account as usize);
            let mut trimmed = 0usize;
            keep.retain(|conn| {
                if trimmed < idle_surplus && conn.waiters() == 0 && !conn.is_pinned() && !conn.is_closed() {
                    trimmed += 1;
                    let conn = conn.clone();
                    tokio::spawn(async move { conn.close().await });
                    false
                } else {
                    true
                }
            });

            *conns = keep;
        }
    }

    /// Spawns the ping and cleanup sweepers as detached background tasks,
    /// mirroring the teacher's `spawn_recover_task` hand-off-and-forget
    /// pattern. Returns their handles so a caller that wants orderly
    /// shutdown can abort them.
    pub fn spawn_background_workers(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>)
    where
        D: 'static,
    {
        let ping_pool = self.clone();
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                ping_pool.sweep_ping(10).await;
            }
        });

        let cleanup_pool = self.clone();
        let cleanup_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                cleanup_pool.sweep_cleanup().await;
            }
        });

        (ping_task, cleanup_task)
    }
}

enum Picked {
    Existing(Arc<UpstreamConn>),
    Dial,
}

async fn least_busy(conns: &[Arc<UpstreamConn>]) -> Option<Arc<UpstreamConn>> {
    let mut best: Option<(&Arc<UpstreamConn>, usize, Instant)> = None;
    for conn in conns {
        if conn.is_closed() {
            continue;
        }
        if conn.waiters() > 0 {
            continue;
        }
        let last_used = conn.last_used_at().await;
        match &best {
            Some((_, waiters, used)) if *waiters < conn.waiters() || (*waiters == conn.waiters() && *used < last_used) => {}
            _ => best = Some((conn, conn.waiters(), last_used)),
        }
    }
    best.map(|(conn, _, _)| conn.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial::WsStream;
    use crate::errors::DialError;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicU32;

    #[derive(Clone, Default)]
    struct RejectingDialer {
        calls: Arc<AtomicU32>,
    }

    impl Dialer for RejectingDialer {
        fn dial<'a>(
            &'a self,
            _url: &'a str,
            _headers: &'a Headers,
            _proxy: Option<&'a str>,
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<(WsStream, Headers), DialError>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Err(DialError {
                    status: Some(426),
                    headers: Vec::new(),
                    cause: "upgrade required".to_string(),
                })
            })
        }
    }

    fn sample_account(concurrency: i64) -> AccountSnapshot {
        AccountSnapshot {
            id: 1,
            platform: "openai".into(),
            auth_type: AuthType::ApiKey,
            status: gproxy_account::AccountStatus::Active,
            schedulable: true,
            concurrency,
            credential: gproxy_account::Credential::ApiKey {
                api_key: "sk-test".into(),
            },
            base_url: "wss://example.test".into(),
            model_mapping: Default::default(),
            extra_flags: Default::default(),
        }
    }

    #[tokio::test]
    async fn zero_concurrency_rejects_immediately_without_dialing() {
        let dialer = RejectingDialer::default();
        let calls = dialer.calls.clone();
        let pool = ConnPool::with_dialer(ConnPoolConfig::default(), dialer);
        let account = sample_account(0);
        let err = pool.acquire(&account, AcquireRequest {
            ws_url: "wss://example.test".into(),
            ..Default::default()
        }).await.unwrap_err();
        assert!(matches!(err, PoolError::ConnQueueFull));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_ws_url_is_rejected_before_any_dial() {
        let dialer = RejectingDialer::default();
        let calls = dialer.calls.clone();
        let pool = ConnPool::with_dialer(ConnPoolConfig::default(), dialer);
        let account = sample_account(4);
        let err = pool.acquire(&account, AcquireRequest::default()).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dial_failure_surfaces_status_and_headers() {
        let dialer = RejectingDialer::default();
        let pool = ConnPool::with_dialer(ConnPoolConfig::default(), dialer);
        let account = sample_account(4);
        let err = pool.acquire(&account, AcquireRequest {
            ws_url: "wss://example.test".into(),
            ..Default::default()
        }).await.unwrap_err();
        match err {
            PoolError::Dial(dial_err) => assert_eq!(dial_err.status, Some(426)),
            other => panic!("expected dial error, got {other:?}"),
        }
    }
}
