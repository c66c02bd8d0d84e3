//! The C6 Token-Refresh Scheduler: a periodic tick that refreshes OAuth
//! credentials across accounts under a bounded worker pool, coordinated by a
//! per-bucket distributed lock (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use gproxy_account::{AccountId, AccountSnapshot};
use gproxy_common::TokenRefreshConfig;
use gproxy_storage::{AccountRepo, DistributedCache, DistributedLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::refresher::{ErrorClass, RefreshError, Refresher, classify_refresh_error};

/// Fixed regardless of account count (spec.md §4.6's "concurrency ceiling").
const WORKER_POOL_SIZE: usize = 10;

/// Platforms whose refresh-retry exhaustion must not escalate the account
/// to error state (spec.md §4.6 step 5, the Antigravity exception).
fn escalates_retry_exhaustion(platform: &str) -> bool {
    !platform.eq_ignore_ascii_case("antigravity")
}

fn bucket_key(account: &AccountSnapshot) -> String {
    format!("{}:{:?}:refresh", account.platform, account.auth_type)
}

pub struct RefreshScheduler {
    refresher: Arc<dyn Refresher>,
    repo: Arc<dyn AccountRepo>,
    lock: Arc<dyn DistributedLock>,
    cache: Arc<dyn DistributedCache>,
    config: TokenRefreshConfig,
    cancel: CancellationToken,
}

impl RefreshScheduler {
    pub fn new(
        refresher: Arc<dyn Refresher>,
        repo: Arc<dyn AccountRepo>,
        lock: Arc<dyn DistributedLock>,
        cache: Arc<dyn DistributedCache>,
        config: TokenRefreshConfig,
    ) -> Self {
        Self {
            refresher,
            repo,
            lock,
            cache,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cloning the returned token and calling `.cancel()` on it is
    /// `Service.Stop()`: the run loop and any in-flight backoff sleeps
    /// observe it promptly.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) {
        let period = Duration::from_secs(self.config.check_interval_minutes.max(1) * 60);
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!(error = %err, "token-refresh tick failed");
                    }
                }
            }
        }
    }

    /// Runs exactly one scheduling pass; exposed standalone so tests and
    /// callers that prefer their own scheduling loop don't need `run`.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let accounts = self.repo.list_active().await?;
        let window = Duration::from_secs(self.config.refresh_before_expiry_hours * 3600);
        let candidates: Vec<AccountSnapshot> = accounts
            .into_iter()
            .filter(|account| self.refresher.can_refresh(account) && self.refresher.needs_refresh(account, window))
            .collect();

        let semaphore = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
        let lock_ttl = Duration::from_secs(self.config.check_interval_minutes.max(1) * 60);
        let mut handles = Vec::with_capacity(candidates.len());

        for account in candidates {
            let bucket = bucket_key(&account);
            match self.lock.try_lock_bucket(&bucket, lock_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(account_id = account.id, bucket = %bucket, "refresh bucket held by a peer instance; skipping");
                    continue;
                }
                Err(err) => {
                    // Fail open: availability over correctness for token freshness.
                    tracing::warn!(account_id = account.id, bucket = %bucket, error = %err, "distributed lock unavailable; refreshing anyway");
                }
            }

            let semaphore = semaphore.clone();
            let refresher = self.refresher.clone();
            let repo = self.repo.clone();
            let cache = self.cache.clone();
            let config = self.config.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("refresh worker semaphore is never closed");
                refresh_one(refresher.as_ref(), repo.as_ref(), cache.as_ref(), account, &config, &cancel).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn refresh_one(
    refresher: &dyn Refresher,
    repo: &dyn AccountRepo,
    cache: &dyn DistributedCache,
    account: AccountSnapshot,
    config: &TokenRefreshConfig,
    cancel: &CancellationToken,
) {
    let account_id: AccountId = account.id;
    let mut attempt: u32 = 0;
    loop {
        match refresher.refresh(&account).await {
            Ok(updated) => {
                if let Err(err) = repo.update(&updated).await {
                    tracing::warn!(account_id, error = %err, "refreshed credentials failed to persist");
                    return;
                }
                if let Err(err) = cache.invalidate_account(account_id).await {
                    tracing::warn!(account_id, error = %err, "failed to invalidate cached account state after refresh");
                }
                return;
            }
            Err(err) => match classify_refresh_error(&err.message) {
                ErrorClass::NonRetryable => {
                    tracing::warn!(account_id, error = %err, "non-retryable grant error; disabling account");
                    let _ = repo.set_error(account_id, &err.message).await;
                    return;
                }
                ErrorClass::Retryable => {
                    attempt += 1;
                    if attempt >= config.max_retries {
                        tracing::warn!(account_id, error = %err, attempts = attempt, "refresh retries exhausted");
                        if escalates_retry_exhaustion(&account.platform) {
                            let _ = repo.set_error(account_id, &err.message).await;
                        }
                        return;
                    }
                    let backoff = Duration::from_secs(config.retry_backoff_seconds.saturating_mul(attempt as u64));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            },
        }
    }
}
