use std::time::Duration;

use async_trait::async_trait;

/// Coordinates the token-refresh scheduler across gateway instances: one
/// bucket per `(group_id, platform, mode)`, held for the duration of one
/// refresh tick.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another
    /// holder already has it. Callers fail open on `Err` — refreshing twice
    /// is cheaper than a stale token.
    async fn try_lock_bucket(&self, bucket: &str, ttl: Duration) -> anyhow::Result<bool>;
}

/// Single-process stand-in for a real distributed lock service (spec §6
/// treats the lock as an external collaborator). Used by
/// `apps/gproxy-gateway`'s default single-instance wiring and by the refresh
/// scheduler's own tests.
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    pub struct InMemoryLock {
        held: Mutex<HashMap<String, Instant>>,
    }

    impl InMemoryLock {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DistributedLock for InMemoryLock {
        async fn try_lock_bucket(&self, bucket: &str, ttl: Duration) -> anyhow::Result<bool> {
            let mut held = self.held.lock().expect("lock table poisoned");
            let now = Instant::now();
            if let Some(expires_at) = held.get(bucket) {
                if *expires_at > now {
                    return Ok(false);
                }
            }
            held.insert(bucket.to_string(), now + ttl);
            Ok(true)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn second_holder_is_rejected_until_ttl_expires() {
            let lock = InMemoryLock::new();
            assert!(lock.try_lock_bucket("oauth:anthropic:refresh", Duration::from_millis(20)).await.unwrap());
            assert!(!lock.try_lock_bucket("oauth:anthropic:refresh", Duration::from_secs(5)).await.unwrap());
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(lock.try_lock_bucket("oauth:anthropic:refresh", Duration::from_secs(5)).await.unwrap());
        }
    }
}
