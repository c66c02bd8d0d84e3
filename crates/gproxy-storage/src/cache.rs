use std::time::Duration;

use async_trait::async_trait;

/// Session bindings, pending response routing, and post-refresh account
/// invalidation all go through the same distributed cache. The gateway core
/// never talks to a concrete backend (Redis, memcached, ...); it only ever
/// calls this trait.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Drops every cache entry keyed off this account's credentials
    /// (spec.md §6's `SetAccount` hook) so a stale access token never
    /// survives a successful refresh. Keyed by account id rather than a
    /// single cache key since an account can back more than one cached
    /// binding (response→account, session→conn, ...).
    async fn invalidate_account(&self, account_id: i64) -> anyhow::Result<()> {
        self.delete(&account_cache_key(account_id)).await
    }
}

pub fn account_cache_key(account_id: i64) -> String {
    format!("account:{account_id}")
}

/// A single-process stand-in for a real distributed cache (Redis and
/// friends). No backend ships in this crate — spec §6 treats the
/// distributed cache as an external collaborator the core only ever calls
/// through the trait above — so this is what `apps/gproxy-gateway` wires up
/// by default for a single-instance deployment, and what the rest of the
/// workspace's integration tests run against. Expiry is checked lazily on
/// `get`, same as a real backend is expected to behave.
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    struct Entry {
        value: Vec<u8>,
        expires_at: Option<Instant>,
    }

    #[derive(Default)]
    pub struct InMemoryCache {
        entries: Mutex<HashMap<String, Entry>>,
    }

    impl InMemoryCache {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DistributedCache for InMemoryCache {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            if let Some(entry) = entries.get(key) {
                if entry.expires_at.is_none_or(|at| at > Instant::now()) {
                    return Ok(Some(entry.value.clone()));
                }
                entries.remove(key);
            }
            Ok(None)
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.entries.lock().expect("cache lock poisoned").remove(key);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn set_then_get_round_trips() {
            let cache = InMemoryCache::new();
            cache
                .set("session:abc", b"binding".to_vec(), Duration::from_secs(30))
                .await
                .unwrap();
            assert_eq!(
                cache.get("session:abc").await.unwrap(),
                Some(b"binding".to_vec())
            );
        }

        #[tokio::test]
        async fn expired_entry_reads_as_absent() {
            let cache = InMemoryCache::new();
            cache
                .set("k", b"v".to_vec(), Duration::from_millis(1))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(cache.get("k").await.unwrap(), None);
        }

        #[tokio::test]
        async fn delete_removes_entry() {
            let cache = InMemoryCache::new();
            cache.set("k", b"v".to_vec(), Duration::from_secs(5)).await.unwrap();
            cache.delete("k").await.unwrap();
            assert_eq!(cache.get("k").await.unwrap(), None);
        }
    }
}
