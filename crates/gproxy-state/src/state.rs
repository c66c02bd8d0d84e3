//! The Distributed Session & Response State Store (spec.md §4.3): local
//! sharded bindings backed by a distributed cache for the cross-instance
//! response→account mapping.

use std::sync::Arc;
use std::time::Duration;

use gproxy_account::AccountId;
use gproxy_storage::DistributedCache;

use crate::sharded::ShardedMap;

/// `openai:response:v2:<16-hex blake3>`, the distributed cache key format.
pub fn response_cache_key(response_id: &str) -> String {
    let hash = blake3::hash(response_id.as_bytes()).to_hex();
    format!("openai:response:v2:{}", &hash[..16])
}

pub fn session_key(group_id: &str, session_hash: &str) -> String {
    format!("{group_id}:{session_hash}")
}

fn pending_tool_call_key(group_id: &str, response_id: &str) -> String {
    format!("{group_id}:{response_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnState {
    pub last_response_id: Option<String>,
    pub pending_tool_call_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct StateStoreConfig {
    pub response_account_ttl: Duration,
    pub response_conn_ttl: Duration,
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
    pub max_entries_per_shard: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            response_account_ttl: Duration::from_secs(3600),
            response_conn_ttl: Duration::from_secs(600),
            session_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(30),
            max_entries_per_shard: 4096,
        }
    }
}

pub struct StateStore {
    config: StateStoreConfig,
    cache: Arc<dyn DistributedCache>,
    response_account_local: ShardedMap<String, AccountId>,
    response_conn: ShardedMap<String, String>,
    session_turn: ShardedMap<String, TurnState>,
    session_conn: ShardedMap<String, String>,
    pending_tool_calls: ShardedMap<String, Vec<String>>,
}

impl StateStore {
    pub fn new(config: StateStoreConfig, cache: Arc<dyn DistributedCache>) -> Self {
        Self {
            response_account_local: ShardedMap::new(config.cleanup_interval, config.max_entries_per_shard),
            response_conn: ShardedMap::new(config.cleanup_interval, config.max_entries_per_shard),
            session_turn: ShardedMap::new(config.cleanup_interval, config.max_entries_per_shard),
            session_conn: ShardedMap::new(config.cleanup_interval, config.max_entries_per_shard),
            pending_tool_calls: ShardedMap::new(config.cleanup_interval, config.max_entries_per_shard),
            config,
            cache,
        }
    }

    /// Persists `response_id -> account_id` both locally and in the
    /// distributed cache, so another instance can pick up the same
    /// stickiness after the response_id round-trips through the client.
    pub async fn bind_response_account(&self, response_id: &str, account_id: AccountId) {
        self.response_account_local
            .bind(response_id.to_string(), account_id, self.config.response_account_ttl)
            .await;
        let key = response_cache_key(response_id);
        if let Err(err) = self
            .cache
            .set(&key, account_id.to_string().into_bytes(), self.config.response_account_ttl)
            .await
        {
            tracing::warn!(response_id, error = %err, "failed to persist response->account binding to distributed cache");
        }
    }

    /// Looks up the account pinned to a `previous_response_id`. A local hit
    /// is never trusted on its own: the distributed cache is the source of
    /// truth, and a miss there discards the local entry as stale (spec.md
    /// §8 — this is what prevents stale stickiness surviving a redeploy).
    pub async fn lookup_response_account(&self, response_id: &str) -> Option<AccountId> {
        let local_hit = self.response_account_local.get(&response_id.to_string()).await;
        let key = response_cache_key(response_id);
        match self.cache.get(&key).await {
            Ok(Some(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                let account_id: AccountId = text.parse().ok()?;
                Some(account_id)
            }
            Ok(None) => {
                if local_hit.is_some() {
                    self.response_account_local.remove(&response_id.to_string()).await;
                }
                None
            }
            Err(err) => {
                tracing::warn!(response_id, error = %err, "distributed cache lookup failed; treating as miss");
                None
            }
        }
    }

    pub async fn bind_response_conn(&self, response_id: &str, conn_id: &str) {
        self.response_conn
            .bind(response_id.to_string(), conn_id.to_string(), self.config.response_conn_ttl)
            .await;
    }

    pub async fn get_response_conn(&self, response_id: &str) -> Option<String> {
        self.response_conn.get(&response_id.to_string()).await
    }

    pub async fn bind_session_turn_state(&self, group_id: &str, session_hash: &str, state: TurnState) {
        self.session_turn
            .bind(session_key(group_id, session_hash), state, self.config.session_ttl)
            .await;
    }

    pub async fn get_session_turn_state(&self, group_id: &str, session_hash: &str) -> Option<TurnState> {
        self.session_turn.get(&session_key(group_id, session_hash)).await
    }

    pub async fn bind_session_conn(&self, group_id: &str, session_hash: &str, conn_id: &str) {
        self.session_conn
            .bind(session_key(group_id, session_hash), conn_id.to_string(), self.config.session_ttl)
            .await;
    }

    pub async fn get_session_conn(&self, group_id: &str, session_hash: &str) -> Option<String> {
        self.session_conn.get(&session_key(group_id, session_hash)).await
    }

    /// Clears `last_response_id` while preserving `pending_tool_call_ids`,
    /// used by the Recovery Engine (C5) disposition table entries that call
    /// for dropping session stickiness without discarding tool-call state.
    pub async fn clear_session_last_response_id(&self, group_id: &str, session_hash: &str) {
        if let Some(mut state) = self.get_session_turn_state(group_id, session_hash).await {
            if state.last_response_id.is_none() {
                return;
            }
            state.last_response_id = None;
            self.bind_session_turn_state(group_id, session_hash, state).await;
        }
    }

    /// Remembers the `function_call` ids a response emitted, until the
    /// client's next `response.create` consumes them.
    pub async fn bind_pending_tool_calls(&self, group_id: &str, response_id: &str, call_ids: Vec<String>) {
        self.pending_tool_calls
            .bind(pending_tool_call_key(group_id, response_id), call_ids, Duration::from_secs(3600))
            .await;
    }

    pub async fn take_pending_tool_calls(&self, group_id: &str, response_id: &str) -> Option<Vec<String>> {
        self.pending_tool_calls
            .remove(&pending_tool_call_key(group_id, response_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCache {
        entries: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl DistributedCache for FakeCache {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> anyhow::Result<()> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn store() -> StateStore {
        StateStore::new(StateStoreConfig::default(), Arc::new(FakeCache::default()))
    }

    #[tokio::test]
    async fn response_account_round_trips_through_distributed_cache() {
        let store = store();
        store.bind_response_account("resp-1", 42).await;
        assert_eq!(store.lookup_response_account("resp-1").await, Some(42));
    }

    #[tokio::test]
    async fn distributed_cache_miss_discards_local_hit_as_stale() {
        let store = store();
        store.bind_response_account("resp-2", 7).await;
        // Simulate the distributed tier losing the key (redeploy, eviction)
        // while the local shard still remembers it.
        let key = response_cache_key("resp-2");
        store.cache.delete(&key).await.unwrap();
        assert_eq!(store.lookup_response_account("resp-2").await, None);
    }

    #[tokio::test]
    async fn pending_tool_calls_are_consumed_exactly_once() {
        let store = store();
        store
            .bind_pending_tool_calls("grp", "resp-3", vec!["call-1".to_string(), "call-2".to_string()])
            .await;
        let first = store.take_pending_tool_calls("grp", "resp-3").await;
        assert_eq!(first, Some(vec!["call-1".to_string(), "call-2".to_string()]));
        assert_eq!(store.take_pending_tool_calls("grp", "resp-3").await, None);
    }

    #[tokio::test]
    async fn session_turn_state_tracks_last_response_and_pending_ids() {
        let store = store();
        let state = TurnState {
            last_response_id: Some("resp-4".to_string()),
            pending_tool_call_ids: vec!["call-9".to_string()],
        };
        store.bind_session_turn_state("grp", "hash-a", state.clone()).await;
        assert_eq!(store.get_session_turn_state("grp", "hash-a").await, Some(state));
    }

    #[tokio::test]
    async fn clearing_last_response_id_preserves_pending_tool_calls() {
        let store = store();
        let state = TurnState {
            last_response_id: Some("resp-5".to_string()),
            pending_tool_call_ids: vec!["call-1".to_string()],
        };
        store.bind_session_turn_state("grp", "hash-b", state).await;
        store.clear_session_last_response_id("grp", "hash-b").await;
        let after = store.get_session_turn_state("grp", "hash-b").await.unwrap();
        assert!(after.last_response_id.is_none());
        assert_eq!(after.pending_tool_call_ids, vec!["call-1".to_string()]);
    }
}
