//! Generic sharded, TTL-bound in-memory map (spec.md §4.3's "hottest map"
//! pattern, generalized from a single response→conn table to every local
//! binding this crate keeps). Sixteen shards, each behind its own RW-lock,
//! so a write on one session never blocks a read on another.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;

const SHARD_COUNT: usize = 16;
/// Cap on how many expired entries a single bind-triggered cleanup pass
/// scans, so inserts stay O(1)-ish under tail latency pressure.
const CLEANUP_SCAN_LIMIT: usize = 64;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Shard<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    last_cleanup: RwLock<Instant>,
}

pub struct ShardedMap<K, V> {
    shards: Vec<Shard<K, V>>,
    cleanup_interval: Duration,
    max_entries_per_shard: usize,
}

fn shard_index<K: Hash>(key: &K) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(cleanup_interval: Duration, max_entries_per_shard: usize) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Shard {
                entries: RwLock::new(HashMap::new()),
                last_cleanup: RwLock::new(Instant::now()),
            });
        }
        Self {
            shards,
            cleanup_interval,
            max_entries_per_shard,
        }
    }

    /// Inserts or refreshes `key`. Triggers a bounded cleanup scan of this
    /// shard if `cleanup_interval` has elapsed since its last one, and
    /// evicts one random victim if the shard is full and `key` is new.
    pub async fn bind(&self, key: K, value: V, ttl: Duration) {
        let shard = &self.shards[shard_index(&key)];
        self.maybe_cleanup(shard).await;

        let mut entries = shard.entries.write().await;
        let is_new = !entries.contains_key(&key);
        if is_new && entries.len() >= self.max_entries_per_shard {
            evict_random(&mut entries);
        }
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Read path. Never triggers cleanup; an expired hit is treated as a
    /// miss but left in place for the next bind-triggered sweep.
    pub async fn get(&self, key: &K) -> Option<V> {
        let shard = &self.shards[shard_index(key)];
        let entries = shard.entries.read().await;
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        let shard = &self.shards[shard_index(key)];
        shard.entries.write().await.remove(key).map(|e| e.value)
    }

    async fn maybe_cleanup(&self, shard: &Shard<K, V>) {
        {
            let last = shard.last_cleanup.read().await;
            if last.elapsed() < self.cleanup_interval {
                return;
            }
        }
        let mut last = shard.last_cleanup.write().await;
        if last.elapsed() < self.cleanup_interval {
            return;
        }
        *last = Instant::now();
        drop(last);

        let now = Instant::now();
        let mut entries = shard.entries.write().await;
        let dead: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .take(CLEANUP_SCAN_LIMIT)
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            entries.remove(&key);
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.entries.read().await.len();
        }
        total
    }
}

fn evict_random<K: Eq + Hash + Clone, V>(entries: &mut HashMap<K, Entry<V>>) {
    if entries.is_empty() {
        return;
    }
    let victim_idx = rand::thread_rng().gen_range(0..entries.len());
    if let Some(victim) = entries.keys().nth(victim_idx).cloned() {
        entries.remove(&victim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_then_get_round_trips() {
        let map: ShardedMap<String, String> = ShardedMap::new(Duration::from_secs(60), 1024);
        map.bind("resp-1".to_string(), "conn-9".to_string(), Duration::from_secs(30)).await;
        assert_eq!(map.get(&"resp-1".to_string()).await, Some("conn-9".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let map: ShardedMap<String, String> = ShardedMap::new(Duration::from_secs(60), 1024);
        map.bind("k".to_string(), "v".to_string(), Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(map.get(&"k".to_string()).await, None);
    }

    #[tokio::test]
    async fn updating_existing_key_never_evicts() {
        let map: ShardedMap<String, u32> = ShardedMap::new(Duration::from_secs(60), 1);
        map.bind("only".to_string(), 1, Duration::from_secs(30)).await;
        map.bind("only".to_string(), 2, Duration::from_secs(30)).await;
        assert_eq!(map.len().await, 1);
        assert_eq!(map.get(&"only".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn per_shard_cap_bounds_total_size_under_heavy_insert() {
        let map: ShardedMap<String, u32> = ShardedMap::new(Duration::from_secs(60), 1);
        for i in 0..200u32 {
            map.bind(format!("key-{i}"), i, Duration::from_secs(30)).await;
        }
        assert!(map.len().await <= SHARD_COUNT);
    }
}
