//! Per-account fallback cooldown map (C5). Keyed by `AccountId` rather than
//! the teacher's `(credential_id, scope)` pair, since the gateway falls an
//! entire account out of rotation rather than disallowing it per-model.
//!
//! Entries expire lazily: a reader checks `until` against the current time
//! and treats an expired entry as absent rather than relying on a sweeper to
//! delete it promptly. A background sweep still runs so the map doesn't grow
//! without bound, but correctness never depends on its timing.

use std::time::SystemTime;

use dashmap::DashMap;

use crate::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownLevel {
    /// Transient upstream failure (429, 5xx, dial timeout). Short, bounded backoff.
    Transient,
    /// Credential rejected outright (401/403, revoked grant). Held until an
    /// operator re-enables the account or a refresh clears it.
    Dead,
}

#[derive(Debug, Clone)]
struct CooldownEntry {
    level: CooldownLevel,
    until: Option<SystemTime>,
    reason: String,
    updated_at: SystemTime,
}

impl CooldownEntry {
    fn is_active(&self, now: SystemTime) -> bool {
        match self.until {
            Some(until) => until > now,
            None => true,
        }
    }
}

/// Process-wide, lock-free fallback cooldown map shared by the pool, the
/// context scheduler and the refresh scheduler.
#[derive(Debug, Default)]
pub struct FallbackCooldownMap {
    entries: DashMap<AccountId, CooldownEntry>,
}

impl FallbackCooldownMap {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Marks `account_id` unavailable until `until` (or indefinitely if
    /// `None`, for `Dead`-level entries cleared only by an explicit [`clear`]).
    pub fn mark(
        &self,
        account_id: AccountId,
        level: CooldownLevel,
        until: Option<SystemTime>,
        reason: impl Into<String>,
    ) {
        self.entries.insert(
            account_id,
            CooldownEntry {
                level,
                until,
                reason: reason.into(),
                updated_at: SystemTime::now(),
            },
        );
    }

    /// True if `account_id` is currently in cooldown. Lazily drops an expired
    /// entry on the way out so a live account never pays for a stale one.
    pub fn is_in_cooldown(&self, account_id: AccountId) -> bool {
        let now = SystemTime::now();
        match self.entries.get(&account_id) {
            Some(entry) if entry.is_active(now) => true,
            Some(_) => {
                self.entries.remove(&account_id);
                false
            }
            None => false,
        }
    }

    pub fn level(&self, account_id: AccountId) -> Option<CooldownLevel> {
        let now = SystemTime::now();
        self.entries.get(&account_id).and_then(|entry| {
            if entry.is_active(now) {
                Some(entry.level)
            } else {
                None
            }
        })
    }

    pub fn reason(&self, account_id: AccountId) -> Option<String> {
        self.entries.get(&account_id).map(|e| e.reason.clone())
    }

    pub fn clear(&self, account_id: AccountId) {
        self.entries.remove(&account_id);
    }

    /// Drops every entry that has expired as of `now`. Run periodically by a
    /// background sweeper; never required for correctness, only for bounding
    /// map size.
    pub fn sweep_expired(&self, now: SystemTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_active(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn active_entry_blocks_and_expired_entry_clears_itself() {
        let map = FallbackCooldownMap::new();
        let now = SystemTime::now();

        map.mark(
            1,
            CooldownLevel::Transient,
            Some(now + Duration::from_secs(30)),
            "rate_limited",
        );
        assert!(map.is_in_cooldown(1));
        assert_eq!(map.level(1), Some(CooldownLevel::Transient));

        map.mark(
            2,
            CooldownLevel::Transient,
            Some(now - Duration::from_secs(1)),
            "rate_limited",
        );
        assert!(!map.is_in_cooldown(2));
        assert!(map.level(2).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn dead_level_without_until_stays_active_until_cleared() {
        let map = FallbackCooldownMap::new();
        map.mark(7, CooldownLevel::Dead, None, "revoked");
        assert!(map.is_in_cooldown(7));
        map.clear(7);
        assert!(!map.is_in_cooldown(7));
    }

    #[test]
    fn sweep_expired_drops_only_expired_entries() {
        let map = FallbackCooldownMap::new();
        let now = SystemTime::now();
        map.mark(1, CooldownLevel::Transient, Some(now - Duration::from_secs(1)), "x");
        map.mark(2, CooldownLevel::Transient, Some(now + Duration::from_secs(60)), "x");
        let dropped = map.sweep_expired(now);
        assert_eq!(dropped, 1);
        assert_eq!(map.len(), 1);
        assert!(map.is_in_cooldown(2));
    }
}
