use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use gproxy_account::AccountId;

/// One billable turn. `idempotency_key` is the response id (or, for a
/// recovered turn, the original response id) so a retried write never
/// double-bills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub idempotency_key: String,
    pub account_id: AccountId,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait UsageLogRepo: Send + Sync {
    /// `Ok(true)` means the row was newly inserted; the caller only invokes
    /// billing when this is `true`, so a duplicate write (retry, recovered
    /// turn re-emitting the same terminal usage) is a no-op.
    async fn create(&self, log: UsageLog) -> anyhow::Result<bool>;
}

/// Single-process reference repository. Billing persistence lives outside
/// core (spec §1); `apps/gproxy-gateway` wires this in by default so turns
/// can be driven end to end without a real database, gated the same way a
/// durable repo would be: only a newly-inserted row triggers billing.
pub mod in_memory {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryUsageLogRepo {
        seen: Mutex<HashSet<String>>,
    }

    impl InMemoryUsageLogRepo {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl UsageLogRepo for InMemoryUsageLogRepo {
        async fn create(&self, log: UsageLog) -> anyhow::Result<bool> {
            Ok(self.seen.lock().expect("usage log set poisoned").insert(log.idempotency_key))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn sample_log(key: &str) -> UsageLog {
            UsageLog {
                idempotency_key: key.to_string(),
                account_id: 1,
                model: "gpt-5".into(),
                input_tokens: 100,
                output_tokens: 50,
                cached_tokens: 0,
                created_at: OffsetDateTime::UNIX_EPOCH,
            }
        }

        #[tokio::test]
        async fn duplicate_idempotency_key_is_not_reinserted() {
            let repo = InMemoryUsageLogRepo::new();
            assert!(repo.create(sample_log("resp_1")).await.unwrap());
            assert!(!repo.create(sample_log("resp_1")).await.unwrap());
        }
    }
}
