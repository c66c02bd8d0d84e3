use async_trait::async_trait;
use gproxy_account::AccountSnapshot;

/// Durable account storage read by the refresh scheduler's tick and written
/// back after a successful refresh or a non-retryable grant error.
#[async_trait]
pub trait AccountRepo: Send + Sync {
    async fn list_active(&self) -> anyhow::Result<Vec<AccountSnapshot>>;
    async fn update(&self, account: &AccountSnapshot) -> anyhow::Result<()>;
    async fn set_error(&self, account_id: gproxy_account::AccountId, reason: &str) -> anyhow::Result<()>;
}

/// Single-process reference repository. Durable account persistence is out
/// of core's scope (spec §1); this is what `apps/gproxy-gateway` seeds at
/// startup from its config file and what the rest of the workspace's
/// integration tests run against.
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryAccountRepo {
        accounts: Mutex<HashMap<gproxy_account::AccountId, AccountSnapshot>>,
    }

    impl InMemoryAccountRepo {
        pub fn new(seed: Vec<AccountSnapshot>) -> Self {
            let accounts = seed.into_iter().map(|a| (a.id, a)).collect();
            Self {
                accounts: Mutex::new(accounts),
            }
        }
    }

    #[async_trait]
    impl AccountRepo for InMemoryAccountRepo {
        async fn list_active(&self) -> anyhow::Result<Vec<AccountSnapshot>> {
            Ok(self
                .accounts
                .lock()
                .expect("account table poisoned")
                .values()
                .filter(|a| a.is_usable())
                .cloned()
                .collect())
        }

        async fn update(&self, account: &AccountSnapshot) -> anyhow::Result<()> {
            self.accounts
                .lock()
                .expect("account table poisoned")
                .insert(account.id, account.clone());
            Ok(())
        }

        async fn set_error(&self, account_id: gproxy_account::AccountId, reason: &str) -> anyhow::Result<()> {
            let mut accounts = self.accounts.lock().expect("account table poisoned");
            if let Some(account) = accounts.get_mut(&account_id) {
                account.status = gproxy_account::AccountStatus::Disabled;
                account.extra_flags.insert("error".to_string(), true);
                let _ = reason;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn sample_account(id: gproxy_account::AccountId, schedulable: bool) -> AccountSnapshot {
            AccountSnapshot {
                id,
                platform: "openai".into(),
                auth_type: gproxy_account::AuthType::ApiKey,
                status: gproxy_account::AccountStatus::Active,
                schedulable,
                concurrency: 4,
                credential: gproxy_account::Credential::ApiKey {
                    api_key: "sk-test".into(),
                },
                base_url: "wss://example.test".into(),
                model_mapping: Default::default(),
                extra_flags: Default::default(),
            }
        }

        #[tokio::test]
        async fn list_active_excludes_unschedulable_accounts() {
            let repo = InMemoryAccountRepo::new(vec![sample_account(1, true), sample_account(2, false)]);
            let active = repo.list_active().await.unwrap();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].id, 1);
        }

        #[tokio::test]
        async fn set_error_disables_account() {
            let repo = InMemoryAccountRepo::new(vec![sample_account(1, true)]);
            repo.set_error(1, "invalid_grant").await.unwrap();
            let active = repo.list_active().await.unwrap();
            assert!(active.is_empty());
        }
    }
}
