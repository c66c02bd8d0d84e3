//! The `Account` data model (spec.md §3): a backend credential unit shared by
//! the upstream connection pool, the ingress context pool, and the
//! token-refresh scheduler.

use serde::{Deserialize, Serialize};

pub type AccountId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    OAuth,
    ApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix millis.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credential {
    OAuth(OAuthCredential),
    ApiKey { api_key: String },
}

impl Credential {
    pub fn auth_type(&self) -> AuthType {
        match self {
            Credential::OAuth(_) => AuthType::OAuth,
            Credential::ApiKey { .. } => AuthType::ApiKey,
        }
    }
}

/// An immutable point-in-time view of an account, as read by the pool,
/// context, and forwarder crates. Mutated only through the repository
/// (`AccountRepo::update`) and re-snapshotted; never mutated in place while
/// shared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub id: AccountId,
    pub platform: String,
    pub auth_type: AuthType,
    pub status: AccountStatus,
    pub schedulable: bool,
    /// Positive = capped concurrency, 0 = unlimited.
    pub concurrency: i64,
    pub credential: Credential,
    pub base_url: String,
    #[serde(default)]
    pub model_mapping: std::collections::HashMap<String, String>,
    /// Per-account feature toggles (e.g. `store_disabled`, `strict_affinity`).
    #[serde(default)]
    pub extra_flags: std::collections::HashMap<String, bool>,
}

impl AccountSnapshot {
    pub fn is_usable(&self) -> bool {
        self.schedulable && matches!(self.status, AccountStatus::Active)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.extra_flags.get(name).copied().unwrap_or(false)
    }

    pub fn store_disabled(&self) -> bool {
        self.flag("store_disabled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_disabled_defaults_false() {
        let acct = AccountSnapshot {
            id: 1,
            platform: "openai".into(),
            auth_type: AuthType::ApiKey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency: 4,
            credential: Credential::ApiKey {
                api_key: "sk-test".into(),
            },
            base_url: "wss://example.test".into(),
            model_mapping: Default::default(),
            extra_flags: Default::default(),
        };
        assert!(!acct.store_disabled());
        assert!(acct.is_usable());
    }
}
