//! A concrete [`Refresher`] for plain OAuth-refresh-token-grant backends,
//! grounded on the teacher's `claudecode::refresh::refresh_access_token`
//! (POST `grant_type=refresh_token` as JSON, read back `access_token` /
//! `refresh_token` / `expires_in`). The scheduler only ever drives the
//! trait; this is the one HTTP-speaking implementation the gateway app
//! wires up by default for API-compatible OAuth providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gproxy_account::{AccountSnapshot, AccountStatus, AuthType, Credential, OAuthCredential};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::refresher::{RefreshError, Refresher};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Seconds until expiry, relative to the response.
    #[serde(default)]
    expires_in: Option<i64>,
}

/// POSTs to `<account.base_url>/v1/oauth/token` with a refresh-token grant.
/// Accounts whose credential isn't `OAuth`, or that are disabled, are
/// skipped by `can_refresh` before any network call happens.
pub struct HttpOAuthRefresher {
    client: Arc<wreq::Client>,
    token_path: String,
}

impl HttpOAuthRefresher {
    pub fn new(client: Arc<wreq::Client>) -> Self {
        Self {
            client,
            token_path: "/v1/oauth/token".to_string(),
        }
    }

    pub fn with_token_path(mut self, path: impl Into<String>) -> Self {
        self.token_path = path.into();
        self
    }
}

#[async_trait]
impl Refresher for HttpOAuthRefresher {
    fn can_refresh(&self, account: &AccountSnapshot) -> bool {
        matches!(account.status, AccountStatus::Active) && matches!(account.credential, Credential::OAuth(_))
    }

    fn needs_refresh(&self, account: &AccountSnapshot, refresh_before_expiry: Duration) -> bool {
        let Credential::OAuth(ref cred) = account.credential else {
            return false;
        };
        let now_millis = OffsetDateTime::now_utc().unix_timestamp() * 1000;
        let window_millis = refresh_before_expiry.as_millis() as i64;
        cred.expires_at <= now_millis + window_millis
    }

    async fn refresh(&self, account: &AccountSnapshot) -> Result<AccountSnapshot, RefreshError> {
        let Credential::OAuth(ref cred) = account.credential else {
            return Err(RefreshError::new("account has no OAuth credential"));
        };

        let url = format!("{}{}", account.base_url.trim_end_matches('/'), self.token_path);
        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": cred.refresh_token,
            "client_id": cred.client_id,
            "client_secret": cred.client_secret,
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| RefreshError::new(format!("refresh request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::new(format!("refresh rejected with status {status}: {body}")));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| RefreshError::new(format!("malformed refresh response: {err}")))?;

        let expires_at = parsed
            .expires_in
            .map(|secs| OffsetDateTime::now_utc().unix_timestamp() * 1000 + secs * 1000)
            .unwrap_or(cred.expires_at);

        let mut updated = account.clone();
        updated.credential = Credential::OAuth(OAuthCredential {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_else(|| cred.refresh_token.clone()),
            expires_at,
            client_id: cred.client_id.clone(),
            client_secret: cred.client_secret.clone(),
        });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_account(expires_at: i64) -> AccountSnapshot {
        AccountSnapshot {
            id: 1,
            platform: "openai".into(),
            auth_type: AuthType::OAuth,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency: 4,
            credential: Credential::OAuth(OAuthCredential {
                access_token: "old-access".into(),
                refresh_token: "refresh-1".into(),
                expires_at,
                client_id: Some("client-1".into()),
                client_secret: None,
            }),
            base_url: "https://example.test".into(),
            model_mapping: Default::default(),
            extra_flags: Default::default(),
        }
    }

    #[test]
    fn api_key_accounts_are_never_refreshable() {
        let refresher = HttpOAuthRefresher::new(Arc::new(wreq::Client::new()));
        let mut account = oauth_account(0);
        account.credential = Credential::ApiKey { api_key: "sk-test".into() };
        assert!(!refresher.can_refresh(&account));
    }

    #[test]
    fn needs_refresh_is_true_once_inside_the_expiry_window() {
        let refresher = HttpOAuthRefresher::new(Arc::new(wreq::Client::new()));
        let far_future = OffsetDateTime::now_utc().unix_timestamp() * 1000 + 999_999_999;
        let account = oauth_account(far_future);
        assert!(!refresher.needs_refresh(&account, Duration::from_secs(3600)));

        let almost_expired = OffsetDateTime::now_utc().unix_timestamp() * 1000 + 1000;
        let account = oauth_account(almost_expired);
        assert!(refresher.needs_refresh(&account, Duration::from_secs(3600)));
    }
}
