use async_trait::async_trait;

/// Billing persistence is out of core's scope (spec Non-goals); these two
/// traits exist only so the forwarder's post-usage-log hook has something to
/// call against in an integration test. No implementation ships here.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn deduct_balance(&self, user_id: i64, amount_cents: i64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UserSubscriptionRepo: Send + Sync {
    async fn increment_usage(&self, user_id: i64, tokens: i64) -> anyhow::Result<()>;
}
