use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Ambient process configuration: bind address, egress proxy, log redaction.
/// Merge order: CLI > ENV > defaults (no DB layer; this core owns no storage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub event_redact_sensitive: Option<bool>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
    }

    pub fn into_config(self) -> GlobalConfig {
        GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            proxy: self.proxy,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
        }
    }
}

/// The `Gateway.OpenAIWS` + `TokenRefresh` config surface (spec §6). Every
/// field here is a tunable the pool/context/forwarder/refresh crates read at
/// startup; none of it is mutated at runtime except through a fresh process
/// restart, so it is handed to each crate as a plain `Arc<GatewayConfig>`
/// rather than behind an `ArcSwap` the way `GlobalConfig` is in the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub oauth_enabled: bool,
    pub api_key_enabled: bool,
    pub responses_websockets_v2: bool,
    pub max_conns_per_account: u32,
    pub min_idle_per_account: u32,
    pub max_idle_per_account: u32,
    pub queue_limit_per_conn: u32,
    pub dial_timeout_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
    pub sticky_session_ttl_seconds: u64,
    pub sticky_response_id_ttl_seconds: u64,
    pub fallback_cooldown_seconds: u64,
    pub pool_target_utilization: f64,
    pub prewarm_cooldown_ms: u64,
    pub dynamic_max_conns_by_account_concurrency_enabled: bool,
    pub mode_router_v2_enabled: bool,
    pub oauth_max_conns_factor: f64,
    pub api_key_max_conns_factor: f64,
    pub retry_backoff_initial_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub retry_jitter_ratio: f64,
    /// Preflight-ping idle threshold, in turns; `0` means "ping before every
    /// turn" rather than "preflight disabled" (see DESIGN.md Open Questions).
    pub openai_ws_ingress_preflight_ping_idle: u32,
    pub token_refresh: TokenRefreshConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRefreshConfig {
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
    pub check_interval_minutes: u64,
    pub refresh_before_expiry_hours: u64,
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_seconds: 2,
            check_interval_minutes: 5,
            refresh_before_expiry_hours: 1,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            oauth_enabled: true,
            api_key_enabled: true,
            responses_websockets_v2: true,
            max_conns_per_account: 8,
            min_idle_per_account: 1,
            max_idle_per_account: 4,
            queue_limit_per_conn: 64,
            dial_timeout_seconds: 10,
            read_timeout_seconds: 60,
            write_timeout_seconds: 10,
            sticky_session_ttl_seconds: 600,
            sticky_response_id_ttl_seconds: 600,
            fallback_cooldown_seconds: 60,
            pool_target_utilization: 0.75,
            prewarm_cooldown_ms: 500,
            dynamic_max_conns_by_account_concurrency_enabled: true,
            mode_router_v2_enabled: true,
            oauth_max_conns_factor: 1.0,
            api_key_max_conns_factor: 1.0,
            retry_backoff_initial_ms: 200,
            retry_backoff_max_ms: 5_000,
            retry_jitter_ratio: 0.2,
            openai_ws_ingress_preflight_ping_idle: 0,
            token_refresh: TokenRefreshConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// `min_idle_per_account` can never exceed `max_idle_per_account`; a
    /// misconfigured pair is clamped down rather than rejected at startup
    /// (see DESIGN.md Open Questions).
    pub fn normalized(mut self) -> Self {
        if self.min_idle_per_account > self.max_idle_per_account {
            self.min_idle_per_account = self.max_idle_per_account;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_config_patch_overlay_prefers_later_values() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".into()),
            port: Some(8080),
            proxy: None,
            event_redact_sensitive: Some(true),
        };
        base.overlay(GlobalConfigPatch {
            host: None,
            port: Some(9090),
            proxy: Some("http://proxy.local:3128".into()),
            event_redact_sensitive: None,
        });
        let config = base.into_config();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(config.proxy.as_deref(), Some("http://proxy.local:3128"));
        assert!(config.event_redact_sensitive);
    }

    #[test]
    fn gateway_config_clamps_min_idle_above_max_idle() {
        let mut config = GatewayConfig::default();
        config.min_idle_per_account = 10;
        config.max_idle_per_account = 4;
        let config = config.normalized();
        assert_eq!(config.min_idle_per_account, 4);
    }
}
