//! Wires the seven core components (spec.md §2) behind the axum listener.
//! Grounded on the teacher's `gproxy_core::bootstrap::bootstrap_from_env`:
//! one function builds every shared `Arc<_>` the route handlers close over,
//! so `main` stays a thin "build, then serve" shell.

use std::sync::Arc;

use arc_swap::ArcSwap;
use gproxy_account::{AccountSnapshot, FallbackCooldownMap};
use gproxy_common::{GatewayConfig, GlobalConfig};
use gproxy_context::{ContextPool, ContextPoolConfig};
use gproxy_pool::{ConnPool, ConnPoolConfig};
use gproxy_refresh::{HttpOAuthRefresher, RefreshScheduler};
use gproxy_state::{StateStore, StateStoreConfig};
use gproxy_storage::{InMemoryAccountRepo, InMemoryCache, InMemoryLock, InMemoryUsageLogRepo};
use gproxy_toolcorrect::CorrectorStats;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;

/// Everything a connection handler needs, cloned cheaply (all `Arc`) into
/// each spawned task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    /// Host/port/proxy/redaction: the one slice of config a future admin
    /// surface could swap at runtime without a restart. Every read goes
    /// through `.load()` rather than being captured once at connection
    /// setup, so a swap takes effect for the very next turn.
    pub global: Arc<ArcSwap<GlobalConfig>>,
    pub context_pool: Arc<ContextPool>,
    pub state_store: Arc<StateStore>,
    pub fallback: Arc<FallbackCooldownMap>,
    pub corrector_stats: Arc<CorrectorStats>,
    pub usage_log_repo: Arc<InMemoryUsageLogRepo>,
    pub account_repo: Arc<InMemoryAccountRepo>,
}

impl AppState {
    pub fn apply_global_config(&self, config: GlobalConfig) {
        self.global.store(Arc::new(config));
    }
}

pub struct Boot {
    pub state: AppState,
    pub refresh_scheduler: Arc<RefreshScheduler>,
    pub refresh_cancel: CancellationToken,
}

fn load_seed_accounts(path: Option<&str>) -> anyhow::Result<Vec<AccountSnapshot>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Builds the gateway's shared state and background workers. Mirrors the
/// teacher's CLI > ENV > defaults merge order: every `GatewayConfig` field
/// is a compiled-in default here since this core owns no config DB (spec
/// §6); only bind address, proxy, and the account seed file are exposed on
/// the CLI.
pub async fn bootstrap(cli: &Cli) -> anyhow::Result<Boot> {
    let config = Arc::new(GatewayConfig::default().normalized());
    let global = Arc::new(ArcSwap::from_pointee(GlobalConfig {
        host: cli.host.clone(),
        port: cli.port,
        proxy: cli.proxy.clone(),
        event_redact_sensitive: true,
    }));

    let seed_accounts = load_seed_accounts(cli.accounts_file.as_deref())?;
    if seed_accounts.is_empty() {
        tracing::warn!("no accounts configured; every WS upgrade will fail with QueueFull until --accounts-file is set");
    }
    let account_repo = Arc::new(InMemoryAccountRepo::new(seed_accounts));

    let cache = Arc::new(InMemoryCache::new());
    let lock = Arc::new(InMemoryLock::new());
    let usage_log_repo = Arc::new(InMemoryUsageLogRepo::new());

    let conn_pool = Arc::new(ConnPool::new(ConnPoolConfig {
        max_conns_per_account: config.max_conns_per_account,
        min_idle_per_account: config.min_idle_per_account,
        max_idle_per_account: config.max_idle_per_account,
        queue_limit_per_conn: config.queue_limit_per_conn,
        dial_timeout: std::time::Duration::from_secs(config.dial_timeout_seconds),
        mode_router_v2_enabled: config.mode_router_v2_enabled,
        oauth_max_conns_factor: config.oauth_max_conns_factor,
        api_key_max_conns_factor: config.api_key_max_conns_factor,
        pool_target_utilization: config.pool_target_utilization,
        prewarm_cooldown: std::time::Duration::from_millis(config.prewarm_cooldown_ms),
        ..ConnPoolConfig::default()
    }));
    let _ = conn_pool.spawn_background_workers();
    let context_pool = Arc::new(ContextPool::with_conn_pool(
        ContextPoolConfig {
            idle_ttl: std::time::Duration::from_secs(config.sticky_session_ttl_seconds),
        },
        conn_pool,
    ));
    let state_store = Arc::new(StateStore::new(
        StateStoreConfig {
            response_account_ttl: std::time::Duration::from_secs(config.sticky_response_id_ttl_seconds),
            ..StateStoreConfig::default()
        },
        cache.clone(),
    ));
    let fallback = Arc::new(FallbackCooldownMap::new());
    let corrector_stats = Arc::new(CorrectorStats::new());

    let mut http_client_builder = wreq::Client::builder();
    if let Some(proxy) = cli.proxy.as_deref() {
        http_client_builder = http_client_builder.proxy(wreq::Proxy::all(proxy)?);
    }
    let http_client = Arc::new(http_client_builder.build()?);
    let refresher = Arc::new(HttpOAuthRefresher::new(http_client));
    let refresh_scheduler = Arc::new(RefreshScheduler::new(
        refresher,
        account_repo.clone(),
        lock,
        cache.clone(),
        config.token_refresh.clone(),
    ));
    let refresh_cancel = refresh_scheduler.stop_handle();

    Ok(Boot {
        state: AppState {
            config,
            global,
            context_pool,
            state_store,
            fallback,
            corrector_stats,
            usage_log_repo,
            account_repo,
        },
        refresh_scheduler,
        refresh_cancel,
    })
}
