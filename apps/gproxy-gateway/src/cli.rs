//! CLI surface (spec.md §6: "core exposes no CLI; consumes a `Config`
//! object"). This binary is the one layer allowed to own a CLI, mirroring
//! the teacher's `apps/gproxy/src/cli.rs` `Cli`/`GlobalConfig` pair: flags
//! override env vars, which override the defaults baked into
//! `gproxy_common::GatewayConfig`. `host`/`port`/`proxy` seed the
//! `ArcSwap<GlobalConfig>` `bootstrap::bootstrap` hands out on `AppState`.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "gproxy-gateway")]
pub struct Cli {
    #[arg(long, env = "GPROXY_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "GPROXY_PORT", default_value_t = 8787)]
    pub port: u16,
    /// Path to a JSON file seeding the in-process account repository
    /// (`Vec<AccountSnapshot>`). Without it the gateway boots with no
    /// schedulable accounts, which is enough to exercise the admin-less
    /// health surface but will reject every WS upgrade with `QueueFull`.
    #[arg(long, env = "GPROXY_ACCOUNTS_FILE")]
    pub accounts_file: Option<String>,
    #[arg(long, env = "GPROXY_PROXY")]
    pub proxy: Option<String>,
    #[arg(long, env = "GPROXY_LOG", default_value = "info")]
    pub log_filter: String,
}
