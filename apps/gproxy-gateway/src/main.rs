//! The gateway binary: parses the CLI surface, boots the core's shared
//! state (`bootstrap`), spawns the token-refresh scheduler, and serves the
//! WS ingress (with a thin HTTP fallback stub) behind axum — the same
//! "build, then serve" shell as the teacher's `apps/gproxy/src/main.rs`.

mod bootstrap;
mod cli;
mod sse_fallback;
mod ws_ingress;

use anyhow::Result;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_filter.clone()))
        .init();

    let boot = bootstrap::bootstrap(&cli).await?;
    let global = boot.state.global.load();
    let bind = format!("{}:{}", global.host, global.port);
    drop(global);

    let scheduler = boot.refresh_scheduler.clone();
    let refresh_task = tokio::spawn(async move { scheduler.run().await });

    let app = Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/v1/responses/ws", get(ws_ingress::upgrade))
        .route("/v1/responses", post(sse_fallback::fallback))
        .with_state(boot.state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "gproxy-gateway listening");

    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    boot.refresh_cancel.cancel();
    refresh_task.abort();
    Ok(())
}
