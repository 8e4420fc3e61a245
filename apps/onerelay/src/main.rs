use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use onerelay_common::GlobalConfig;
use onerelay_core::{
    Core, MemoryAuth, MemoryChannelStore, QuotaSettlement, RelayEngine, TiktokenCounter,
};
use onerelay_provider_core::{ClientPoolConfig, HttpClientPool};
use onerelay_provider_impl::builtin_registry;
use tracing::{info, warn};

mod cli;
mod seed;

use crate::cli::Cli;
use crate::seed::Seed;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("onerelay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let seed = match cli.seed.as_deref() {
        Some(path) => Seed::load(path)?,
        None => Seed::default(),
    };

    // CLI > ENV > seed file > defaults; clap already folds ENV under CLI.
    let mut patch = seed.config_patch();
    patch.overlay(cli.patch());
    let config = patch.into_config().context("merge global config")?;
    info!(
        event = "config_loaded",
        host = %config.host,
        port = config.port,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        relay_timeout_secs = config.relay_timeout_secs,
        admin_enabled = config.admin_key_hash.is_some()
    );
    if config.admin_key_hash.is_none() {
        warn!(event = "admin_disabled", "no admin key configured; balance refresh is unavailable");
    }

    let channels = Arc::new(MemoryChannelStore::new(seed.channels.iter().cloned()));
    let ledger = Arc::new(seed.ledger());
    let auth = Arc::new(MemoryAuth::new(seed.auth_snapshot()));
    info!(
        event = "seed_loaded",
        channels = seed.channels.len(),
        users = seed.users.len(),
        tokens = seed.tokens.len()
    );

    let engine = RelayEngine::new(
        Arc::new(builtin_registry()),
        channels.clone(),
        QuotaSettlement::new(ledger, channels, Arc::new(seed.pricing)),
        Arc::new(TiktokenCounter::new()),
        Arc::new(HttpClientPool::new(client_pool_config(&config))),
    );
    let core = Core::new(Arc::new(engine), auth, config.admin_key_hash.clone());

    let bind = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, core.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    Ok(())
}

fn client_pool_config(config: &GlobalConfig) -> ClientPoolConfig {
    ClientPoolConfig {
        default_proxy: config.proxy.clone(),
        request_timeout: (config.relay_timeout_secs > 0)
            .then(|| Duration::from_secs(config.relay_timeout_secs)),
        ..ClientPoolConfig::default()
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "signal_failed", error = %err);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("onerelay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
