use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use grelay_core::Core;
use grelay_dispatch::{Monitor, Pipeline, Relay, build_registry};
use grelay_relay_core::{BillingTasks, ConsumptionRecorder, CredentialCache, MemoryRecorder};
use grelay_storage::ConsumeStorage;
use tracing::{error, info, warn};

mod cli;
mod config;
mod snapshot;

use crate::cli::Cli;
use crate::config::GatewayConfig;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(event = "startup_failed", error = %format!("{err:#}"));
        eprintln!("grelay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config =
        GatewayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.apply_cli(&cli);
    config.validate()?;
    info!(
        host = %config.host,
        port = config.port,
        channels = config.channels.len(),
        groups = config.groups.len(),
        tokens = config.tokens.len(),
        prices = config.prices.len(),
        billing_enabled = config.relay.billing_enabled,
        "config loaded"
    );

    let recorder: Arc<dyn ConsumptionRecorder> = match config.dsn() {
        Some(dsn) => {
            let storage = ConsumeStorage::connect(dsn)
                .await
                .with_context(|| format!("failed to connect to {dsn}"))?;
            storage.sync().await.context("failed to sync schema")?;
            info!(dsn = %dsn, "db connected");
            Arc::new(storage)
        }
        None => {
            warn!("no dsn configured, consumption logs are kept in memory");
            Arc::new(MemoryRecorder::new())
        }
    };

    let tasks = BillingTasks::new();
    let credentials = CredentialCache::new(config.relay.credential_refresh_window());
    let monitor = Arc::new(Monitor::new(config.relay.monitor.clone()));
    let pipeline = Pipeline::new(
        build_registry(credentials),
        Arc::new(snapshot::build_balance(&config)),
        Arc::new(snapshot::build_pricing(&config)),
        recorder,
        tasks.clone(),
        Arc::new(config.relay.clone()),
    );
    let relay = Relay::new(
        Arc::new(pipeline),
        Arc::new(snapshot::build_channels(&config)),
        monitor,
    );
    let auth = snapshot::build_auth(&config);
    info!(api_keys = auth.len(), "auth ready");

    let core = Core::new(Arc::new(relay), Arc::new(auth), config.core.clone());
    let app = core.router();

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let deadline = Instant::now() + grace;
    info!(pending = core.pending_relays(), "listener stopped, draining relays");
    if !core.drain_relays(grace).await {
        warn!(pending = core.pending_relays(), "relays still running at exit");
    }
    info!(pending = tasks.pending(), "draining billing");
    let remaining = deadline.saturating_duration_since(Instant::now());
    if !tasks.drain_timeout(remaining).await {
        warn!(pending = tasks.pending(), "billing tasks still running at exit");
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("grelay=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for sigterm");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
