use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker_supervisor::config::SupervisorConfig;
use worker_supervisor::instances::{InstanceRegistry, instance_routes};
use worker_supervisor::store::{JsonFileStore, SnapshotStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = SupervisorConfig::from_env().context("Invalid supervisor configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("🛰️  Worker Supervisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {} {}", config.worker.program, config.worker.args.join(" "));
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   API: http://0.0.0.0:{}/api/instances", config.port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws", config.port);

    // ── Notifications ────────────────────────────────────────────────────
    let notifier = worker_supervisor::notify::from_env().context("Invalid notifier config")?;
    match &notifier {
        Some(n) => eprintln!("   Notify: {}", n.name()),
        None => eprintln!("   Notify: disabled"),
    }

    // ── Registry ─────────────────────────────────────────────────────────
    let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileStore::new(config.snapshot_path()));
    let registry = InstanceRegistry::new(&config, store, notifier);
    let restored = registry.restore().await;
    if restored > 0 {
        eprintln!("   Restored {} instances from snapshot", restored);
    }

    // ── HTTP / WebSocket ─────────────────────────────────────────────────
    let app = instance_routes(registry.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Supervisor server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down, writing final snapshot");
    registry
        .persist_now()
        .await
        .context("Failed to write final snapshot")?;

    Ok(())
}

fn init_tracing(config: &SupervisorConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "worker-supervisor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
