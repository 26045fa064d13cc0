//! Reference runner for the AI Task Execution Core.
//!
//! Persistence schema ownership is an explicit non-goal of this core
//! (spec.md / SPEC_FULL.md §1): a host platform supplies its own
//! `ConversationRepository`/`TaskRepository`/`ExecutionLogRepository`/
//! `ResultRepository`/`CredentialDecryptor` implementations backed by
//! whatever schema it already owns. This binary has none of those to
//! link against, so it wires the scheduler against the crate's in-memory
//! reference repositories and runs with an empty queue — its purpose is
//! to prove out the startup/shutdown sequence and metrics wiring a real
//! deployment would embed, not to serve traffic on its own.
//!
//! Startup sequence grounded on the teacher's `main.rs` /
//! `crates/session-manager/src/main.rs`: tracing init, Prometheus
//! recorder install, dependency construction, background task spawn,
//! signal-driven graceful shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use xsha_task_core::clock::SystemClock;
use xsha_task_core::container::ContainerExecutor;
use xsha_task_core::registry::ExecutionRegistry;
use xsha_task_core::repositories::testing::{InMemoryRepos, NullCredentialDecryptor};
use xsha_task_core::repositories::DefaultSystemConfig;
use xsha_task_core::scheduler::ConversationScheduler;
use xsha_task_core::workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let prometheus_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    // The handle itself isn't scraped by this binary (no HTTP surface is in
    // scope, per the named non-goal); holding it keeps the recorder alive
    // and documents where a host's own `/metrics` route would read from.
    std::mem::forget(prometheus_handle);

    let settings = xsha_task_core::config::settings();

    let repos = Arc::new(InMemoryRepos::new());
    let config = Arc::new(DefaultSystemConfig);
    let clock = Arc::new(SystemClock);
    let decryptor = Arc::new(NullCredentialDecryptor);
    let workspace = Arc::new(WorkspaceManager::new(
        settings.workspace_base_dir.clone(),
        config.clone(),
    ));
    let container = Arc::new(ContainerExecutor::new(
        config.clone(),
        settings.container_runtime.clone(),
    ));
    let registry = Arc::new(ExecutionRegistry::new(settings.max_concurrency));

    let scheduler = ConversationScheduler::new(
        repos.clone(),
        repos.clone(),
        repos.clone(),
        repos.clone(),
        decryptor,
        config,
        clock,
        workspace,
        container,
        registry,
        std::time::Duration::from_secs(settings.poll_interval_secs),
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_clone).await;
    });

    tracing::info!(
        max_concurrency = settings.max_concurrency,
        poll_interval_secs = settings.poll_interval_secs,
        "xsha task core started"
    );

    shutdown_signal().await;
    shutdown.cancel();

    let timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(timeout, scheduler_handle).await.is_err() {
        tracing::warn!("scheduler did not shut down within timeout");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler, matching the teacher's ctrl_c/SIGTERM
/// race in `main.rs`.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, starting graceful shutdown");
}
