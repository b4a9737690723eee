//! Locker server entry point.
//!
//! Opens one storage backend per tenant, builds every tenant's services and
//! starts the Axum HTTP server with graceful shutdown. A background worker
//! runs the scheduled maintenance jobs of every tenant and is cancelled on
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use locker_core::auth::JwtKeys;
use locker_core::billing::{ManualGateway, PaymentGateway};
use locker_core::crypto::{self, EncryptionKey};
use locker_core::event::{EventSink, FileEventSink};
use locker_core::jobs::JobReport;
use locker_core::{Locker, LockerSettings, TenantRouter};
use locker_storage::{MemoryBackend, StorageBackend};

use locker_server::config::{ServerConfig, StorageBackendType, TenantConfig};
use locker_server::state::AppState;

/// Locker password manager server.
#[derive(Parser)]
#[command(
    name = "locker-server",
    version,
    about = "Locker server: vault sync, teams, billing, relay and emergency access",
    long_about = None,
    after_help = "Configuration is read from LOCKER_* environment variables \
                  (LOCKER_DATABASES, LOCKER_SECRET_KEY, LOCKER_BIND_ADDR, ...)."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run scheduled jobs in the background (default).
    Serve,
    /// Run every scheduled job once for every tenant, then exit.
    RunJobs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_env().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    let state = build_app_state(&config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, state).await,
        Commands::RunJobs => run_jobs_once(&state).await,
    }
}

async fn serve(config: &ServerConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handle = {
        let tenants: Vec<Arc<Locker>> = state.tenants.all().cloned().collect();
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.job_interval_secs;
        tokio::spawn(async move {
            job_worker(tenants, &mut rx, interval_secs).await;
        })
    };

    let app = locker_server::build_router(Arc::clone(&state), config.max_concurrency);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, tenants = state.tenants.len(), "Locker server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    if tokio::time::timeout(Duration::from_secs(10), worker_handle).await.is_err() {
        warn!("job worker did not stop within 10s");
    }

    info!("Locker server stopped");
    Ok(())
}

/// `locker-server run-jobs`: one pass for cron-style deployments.
async fn run_jobs_once(state: &AppState) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for locker in state.tenants.all() {
        let reports = locker.scheduler().run_all(Utc::now()).await;
        for report in &reports {
            info!(
                tenant = locker.alias(),
                job = report.job,
                affected = report.affected,
                error = report.error.as_deref(),
                "job finished"
            );
        }
        failed = failed.saturating_add(reports.iter().filter(|r| !r.is_ok()).count());
    }
    if failed > 0 {
        anyhow::bail!("{failed} scheduled job(s) failed");
    }
    Ok(())
}

/// Open every tenant and build the shared application state.
async fn build_app_state(config: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let master_key = match &config.secret_key {
        Some(hex) => EncryptionKey::from_hex(hex).context("LOCKER_SECRET_KEY is not a valid key")?,
        None => {
            warn!("LOCKER_SECRET_KEY not set, using a throwaway key (in-memory tenants only)");
            EncryptionKey::generate()
        }
    };

    let jwt = match &config.jwt_secret {
        Some(secret) => JwtKeys::new(secret.as_bytes()),
        None => {
            let derived = crypto::derive_key(&master_key, "locker-jwt").context("failed to derive JWT key")?;
            JwtKeys::new(derived.as_bytes())
        }
    }
    .context("invalid JWT secret")?;
    let jwt = Arc::new(jwt);

    let mut settings = LockerSettings {
        relay_domain: config.relay_domain.clone(),
        ..LockerSettings::default()
    };
    if let Some(path) = &config.event_file {
        let sink: Arc<dyn EventSink> = Arc::new(FileEventSink::new(path));
        settings.event_sinks.push(sink);
        info!(path = %path, "file event sink registered");
    }

    let gateway: Arc<dyn PaymentGateway> = Arc::new(ManualGateway);
    let mut tenants = TenantRouter::new(&config.default_tenant).context("invalid default tenant")?;
    for tenant in &config.tenants {
        let storage = open_storage(tenant).await?;
        let locker = Locker::open(
            &tenant.alias,
            storage,
            &master_key,
            Arc::clone(&jwt),
            Arc::clone(&gateway),
            &settings,
        )
        .with_context(|| format!("failed to open tenant '{}'", tenant.alias))?;
        tenants.register(locker)?;
    }
    info!(
        tenants = tenants.len(),
        default = tenants.default_alias(),
        relay_domain = %config.relay_domain,
        "tenants ready"
    );

    Ok(Arc::new(AppState {
        tenants,
        jwt,
        relay_secret: config.relay_secret.clone(),
        admin_token: config.admin_token.clone(),
    }))
}

async fn open_storage(tenant: &TenantConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let alias = tenant.alias.as_str();
    Ok(match &tenant.storage {
        StorageBackendType::Memory => {
            info!(tenant = alias, "using in-memory storage (data will not persist)");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(tenant = alias, path = %path, "using RocksDB storage");
            Arc::new(locker_storage::RocksDbBackend::open(path).context("failed to open RocksDB storage")?)
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("tenant '{alias}' uses RocksDB but feature 'rocksdb-backend' is not enabled");
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!(tenant = alias, url = %"[redacted]", "using PostgreSQL storage");
            Arc::new(
                locker_storage::PostgresBackend::connect(url, None)
                    .await
                    .context("failed to connect to PostgreSQL storage")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("tenant '{alias}' uses PostgreSQL but feature 'postgres-backend' is not enabled");
        }
    })
}

/// Maximum retries per tick when a tenant's pass fails.
const JOB_MAX_RETRIES: u32 = 3;

/// Consecutive failing ticks before failures are logged as errors.
const JOB_FAILURE_ESCALATION: u32 = 5;

/// Background worker that runs every tenant's scheduled jobs on a timer.
///
/// A tenant whose pass reports a failed job is retried with exponential
/// backoff (1s, 2s, 4s) within the same tick. The consecutive-failure
/// counter escalates log severity when storage stays unreachable.
async fn job_worker(tenants: Vec<Arc<Locker>>, shutdown: &mut watch::Receiver<bool>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut consecutive_failures: u32 = 0;
    info!(interval_secs, tenants = tenants.len(), "job worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut tick_failed = false;
                for locker in &tenants {
                    match run_with_retry(locker, shutdown).await {
                        None => {
                            info!("job worker shutting down");
                            return;
                        }
                        Some(reports) => {
                            let failed: Vec<&JobReport> = reports.iter().filter(|r| !r.is_ok()).collect();
                            if failed.is_empty() {
                                continue;
                            }
                            tick_failed = true;
                            let jobs: Vec<&str> = failed.iter().map(|r| r.job).collect();
                            if consecutive_failures.saturating_add(1) >= JOB_FAILURE_ESCALATION {
                                error!(
                                    tenant = locker.alias(),
                                    ?jobs,
                                    consecutive_failures = consecutive_failures.saturating_add(1),
                                    "scheduled jobs persistently failing, storage may be down"
                                );
                            } else {
                                warn!(
                                    tenant = locker.alias(),
                                    ?jobs,
                                    retries = JOB_MAX_RETRIES,
                                    "scheduled jobs failed after retries, will retry next tick"
                                );
                            }
                        }
                    }
                }
                consecutive_failures = if tick_failed { consecutive_failures.saturating_add(1) } else { 0 };
            }
            _ = shutdown.changed() => {
                info!("job worker shutting down");
                return;
            }
        }
    }
}

/// Run one tenant's jobs, retrying with backoff while any job fails.
/// Returns `None` if shutdown was signalled during a backoff.
async fn run_with_retry(locker: &Locker, shutdown: &mut watch::Receiver<bool>) -> Option<Vec<JobReport>> {
    let scheduler = locker.scheduler();
    let mut attempt: u32 = 0;
    loop {
        let reports = scheduler.run_all(Utc::now()).await;
        if attempt == JOB_MAX_RETRIES || reports.iter().all(JobReport::is_ok) {
            return Some(reports);
        }

        let backoff = Duration::from_secs(1u64 << attempt);
        attempt = attempt.saturating_add(1);
        debug!(
            tenant = locker.alias(),
            attempt,
            max = JOB_MAX_RETRIES.saturating_add(1),
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "job pass failed, retrying"
        );

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return None,
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
