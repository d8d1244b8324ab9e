//! Sponsor Relayer - pays gas for end-user transactions from a pool of signer accounts
//!
//! Loads the signer pool, coordinates nonces through the configured lock store,
//! keeps pool accounts topped up on a schedule and serves operator endpoints.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use sponsor_relayer::api::{self, AppState};
use sponsor_relayer::chain::{ChainProvider, ConfirmationWatcher, NetworkClient};
use sponsor_relayer::config::Settings;
use sponsor_relayer::metrics::{self, MetricsServer};
use sponsor_relayer::state::{MemoryLockStore, NonceLockStore, PgLockStore};
use sponsor_relayer::tasks::{PoolTopUpTask, Schedule, TaskRunner};
use sponsor_relayer::tx::{GasEstimator, NonceLock, TransactionSender, TASKS_NAMESPACE, WALLET_NAMESPACE};
use sponsor_relayer::wallet::{AccountPool, BalanceMaintainer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Sponsor Relayer v{}", env!("CARGO_PKG_VERSION"));
    let started_at = Instant::now();

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({}), environment {}",
        settings.chain.name, settings.chain.chain_id, settings.relayer.environment
    );

    // Lock store: PostgreSQL when configured, otherwise process-local
    let store: Arc<dyn NonceLockStore> = if settings.database.url.is_empty() {
        Arc::new(MemoryLockStore::new())
    } else {
        let pg = PgLockStore::new(&settings.database, &settings.locks).await?;
        info!("Database connection established");
        pg.run_migrations().await?;
        info!("Database migrations complete");
        Arc::new(pg)
    };

    // Chain connection
    let provider = Arc::new(ChainProvider::new(settings.chain.clone()).await?);
    let client: Arc<dyn NetworkClient> = provider.clone();
    info!("Chain connection initialized");

    // Signer pool
    let accounts = AccountPool::load_accounts(&settings.wallet, settings.chain.chain_id)?;
    let nonce_lock = Arc::new(NonceLock::new(store.clone(), WALLET_NAMESPACE, &settings.locks));
    let pool = Arc::new(
        AccountPool::init(
            accounts,
            client.clone(),
            &nonce_lock,
            settings.wallet.min_balance_wei(),
        )
        .await?,
    );

    let sender = Arc::new(TransactionSender::new(
        client.clone(),
        pool.clone(),
        nonce_lock.clone(),
        GasEstimator::new(&settings.gas),
        ConfirmationWatcher::from_config(client.clone(), &settings.chain),
    ));
    let maintainer = Arc::new(BalanceMaintainer::new(
        sender.clone(),
        settings.topping.clone(),
        settings.relayer.is_permissive(),
    ));
    info!("Admin balance: {} wei", sender.get_balance(None).await?);

    // Scheduled tasks
    let tasks_lock = Arc::new(NonceLock::new(store.clone(), TASKS_NAMESPACE, &settings.locks));
    let mut task_runner = TaskRunner::new(tasks_lock);
    if settings.tasks.pool_top_up_enabled {
        let schedule = match &settings.tasks.pool_top_up_cron {
            Some(expression) => Schedule::cron(expression)?,
            None => Schedule::Every(Duration::from_secs(settings.tasks.pool_top_up_interval_secs)),
        };
        task_runner.register_task(Arc::new(PoolTopUpTask::new(
            maintainer.clone(),
            pool.clone(),
            schedule,
        )))?;
    }
    let task_runner = Arc::new(task_runner);
    task_runner.start_tasks().await;

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            pool: pool.clone(),
            nonce_lock: nonce_lock.clone(),
            store: store.clone(),
            client: client.clone(),
            started_at,
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let provider = provider.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let chain_ok = provider.health_check().await;
                if !chain_ok {
                    warn!("Chain {} health check failed", provider.chain_id());
                }

                let store_ok = match store.health_check().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Lock store health check failed: {}", e);
                        false
                    }
                };

                if chain_ok && store_ok {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Sponsor Relayer is running ({})", settings.relayer.instance_id);
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: let task runs in progress finish and release their locks
    task_runner.stop_tasks().await;

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Sponsor Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,sponsor_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
