use std::sync::Arc;

use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod api;
mod backup;
mod config;
mod db;

use backup::engine::BackupEngine;
use backup::ledger::PgRunLedger;
use backup::scheduler::{BackupRunner, Scheduler, SystemClock};
use backup::settings::PgSettingsStore;
use backup::tools::ToolResolver;
use backup::vault::CredentialVault;
use config::Config;
use db::SqlxAppPool;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "custodian=info,sqlx=warn".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    // Load .env file
    dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    config
        .ensure_backup_dir()
        .expect("Failed to create backup directory");

    // Initialize the application database
    let app_pool = Arc::new(
        SqlxAppPool::connect(&config.database_url)
            .await
            .expect("Failed to initialize database"),
    );
    info!("database initialized");

    let vault = Arc::new(CredentialVault::new(
        config.encryption_secret.as_deref(),
        &config.database_name(),
        &config.session_cookie_name,
    ));
    if vault.using_fallback() {
        warn!("BACKUP_ENCRYPTION_SECRET not set, deriving a fallback key");
    }

    let settings = Arc::new(PgSettingsStore::new(app_pool.clone(), vault.clone()));
    let ledger = Arc::new(PgRunLedger::new(app_pool.clone()));
    let tools = Arc::new(ToolResolver::from_config(&config));

    let engine = Arc::new(BackupEngine::new(
        config.clone(),
        settings.clone(),
        ledger.clone(),
        tools,
        app_pool.clone(),
        vault.using_fallback(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        settings,
        ledger,
        engine.clone() as Arc<dyn BackupRunner>,
        engine.lock().clone(),
        Arc::new(SystemClock),
    ));
    let scheduler_task = scheduler.spawn();

    let app = api::router(engine);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind listener");
    info!(addr = %config.listen_addr, "backup engine listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "server exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    scheduler_task.abort();
}
