//! `arcanum-migrate`: one idempotent command that moves the legacy flat
//! configuration into the normalized, encrypted secret store.
//!
//! Exit codes: 0 complete or already complete, 1 validation failed (state
//! stays at the last good step), 2 unexpected fatal error.

use arcanum::config::AppConfig;
use arcanum::crypto::SecretCipher;
use arcanum::db::queries::init_db;
use arcanum::migration::{MigrationEngine, MigrationOutcome};
use sqlx::sqlite::SqlitePoolOptions;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arcanum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting arcanum-migrate v{}", env!("CARGO_PKG_VERSION"));

    // Pull ARCANUM_* overrides from .env if present
    dotenvy::dotenv().ok();

    match run().await {
        Ok(MigrationOutcome::Complete) => {
            info!("Migration complete");
            ExitCode::from(0)
        }
        Ok(MigrationOutcome::AlreadyComplete) => {
            info!("Store already migrated, nothing to do");
            ExitCode::from(0)
        }
        Ok(MigrationOutcome::ValidationFailed) => {
            error!("Validation failed; state left at the last good step");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("Migration failed: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> anyhow::Result<MigrationOutcome> {
    let config = AppConfig::init()?;
    info!("Configuration loaded");

    let cipher = Arc::new(SecretCipher::from_config(&config.crypto)?);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    init_db(&pool).await?;

    let engine = MigrationEngine::new(pool, cipher);

    // Ctrl-C stops between steps, never mid-step.
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    Ok(engine.run().await?)
}
