use std::sync::Arc;

use thiserror::Error;
use tollgate_core::config::{AppConfig, ConfigError, LoadOptions};
use tollgate_db::{connect_with_config, migrations, ApprovalWorkflow, DbPool};
use tracing::info;

use crate::notifier::TracingNotifier;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: Arc<ApprovalWorkflow>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

/// Loads and validates configuration. Runs before logging is installed, so
/// it does not log.
pub fn load_config(options: LoadOptions) -> Result<AppConfig, BootstrapError> {
    Ok(AppConfig::load(options)?)
}

pub async fn bootstrap(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let workflow = Arc::new(ApprovalWorkflow::from_pool(
        db_pool.clone(),
        &config.workflow,
        Arc::new(TracingNotifier),
    ));

    Ok(Application { config, db_pool, workflow })
}
