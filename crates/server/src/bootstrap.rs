use std::sync::Arc;

use pacer_agent::{
    responder_from_config, ConversationOrchestrator, LoggingTransport, MessageBuffer,
    PollingScheduler, ResponderError, SchedulerSettings,
};
use pacer_core::config::{AppConfig, ConfigError};
use pacer_core::domain::message::MessageBatch;
use pacer_core::timing::NaturalTiming;
use pacer_db::{
    connect_from_config, migrations, DbPool, SqlProspectRepository, SqlScheduledActionStore,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub buffer: MessageBuffer,
    pub batches: mpsc::Receiver<MessageBatch>,
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub scheduler: Arc<PollingScheduler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("responder setup failed: {0}")]
    Responder(#[from] ResponderError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let actions = Arc::new(SqlScheduledActionStore::new(db_pool.clone()));
    let prospects = Arc::new(SqlProspectRepository::new(db_pool.clone()));
    let responder = responder_from_config(&config.llm)?;

    let orchestrator = Arc::new(ConversationOrchestrator::new(
        prospects,
        actions.clone(),
        responder,
        Arc::new(LoggingTransport),
        NaturalTiming::new(config.timing.clone()),
        config.conversation.clone(),
    ));
    let scheduler = Arc::new(PollingScheduler::new(
        actions,
        orchestrator.clone(),
        SchedulerSettings::from_config(&config.scheduler),
    ));
    let (buffer, batches) = MessageBuffer::new(&config.buffer);

    info!(
        event_name = "system.bootstrap.ready",
        llm_provider = config.llm.provider.as_str(),
        timing_mode = config.timing.mode.as_str(),
        "application components wired"
    );

    Ok(Application { config, db_pool, buffer, batches, orchestrator, scheduler })
}
