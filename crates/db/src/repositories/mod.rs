use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use pacer_core::domain::action::{ActionStatus, ScheduledAction, ScheduledActionId};
use pacer_core::domain::prospect::{ConversationId, Prospect};
use pacer_core::errors::ValidationError;
use pacer_core::scheduling::NewScheduledAction;

pub mod memory;
pub mod prospect;
pub mod scheduled_action;

pub use memory::{InMemoryProspectRepository, InMemoryScheduledActionStore};
pub use prospect::SqlProspectRepository;
pub use scheduled_action::SqlScheduledActionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Connection, lock or I/O trouble; callers may retry.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Durable queue of delayed actions. Every status change is a conditional
/// update so concurrent schedulers and cancellations never double-apply.
#[async_trait]
pub trait ScheduledActionStore: Send + Sync {
    async fn create(
        &self,
        request: NewScheduledAction,
        now: DateTime<Utc>,
    ) -> Result<ScheduledActionId, RepositoryError>;

    /// Cancels every pending or processing action of the conversation.
    async fn cancel_pending(
        &self,
        conversation_id: &ConversationId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError>;

    /// Atomically moves up to `limit` actions due at or before `due_by` to
    /// processing, ordered by `scheduled_for` then `created_at`.
    async fn claim_due(
        &self,
        limit: u32,
        due_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError>;

    async fn mark_executed(
        &self,
        id: &ScheduledActionId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn mark_cancelled(
        &self,
        id: &ScheduledActionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn reset_stale_processing(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledActionId>, RepositoryError>;

    async fn find_by_id(
        &self,
        id: &ScheduledActionId,
    ) -> Result<Option<ScheduledAction>, RepositoryError>;

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError>;
}

#[async_trait]
pub trait ProspectRepository: Send + Sync {
    async fn find_by_id(&self, id: &ConversationId) -> Result<Option<Prospect>, RepositoryError>;
    async fn save(&self, prospect: Prospect) -> Result<(), RepositoryError>;
}
