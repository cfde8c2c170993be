use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use pacer_core::domain::action::{ActionStatus, ScheduledAction, ScheduledActionId};
use pacer_core::domain::prospect::{ConversationId, Prospect};
use pacer_core::scheduling::NewScheduledAction;

use super::{ProspectRepository, RepositoryError, ScheduledActionStore};

/// Insertion-ordered store; every operation holds the write lock for its
/// whole duration, which gives the same atomicity as the SQL statements.
#[derive(Default)]
pub struct InMemoryScheduledActionStore {
    actions: RwLock<Vec<ScheduledAction>>,
}

impl InMemoryScheduledActionStore {
    pub async fn snapshot(&self) -> Vec<ScheduledAction> {
        self.actions.read().await.clone()
    }
}

#[async_trait::async_trait]
impl ScheduledActionStore for InMemoryScheduledActionStore {
    async fn create(
        &self,
        request: NewScheduledAction,
        now: DateTime<Utc>,
    ) -> Result<ScheduledActionId, RepositoryError> {
        let validated = request.validate()?;
        let action = ScheduledAction {
            id: validated.id.clone(),
            conversation_id: validated.conversation_id,
            action_type: validated.action_type,
            scheduled_for: validated.scheduled_for,
            status: ActionStatus::Pending,
            payload: validated.payload,
            attempts: 0,
            started_processing_at: None,
            created_at: now,
            updated_at: now,
            executed_at: None,
            cancelled_at: None,
            cancel_reason: None,
        };
        self.actions.write().await.push(action);
        Ok(validated.id)
    }

    async fn cancel_pending(
        &self,
        conversation_id: &ConversationId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut actions = self.actions.write().await;
        let cancelled = actions
            .iter_mut()
            .filter(|action| &action.conversation_id == conversation_id)
            .filter_map(|action| action.mark_cancelled(reason, now).ok())
            .count();
        Ok(cancelled as u64)
    }

    async fn claim_due(
        &self,
        limit: u32,
        due_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        let mut actions = self.actions.write().await;

        let mut due: Vec<usize> = actions
            .iter()
            .enumerate()
            .filter(|(_, action)| action.is_due(due_by))
            .map(|(index, _)| index)
            .collect();
        due.sort_by(|left, right| {
            let (left, right) = (&actions[*left], &actions[*right]);
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for index in due {
            let action = &mut actions[index];
            action
                .claim(now)
                .map_err(|error| RepositoryError::Decode(error.to_string()))?;
            claimed.push(action.clone());
        }
        Ok(claimed)
    }

    async fn mark_executed(
        &self,
        id: &ScheduledActionId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut actions = self.actions.write().await;
        Ok(actions
            .iter_mut()
            .find(|action| &action.id == id)
            .is_some_and(|action| action.mark_executed(now).is_ok()))
    }

    async fn mark_cancelled(
        &self,
        id: &ScheduledActionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut actions = self.actions.write().await;
        Ok(actions
            .iter_mut()
            .find(|action| &action.id == id)
            .is_some_and(|action| action.mark_cancelled(reason, now).is_ok()))
    }

    async fn reset_stale_processing(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledActionId>, RepositoryError> {
        let threshold = now - stale_after;
        let mut actions = self.actions.write().await;
        let mut recovered = Vec::new();
        for action in actions.iter_mut().filter(|action| action.is_stale(threshold)) {
            if action.recover(now).is_ok() {
                recovered.push(action.id.clone());
            }
        }
        Ok(recovered)
    }

    async fn find_by_id(
        &self,
        id: &ScheduledActionId,
    ) -> Result<Option<ScheduledAction>, RepositoryError> {
        let actions = self.actions.read().await;
        Ok(actions.iter().find(|action| &action.id == id).cloned())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        let actions = self.actions.read().await;
        let mut listed: Vec<ScheduledAction> = actions
            .iter()
            .filter(|action| &action.conversation_id == conversation_id)
            .filter(|action| status.map_or(true, |status| action.status == status))
            .cloned()
            .collect();
        listed.sort_by(|left, right| {
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryProspectRepository {
    prospects: RwLock<HashMap<String, Prospect>>,
}

#[async_trait::async_trait]
impl ProspectRepository for InMemoryProspectRepository {
    async fn find_by_id(&self, id: &ConversationId) -> Result<Option<Prospect>, RepositoryError> {
        let prospects = self.prospects.read().await;
        Ok(prospects.get(&id.0).cloned())
    }

    async fn save(&self, prospect: Prospect) -> Result<(), RepositoryError> {
        let mut prospects = self.prospects.write().await;
        prospects.insert(prospect.id.0.clone(), prospect);
        Ok(())
    }
}
