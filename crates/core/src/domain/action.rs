use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::prospect::ConversationId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledActionId(pub String);

impl std::fmt::Display for ScheduledActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FollowUp,
    Reminder,
    PreMeeting,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FollowUp => "follow_up",
            Self::Reminder => "reminder",
            Self::PreMeeting => "pre_meeting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "follow_up" => Some(Self::FollowUp),
            "reminder" => Some(Self::Reminder),
            "pre_meeting" => Some(Self::PreMeeting),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Processing,
    Executed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Executed => "executed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "executed" => Some(Self::Executed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Cancelled)
    }

    /// Transitions reachable through normal processing.
    ///
    /// `Processing -> Pending` is deliberately absent: only stale recovery may
    /// take that edge, see [`ActionStatus::can_recover_to`].
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Cancelled)
                | (Self::Processing, Self::Executed)
                | (Self::Processing, Self::Cancelled)
        )
    }

    pub fn can_recover_to(&self, next: ActionStatus) -> bool {
        matches!((self, next), (Self::Processing, Self::Pending))
    }
}

/// Action-specific data. The variant decides the [`ActionType`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    FollowUp {
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Reminder {
        meeting_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meeting_link: Option<String>,
    },
    PreMeeting {
        meeting_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meeting_link: Option<String>,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::FollowUp { .. } => ActionType::FollowUp,
            Self::Reminder { .. } => ActionType::Reminder,
            Self::PreMeeting { .. } => ActionType::PreMeeting,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: ScheduledActionId,
    pub conversation_id: ConversationId,
    pub action_type: ActionType,
    pub scheduled_for: DateTime<Utc>,
    pub status: ActionStatus,
    pub payload: ActionPayload,
    pub attempts: u32,
    pub started_processing_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl ScheduledAction {
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_transition(ActionStatus::Processing)?;
        self.status = ActionStatus::Processing;
        self.started_processing_at = Some(now);
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_executed(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_transition(ActionStatus::Executed)?;
        self.status = ActionStatus::Executed;
        self.executed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_cancelled(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_transition(ActionStatus::Cancelled)?;
        self.status = ActionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancel_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    pub fn recover(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.status.can_recover_to(ActionStatus::Pending) {
            return Err(DomainError::InvalidActionTransition {
                from: self.status,
                to: ActionStatus::Pending,
            });
        }
        self.status = ActionStatus::Pending;
        self.started_processing_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_due(&self, horizon: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Pending && self.scheduled_for <= horizon
    }

    pub fn is_stale(&self, threshold: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Processing
            && self.started_processing_at.is_some_and(|started| started <= threshold)
    }

    fn ensure_transition(&self, next: ActionStatus) -> Result<(), DomainError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidActionTransition { from: self.status, to: next })
        }
    }
}
