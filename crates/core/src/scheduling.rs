//! Validation for scheduling requests before they reach a store.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use uuid::Uuid;

use crate::domain::action::{ActionPayload, ActionType, ScheduledActionId};
use crate::domain::prospect::ConversationId;
use crate::errors::ValidationError;

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 9999;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewScheduledAction {
    pub conversation_id: ConversationId,
    pub scheduled_for: DateTime<Utc>,
    pub payload: ActionPayload,
}

impl NewScheduledAction {
    pub fn new(
        conversation_id: ConversationId,
        scheduled_for: DateTime<Utc>,
        payload: ActionPayload,
    ) -> Self {
        Self { conversation_id, scheduled_for, payload }
    }

    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    /// Checks the request and returns the payload encoded for storage.
    pub fn validate(&self) -> Result<ValidatedAction, ValidationError> {
        if self.conversation_id.0.trim().is_empty() {
            return Err(ValidationError::EmptyConversationId);
        }
        ensure_storable(self.scheduled_for)?;

        let payload_json = serde_json::to_string(&self.payload)
            .map_err(|error| ValidationError::Payload(error.to_string()))?;

        Ok(ValidatedAction {
            id: ScheduledActionId(Uuid::new_v4().to_string()),
            conversation_id: self.conversation_id.clone(),
            action_type: self.action_type(),
            scheduled_for: self.scheduled_for,
            payload: self.payload.clone(),
            payload_json,
        })
    }
}

/// A request that passed validation, with a freshly minted id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedAction {
    pub id: ScheduledActionId,
    pub conversation_id: ConversationId,
    pub action_type: ActionType,
    pub scheduled_for: DateTime<Utc>,
    pub payload: ActionPayload,
    pub payload_json: String,
}

/// Parses an RFC 3339 timestamp that carries an explicit offset and
/// normalizes it to UTC. Naive timestamps are rejected.
pub fn parse_scheduled_for(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|_| ValidationError::NotUtc(raw.to_string()))?;
    let utc = parsed.with_timezone(&Utc);
    ensure_storable(utc)?;
    Ok(utc)
}

pub fn ensure_storable(at: DateTime<Utc>) -> Result<(), ValidationError> {
    if (MIN_YEAR..=MAX_YEAR).contains(&at.year()) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange(at.to_string()))
    }
}

/// Fixed-width storage encoding; lexical order equals chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
