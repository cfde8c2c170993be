use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use pacer_core::domain::action::{
    ActionPayload, ActionStatus, ActionType, ScheduledAction, ScheduledActionId,
};
use pacer_core::domain::prospect::ConversationId;
use pacer_core::scheduling::{format_timestamp, NewScheduledAction};

use super::{RepositoryError, ScheduledActionStore};
use crate::DbPool;

const ACTION_COLUMNS: &str = "id,
    conversation_id,
    action_type,
    scheduled_for,
    status,
    payload_json,
    attempts,
    started_processing_at,
    created_at,
    updated_at,
    executed_at,
    cancelled_at,
    cancel_reason";

pub struct SqlScheduledActionStore {
    pool: DbPool,
}

impl SqlScheduledActionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScheduledActionStore for SqlScheduledActionStore {
    async fn create(
        &self,
        request: NewScheduledAction,
        now: DateTime<Utc>,
    ) -> Result<ScheduledActionId, RepositoryError> {
        let validated = request.validate()?;
        let now = format_timestamp(now);

        sqlx::query(
            "INSERT INTO scheduled_action (
                id,
                conversation_id,
                action_type,
                scheduled_for,
                status,
                payload_json,
                attempts,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, 'pending', ?, 0, ?, ?)",
        )
        .bind(&validated.id.0)
        .bind(&validated.conversation_id.0)
        .bind(validated.action_type.as_str())
        .bind(format_timestamp(validated.scheduled_for))
        .bind(&validated.payload_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(validated.id)
    }

    async fn cancel_pending(
        &self,
        conversation_id: &ConversationId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let now = format_timestamp(now);
        let result = sqlx::query(
            "UPDATE scheduled_action
             SET status = 'cancelled', cancelled_at = ?, cancel_reason = ?, updated_at = ?
             WHERE conversation_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(&now)
        .bind(reason)
        .bind(&now)
        .bind(&conversation_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_due(
        &self,
        limit: u32,
        due_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = format_timestamp(now);
        // One statement holds the write lock from selection to update, so a
        // row can only ever be observed as pending by a single claimer.
        let sql = format!(
            "UPDATE scheduled_action
             SET status = 'processing',
                 started_processing_at = ?,
                 updated_at = ?,
                 attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM scheduled_action
                 WHERE status = 'pending' AND scheduled_for <= ?
                 ORDER BY scheduled_for ASC, created_at ASC
                 LIMIT ?
             ) AND status = 'pending'
             RETURNING {ACTION_COLUMNS}"
        );

        let rows = sqlx::query(&sql)
            .bind(&now)
            .bind(&now)
            .bind(format_timestamp(due_by))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = rows.into_iter().map(action_from_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|left, right| {
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(claimed)
    }

    async fn mark_executed(
        &self,
        id: &ScheduledActionId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now = format_timestamp(now);
        let result = sqlx::query(
            "UPDATE scheduled_action
             SET status = 'executed', executed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(&now)
        .bind(&now)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_cancelled(
        &self,
        id: &ScheduledActionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now = format_timestamp(now);
        let result = sqlx::query(
            "UPDATE scheduled_action
             SET status = 'cancelled', cancelled_at = ?, cancel_reason = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'processing')",
        )
        .bind(&now)
        .bind(reason)
        .bind(&now)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_stale_processing(
        &self,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledActionId>, RepositoryError> {
        let threshold = format_timestamp(now - stale_after);
        let rows = sqlx::query(
            "UPDATE scheduled_action
             SET status = 'pending', started_processing_at = NULL, updated_at = ?
             WHERE status = 'processing' AND started_processing_at <= ?
             RETURNING id",
        )
        .bind(format_timestamp(now))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(ScheduledActionId(row.try_get("id")?)))
            .collect()
    }

    async fn find_by_id(
        &self,
        id: &ScheduledActionId,
    ) -> Result<Option<ScheduledAction>, RepositoryError> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM scheduled_action WHERE id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;

        row.map(action_from_row).transpose()
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
        status: Option<ActionStatus>,
    ) -> Result<Vec<ScheduledAction>, RepositoryError> {
        let rows = if let Some(status) = status {
            let sql = format!(
                "SELECT {ACTION_COLUMNS} FROM scheduled_action
                 WHERE conversation_id = ? AND status = ?
                 ORDER BY scheduled_for ASC, created_at ASC"
            );
            sqlx::query(&sql)
                .bind(&conversation_id.0)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!(
                "SELECT {ACTION_COLUMNS} FROM scheduled_action
                 WHERE conversation_id = ?
                 ORDER BY scheduled_for ASC, created_at ASC"
            );
            sqlx::query(&sql).bind(&conversation_id.0).fetch_all(&self.pool).await?
        };

        rows.into_iter().map(action_from_row).collect()
    }
}

fn action_from_row(row: SqliteRow) -> Result<ScheduledAction, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ActionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action status `{status_raw}`")))?;

    let type_raw = row.try_get::<String, _>("action_type")?;
    let action_type = ActionType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action type `{type_raw}`")))?;

    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let payload: ActionPayload = serde_json::from_str(&payload_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid payload_json `{payload_raw}` ({error})"))
    })?;
    if payload.action_type() != action_type {
        return Err(RepositoryError::Decode(format!(
            "payload type `{}` does not match action_type `{}`",
            payload.action_type().as_str(),
            action_type.as_str()
        )));
    }

    Ok(ScheduledAction {
        id: ScheduledActionId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        action_type,
        scheduled_for: parse_timestamp("scheduled_for", row.try_get("scheduled_for")?)?,
        status,
        payload,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        started_processing_at: parse_optional_timestamp(
            "started_processing_at",
            row.try_get("started_processing_at")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        executed_at: parse_optional_timestamp("executed_at", row.try_get("executed_at")?)?,
        cancelled_at: parse_optional_timestamp("cancelled_at", row.try_get("cancelled_at")?)?,
        cancel_reason: row.try_get("cancel_reason")?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(super) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(super) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
