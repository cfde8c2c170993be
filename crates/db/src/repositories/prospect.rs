use sqlx::{sqlite::SqliteRow, Row};

use pacer_core::domain::prospect::{ConversationId, Prospect, ProspectStatus};
use pacer_core::scheduling::format_timestamp;

use super::scheduled_action::{parse_optional_timestamp, parse_timestamp};
use super::{ProspectRepository, RepositoryError};
use crate::DbPool;

pub struct SqlProspectRepository {
    pool: DbPool,
}

impl SqlProspectRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProspectRepository for SqlProspectRepository {
    async fn find_by_id(&self, id: &ConversationId) -> Result<Option<Prospect>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                display_name,
                recipient,
                status,
                last_inbound_at,
                last_outbound_at,
                meeting_at,
                created_at,
                updated_at
             FROM prospect
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(prospect_from_row).transpose()
    }

    async fn save(&self, prospect: Prospect) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO prospect (
                id,
                display_name,
                recipient,
                status,
                last_inbound_at,
                last_outbound_at,
                meeting_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                recipient = excluded.recipient,
                status = excluded.status,
                last_inbound_at = excluded.last_inbound_at,
                last_outbound_at = excluded.last_outbound_at,
                meeting_at = excluded.meeting_at,
                updated_at = excluded.updated_at",
        )
        .bind(&prospect.id.0)
        .bind(&prospect.display_name)
        .bind(&prospect.recipient)
        .bind(prospect.status.as_str())
        .bind(prospect.last_inbound_at.map(format_timestamp))
        .bind(prospect.last_outbound_at.map(format_timestamp))
        .bind(prospect.meeting_at.map(format_timestamp))
        .bind(format_timestamp(prospect.created_at))
        .bind(format_timestamp(prospect.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn prospect_from_row(row: SqliteRow) -> Result<Prospect, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ProspectStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown prospect status `{status_raw}`"))
    })?;

    Ok(Prospect {
        id: ConversationId(row.try_get("id")?),
        display_name: row.try_get("display_name")?,
        recipient: row.try_get("recipient")?,
        status,
        last_inbound_at: parse_optional_timestamp("last_inbound_at", row.try_get("last_inbound_at")?)?,
        last_outbound_at: parse_optional_timestamp(
            "last_outbound_at",
            row.try_get("last_outbound_at")?,
        )?,
        meeting_at: parse_optional_timestamp("meeting_at", row.try_get("meeting_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
