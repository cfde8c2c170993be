use chrono::Utc;
use pacer_core::config::LoadOptions;
use pacer_core::domain::action::{ActionStatus, ScheduledAction, ScheduledActionId};
use pacer_core::domain::prospect::ConversationId;
use pacer_core::scheduling::format_timestamp;
use pacer_db::{RepositoryError, ScheduledActionStore, SqlScheduledActionStore};
use serde_json::{json, Value};

use crate::commands::{with_pool, CommandResult};

pub fn list(conversation_id: &str, status: Option<&str>) -> CommandResult {
    let command = "actions.list";
    let status = match status.map(|raw| (raw, ActionStatus::parse(raw))) {
        None => None,
        Some((_, Some(status))) => Some(status),
        Some((raw, None)) => {
            return CommandResult::failure(
                command,
                "invalid_input",
                format!("unknown status `{raw}` (expected pending|processing|executed|cancelled)"),
                2,
            );
        }
    };
    let conversation_id = ConversationId(conversation_id.trim().to_string());

    let result = with_pool(command, LoadOptions::default(), |_config, pool| async move {
        SqlScheduledActionStore::new(pool)
            .list_for_conversation(&conversation_id, status)
            .await
            .map_err(|error| CommandResult::failure(command, "store", error.to_string(), 6))
    });

    match result {
        Ok(actions) => CommandResult::success_with_data(
            command,
            format!("{} action(s)", actions.len()),
            Some(Value::Array(actions.iter().map(action_json).collect())),
        ),
        Err(failure) => failure,
    }
}

pub fn cancel(action_id: &str, reason: &str) -> CommandResult {
    let command = "actions.cancel";
    let id = ScheduledActionId(action_id.trim().to_string());

    let result = with_pool(command, LoadOptions::default(), |_config, pool| async move {
        let store = SqlScheduledActionStore::new(pool);
        let store_failure = |error: RepositoryError| {
            CommandResult::failure(command, "store", error.to_string(), 6)
        };

        if store.mark_cancelled(&id, reason, Utc::now()).await.map_err(store_failure)? {
            return Ok(());
        }
        match store.find_by_id(&id).await.map_err(store_failure)? {
            None => Err(CommandResult::failure(
                command,
                "not_found",
                format!("no scheduled action with id `{id}`"),
                7,
            )),
            Some(action) => Err(CommandResult::failure(
                command,
                "not_cancellable",
                format!("action `{id}` is already {}", action.status.as_str()),
                8,
            )),
        }
    });

    match result {
        Ok(()) => CommandResult::success(command, format!("cancelled action {action_id}")),
        Err(failure) => failure,
    }
}

pub fn cancel_conversation(conversation_id: &str, reason: &str) -> CommandResult {
    let command = "actions.cancel_conversation";
    let conversation = ConversationId(conversation_id.trim().to_string());

    let result = with_pool(command, LoadOptions::default(), |_config, pool| async move {
        SqlScheduledActionStore::new(pool)
            .cancel_pending(&conversation, reason, Utc::now())
            .await
            .map_err(|error| CommandResult::failure(command, "store", error.to_string(), 6))
    });

    match result {
        Ok(count) => CommandResult::success_with_data(
            command,
            format!("cancelled {count} action(s) for conversation {conversation_id}"),
            Some(json!({ "cancelled": count })),
        ),
        Err(failure) => failure,
    }
}

fn action_json(action: &ScheduledAction) -> Value {
    json!({
        "id": action.id.0,
        "action_type": action.action_type.as_str(),
        "status": action.status.as_str(),
        "scheduled_for": format_timestamp(action.scheduled_for),
        "attempts": action.attempts,
        "cancel_reason": action.cancel_reason,
    })
}
