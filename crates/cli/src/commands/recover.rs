use chrono::{Duration, Utc};
use pacer_core::config::{ConfigOverrides, LoadOptions};
use pacer_db::{ScheduledActionStore, SqlScheduledActionStore};
use serde_json::json;

use crate::commands::{with_pool, CommandResult};

const MAX_STALE_AFTER_SECS: u64 = 100 * 365 * 24 * 60 * 60;

pub fn run(stale_after_seconds: Option<u64>) -> CommandResult {
    let options = LoadOptions {
        overrides: ConfigOverrides { stale_after_seconds, ..ConfigOverrides::default() },
        ..LoadOptions::default()
    };

    let result = with_pool("recover", options, |config, pool| async move {
        let stale_after = config.scheduler.stale_after_seconds;
        let store = SqlScheduledActionStore::new(pool);
        let threshold = Duration::seconds(stale_after.min(MAX_STALE_AFTER_SECS) as i64);
        let recovered =
            store.reset_stale_processing(threshold, Utc::now()).await.map_err(|error| {
                CommandResult::failure("recover", "store", error.to_string(), 6)
            })?;
        Ok((stale_after, recovered))
    });

    match result {
        Ok((stale_after, recovered)) => {
            let ids: Vec<&str> = recovered.iter().map(|id| id.0.as_str()).collect();
            CommandResult::success_with_data(
                "recover",
                format!(
                    "returned {} stale action(s) to pending (stale after {stale_after}s)",
                    recovered.len()
                ),
                Some(json!({ "recovered": ids })),
            )
        }
        Err(failure) => failure,
    }
}
