use crate::commands::{with_pool, CommandResult};
use pacer_core::config::LoadOptions;
use pacer_db::migrations;

pub fn run() -> CommandResult {
    let result = with_pool("migrate", LoadOptions::default(), |_config, pool| async move {
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandResult::failure("migrate", "migration", error.to_string(), 5))
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(failure) => failure,
    }
}
