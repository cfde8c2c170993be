pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pacer",
    about = "Pacer operator CLI",
    long_about = "Operate the pacer action store: migrations, config inspection, stale recovery, and scheduled action maintenance.",
    after_help = "Examples:\n  pacer migrate\n  pacer config\n  pacer actions list conv-42 --status pending\n  pacer recover"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Return actions stuck in processing past the stale threshold to pending")]
    Recover {
        #[arg(long, help = "Override scheduler.stale_after_seconds for this run")]
        stale_after_seconds: Option<u64>,
    },
    #[command(subcommand, about = "List or cancel scheduled actions")]
    Actions(ActionsCommand),
}

#[derive(Debug, Subcommand)]
enum ActionsCommand {
    #[command(about = "List the scheduled actions of one conversation")]
    List {
        conversation_id: String,
        #[arg(long, help = "Only show actions in this status (pending|processing|executed|cancelled)")]
        status: Option<String>,
    },
    #[command(about = "Cancel one pending or processing action")]
    Cancel {
        action_id: String,
        #[arg(long, default_value = "operator_cancelled")]
        reason: String,
    },
    #[command(about = "Cancel every pending or processing action of a conversation")]
    CancelConversation {
        conversation_id: String,
        #[arg(long, default_value = "operator_cancelled")]
        reason: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Recover { stale_after_seconds } => commands::recover::run(stale_after_seconds),
        Command::Actions(ActionsCommand::List { conversation_id, status }) => {
            commands::actions::list(&conversation_id, status.as_deref())
        }
        Command::Actions(ActionsCommand::Cancel { action_id, reason }) => {
            commands::actions::cancel(&action_id, &reason)
        }
        Command::Actions(ActionsCommand::CancelConversation { conversation_id, reason }) => {
            commands::actions::cancel_conversation(&conversation_id, &reason)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
