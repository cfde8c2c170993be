use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use pacer_core::config::{AppConfig, DelayRange, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let timing = &config.timing;

    let fields: Vec<(&str, String, Option<&str>)> = vec![
        ("database.url", config.database.url.clone(), Some("PACER_DATABASE_URL")),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("PACER_DATABASE_MAX_CONNECTIONS"),
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            Some("PACER_DATABASE_TIMEOUT_SECS"),
        ),
        ("llm.provider", config.llm.provider.as_str().to_string(), Some("PACER_LLM_PROVIDER")),
        ("llm.model", config.llm.model.clone(), Some("PACER_LLM_MODEL")),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("PACER_LLM_BASE_URL"),
        ),
        ("llm.api_key", llm_api_key.to_string(), Some("PACER_LLM_API_KEY")),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), Some("PACER_LLM_TIMEOUT_SECS")),
        ("server.bind_address", config.server.bind_address.clone(), Some("PACER_SERVER_BIND_ADDRESS")),
        ("server.port", config.server.port.to_string(), Some("PACER_SERVER_PORT")),
        ("logging.level", config.logging.level.clone(), Some("PACER_LOGGING_LEVEL")),
        ("logging.format", format!("{:?}", config.logging.format), Some("PACER_LOGGING_FORMAT")),
        (
            "scheduler.poll_interval_seconds",
            config.scheduler.poll_interval_seconds.to_string(),
            Some("PACER_SCHEDULER_POLL_INTERVAL_SECONDS"),
        ),
        (
            "scheduler.batch_size",
            config.scheduler.batch_size.to_string(),
            Some("PACER_SCHEDULER_BATCH_SIZE"),
        ),
        (
            "scheduler.preemptive_window_seconds",
            config.scheduler.preemptive_window_seconds.to_string(),
            Some("PACER_SCHEDULER_PREEMPTIVE_WINDOW_SECONDS"),
        ),
        (
            "scheduler.stale_after_seconds",
            config.scheduler.stale_after_seconds.to_string(),
            Some("PACER_SCHEDULER_STALE_AFTER_SECONDS"),
        ),
        ("scheduler.max_attempts", config.scheduler.max_attempts.to_string(), None),
        (
            "buffer.quiet_window_ms",
            config.buffer.quiet_window_ms.to_string(),
            Some("PACER_BUFFER_QUIET_WINDOW_MS"),
        ),
        (
            "buffer.burst_ceiling",
            config.buffer.burst_ceiling.to_string(),
            Some("PACER_BUFFER_BURST_CEILING"),
        ),
        ("timing.mode", timing.mode.as_str().to_string(), Some("PACER_TIMING_MODE")),
        ("timing.quick_ack", render_range(timing.quick_ack), None),
        ("timing.normal", render_range(timing.normal), None),
        ("timing.thoughtful", render_range(timing.thoughtful), None),
        ("timing.long_read", render_range(timing.long_read), None),
        (
            "conversation.follow_up_after_hours",
            config.conversation.follow_up_after_hours.to_string(),
            None,
        ),
        ("conversation.max_follow_ups", config.conversation.max_follow_ups.to_string(), None),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in fields {
        lines.push(render_line(
            key,
            &value,
            field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref()),
        ));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["pacer.toml", "config/pacer.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn render_range(range: DelayRange) -> String {
    format!("{}s..{}s", range.base_secs, range.max_secs)
}
