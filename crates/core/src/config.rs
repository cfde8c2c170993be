use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timing::DelayMode;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub buffer: BufferConfig,
    pub timing: TimingConfig,
    pub conversation: ConversationConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub poll_interval_seconds: u64,
    pub batch_size: u32,
    pub preemptive_window_seconds: u64,
    pub stale_after_seconds: u64,
    /// Claims allowed before a repeatedly failing action is cancelled.
    pub max_attempts: u32,
    /// Run stale recovery on every n-th poll (startup always runs it).
    pub stale_sweep_every: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferConfig {
    pub quiet_window_ms: u64,
    pub burst_ceiling: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub base_secs: f64,
    pub max_secs: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimingConfig {
    pub mode: DelayMode,
    pub quick_ack: DelayRange,
    pub normal: DelayRange,
    pub thoughtful: DelayRange,
    pub long_read: DelayRange,
    pub long_read_chars: usize,
    pub quick_ack_chars: usize,
    pub thoughtful_chars: usize,
    pub typing_chars_per_second: f64,
    pub typing_max_secs: f64,
    pub distraction_probability: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationConfig {
    pub follow_up_after_hours: u64,
    pub max_follow_ups: u32,
    pub reminder_lead_hours: u64,
    pub pre_meeting_lead_minutes: u64,
    pub history_turns: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
    Echo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub poll_interval_seconds: Option<u64>,
    pub stale_after_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://pacer.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                system_prompt: None,
                timeout_secs: 30,
                max_retries: 2,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            scheduler: SchedulerConfig::default(),
            buffer: BufferConfig::default(),
            timing: TimingConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            batch_size: 10,
            preemptive_window_seconds: 5,
            stale_after_seconds: 600,
            max_attempts: 5,
            stale_sweep_every: 10,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { quiet_window_ms: 3_000, burst_ceiling: 8 }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            mode: DelayMode::Natural,
            quick_ack: DelayRange { base_secs: 2.0, max_secs: 10.0 },
            normal: DelayRange { base_secs: 5.0, max_secs: 30.0 },
            thoughtful: DelayRange { base_secs: 12.0, max_secs: 60.0 },
            long_read: DelayRange { base_secs: 20.0, max_secs: 90.0 },
            long_read_chars: 400,
            quick_ack_chars: 40,
            thoughtful_chars: 280,
            typing_chars_per_second: 6.0,
            typing_max_secs: 12.0,
            distraction_probability: 0.1,
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            follow_up_after_hours: 24,
            max_follow_ups: 3,
            reminder_lead_hours: 24,
            pre_meeting_lead_minutes: 15,
            history_turns: 20,
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::Echo => "echo",
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "echo" => Ok(Self::Echo),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama|echo)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pacer.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(system_prompt) = llm.system_prompt {
                self.llm.system_prompt = Some(system_prompt);
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            let target = &mut self.scheduler;
            if let Some(value) = scheduler.poll_interval_seconds {
                target.poll_interval_seconds = value;
            }
            if let Some(value) = scheduler.batch_size {
                target.batch_size = value;
            }
            if let Some(value) = scheduler.preemptive_window_seconds {
                target.preemptive_window_seconds = value;
            }
            if let Some(value) = scheduler.stale_after_seconds {
                target.stale_after_seconds = value;
            }
            if let Some(value) = scheduler.max_attempts {
                target.max_attempts = value;
            }
            if let Some(value) = scheduler.stale_sweep_every {
                target.stale_sweep_every = value;
            }
            if let Some(value) = scheduler.base_backoff_ms {
                target.base_backoff_ms = value;
            }
            if let Some(value) = scheduler.max_backoff_ms {
                target.max_backoff_ms = value;
            }
        }

        if let Some(buffer) = patch.buffer {
            if let Some(value) = buffer.quiet_window_ms {
                self.buffer.quiet_window_ms = value;
            }
            if let Some(value) = buffer.burst_ceiling {
                self.buffer.burst_ceiling = value;
            }
        }

        if let Some(timing) = patch.timing {
            let target = &mut self.timing;
            if let Some(value) = timing.mode {
                target.mode = value;
            }
            if let Some(value) = timing.quick_ack {
                target.quick_ack = value;
            }
            if let Some(value) = timing.normal {
                target.normal = value;
            }
            if let Some(value) = timing.thoughtful {
                target.thoughtful = value;
            }
            if let Some(value) = timing.long_read {
                target.long_read = value;
            }
            if let Some(value) = timing.long_read_chars {
                target.long_read_chars = value;
            }
            if let Some(value) = timing.quick_ack_chars {
                target.quick_ack_chars = value;
            }
            if let Some(value) = timing.thoughtful_chars {
                target.thoughtful_chars = value;
            }
            if let Some(value) = timing.typing_chars_per_second {
                target.typing_chars_per_second = value;
            }
            if let Some(value) = timing.typing_max_secs {
                target.typing_max_secs = value;
            }
            if let Some(value) = timing.distraction_probability {
                target.distraction_probability = value;
            }
        }

        if let Some(conversation) = patch.conversation {
            let target = &mut self.conversation;
            if let Some(value) = conversation.follow_up_after_hours {
                target.follow_up_after_hours = value;
            }
            if let Some(value) = conversation.max_follow_ups {
                target.max_follow_ups = value;
            }
            if let Some(value) = conversation.reminder_lead_hours {
                target.reminder_lead_hours = value;
            }
            if let Some(value) = conversation.pre_meeting_lead_minutes {
                target.pre_meeting_lead_minutes = value;
            }
            if let Some(value) = conversation.history_turns {
                target.history_turns = value;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PACER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PACER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PACER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PACER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PACER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PACER_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("PACER_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PACER_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("PACER_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PACER_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("PACER_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PACER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PACER_SERVER_PORT") {
            self.server.port = parse_u16("PACER_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("PACER_SCHEDULER_POLL_INTERVAL_SECONDS") {
            self.scheduler.poll_interval_seconds =
                parse_u64("PACER_SCHEDULER_POLL_INTERVAL_SECONDS", &value)?;
        }
        if let Some(value) = read_env("PACER_SCHEDULER_BATCH_SIZE") {
            self.scheduler.batch_size = parse_u32("PACER_SCHEDULER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("PACER_SCHEDULER_PREEMPTIVE_WINDOW_SECONDS") {
            self.scheduler.preemptive_window_seconds =
                parse_u64("PACER_SCHEDULER_PREEMPTIVE_WINDOW_SECONDS", &value)?;
        }
        if let Some(value) = read_env("PACER_SCHEDULER_STALE_AFTER_SECONDS") {
            self.scheduler.stale_after_seconds =
                parse_u64("PACER_SCHEDULER_STALE_AFTER_SECONDS", &value)?;
        }

        if let Some(value) = read_env("PACER_BUFFER_QUIET_WINDOW_MS") {
            self.buffer.quiet_window_ms = parse_u64("PACER_BUFFER_QUIET_WINDOW_MS", &value)?;
        }
        if let Some(value) = read_env("PACER_BUFFER_BURST_CEILING") {
            self.buffer.burst_ceiling = parse_u32("PACER_BUFFER_BURST_CEILING", &value)? as usize;
        }

        if let Some(value) = read_env("PACER_TIMING_MODE") {
            self.timing.mode = value.parse().map_err(ConfigError::Validation)?;
        }

        let log_level = read_env("PACER_LOGGING_LEVEL").or_else(|| read_env("PACER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PACER_LOGGING_FORMAT").or_else(|| read_env("PACER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(poll_interval_seconds) = overrides.poll_interval_seconds {
            self.scheduler.poll_interval_seconds = poll_interval_seconds;
        }
        if let Some(stale_after_seconds) = overrides.stale_after_seconds {
            self.scheduler.stale_after_seconds = stale_after_seconds;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_scheduler(&self.scheduler)?;
        validate_buffer(&self.buffer)?;
        validate_timing(&self.timing)?;
        validate_conversation(&self.conversation)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pacer.toml"), PathBuf::from("config/pacer.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
        LlmProvider::Echo => {}
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.poll_interval_seconds == 0 {
        return Err(ConfigError::Validation(
            "scheduler.poll_interval_seconds must be greater than zero".to_string(),
        ));
    }
    if scheduler.batch_size == 0 {
        return Err(ConfigError::Validation(
            "scheduler.batch_size must be greater than zero".to_string(),
        ));
    }
    if scheduler.stale_after_seconds <= scheduler.poll_interval_seconds {
        return Err(ConfigError::Validation(
            "scheduler.stale_after_seconds must exceed scheduler.poll_interval_seconds, otherwise in-flight actions are recovered while still executing".to_string(),
        ));
    }
    if scheduler.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "scheduler.max_attempts must be greater than zero".to_string(),
        ));
    }
    if scheduler.stale_sweep_every == 0 {
        return Err(ConfigError::Validation(
            "scheduler.stale_sweep_every must be greater than zero".to_string(),
        ));
    }
    if scheduler.base_backoff_ms > scheduler.max_backoff_ms {
        return Err(ConfigError::Validation(
            "scheduler.base_backoff_ms must not exceed scheduler.max_backoff_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_buffer(buffer: &BufferConfig) -> Result<(), ConfigError> {
    if buffer.quiet_window_ms == 0 {
        return Err(ConfigError::Validation(
            "buffer.quiet_window_ms must be greater than zero".to_string(),
        ));
    }
    if buffer.burst_ceiling == 0 {
        return Err(ConfigError::Validation(
            "buffer.burst_ceiling must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_timing(timing: &TimingConfig) -> Result<(), ConfigError> {
    let profiles = [
        ("quick_ack", timing.quick_ack),
        ("normal", timing.normal),
        ("thoughtful", timing.thoughtful),
        ("long_read", timing.long_read),
    ];
    for (name, range) in profiles {
        if !range.base_secs.is_finite() || range.base_secs < 1.0 {
            return Err(ConfigError::Validation(format!(
                "timing.{name}.base_secs must be at least 1.0"
            )));
        }
        if !range.max_secs.is_finite() || range.max_secs < range.base_secs {
            return Err(ConfigError::Validation(format!(
                "timing.{name}.max_secs must be at least timing.{name}.base_secs"
            )));
        }
    }

    if timing.quick_ack_chars >= timing.thoughtful_chars {
        return Err(ConfigError::Validation(
            "timing.quick_ack_chars must be smaller than timing.thoughtful_chars".to_string(),
        ));
    }
    if !(timing.typing_chars_per_second > 0.0) {
        return Err(ConfigError::Validation(
            "timing.typing_chars_per_second must be positive".to_string(),
        ));
    }
    if !timing.typing_max_secs.is_finite() || timing.typing_max_secs < 1.0 {
        return Err(ConfigError::Validation(
            "timing.typing_max_secs must be at least 1.0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&timing.distraction_probability) {
        return Err(ConfigError::Validation(
            "timing.distraction_probability must be in range 0.0..=1.0".to_string(),
        ));
    }
    Ok(())
}

fn validate_conversation(conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if conversation.follow_up_after_hours == 0 {
        return Err(ConfigError::Validation(
            "conversation.follow_up_after_hours must be greater than zero".to_string(),
        ));
    }
    if conversation.history_turns == 0 {
        return Err(ConfigError::Validation(
            "conversation.history_turns must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    scheduler: Option<SchedulerPatch>,
    buffer: Option<BufferPatch>,
    timing: Option<TimingPatch>,
    conversation: Option<ConversationPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    poll_interval_seconds: Option<u64>,
    batch_size: Option<u32>,
    preemptive_window_seconds: Option<u64>,
    stale_after_seconds: Option<u64>,
    max_attempts: Option<u32>,
    stale_sweep_every: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BufferPatch {
    quiet_window_ms: Option<u64>,
    burst_ceiling: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct TimingPatch {
    mode: Option<DelayMode>,
    quick_ack: Option<DelayRange>,
    normal: Option<DelayRange>,
    thoughtful: Option<DelayRange>,
    long_read: Option<DelayRange>,
    long_read_chars: Option<usize>,
    quick_ack_chars: Option<usize>,
    thoughtful_chars: Option<usize>,
    typing_chars_per_second: Option<f64>,
    typing_max_secs: Option<f64>,
    distraction_probability: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationPatch {
    follow_up_after_hours: Option<u64>,
    max_follow_ups: Option<u32>,
    reminder_lead_hours: Option<u64>,
    pre_meeting_lead_minutes: Option<u64>,
    history_turns: Option<usize>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
    use crate::timing::DelayMode;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_and_match_documented_thresholds() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.buffer.quiet_window_ms == 3_000, "quiet window default should be 3s")?;
        ensure(config.buffer.burst_ceiling == 8, "burst ceiling default should be 8")?;
        ensure(config.scheduler.stale_after_seconds == 600, "stale default should be 10m")?;
        ensure(config.scheduler.poll_interval_seconds == 30, "poll default should be 30s")?;
        ensure(matches!(config.timing.mode, DelayMode::Natural), "natural mode by default")
    }

    #[test]
    fn file_load_supports_env_interpolation_and_nested_sections() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PACER_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("pacer.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "open_ai"
api_key = "${TEST_PACER_LLM_KEY}"
model = "gpt-4o-mini"

[scheduler]
poll_interval_seconds = 5
batch_size = 25

[buffer]
quiet_window_ms = 1500

[timing]
mode = "variable"
normal = { base_secs = 4.0, max_secs = 20.0 }
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            ensure(config.scheduler.poll_interval_seconds == 5, "poll interval from file")?;
            ensure(config.scheduler.batch_size == 25, "batch size from file")?;
            ensure(config.buffer.quiet_window_ms == 1_500, "quiet window from file")?;
            ensure(matches!(config.timing.mode, DelayMode::Variable), "mode from file")?;
            ensure(config.timing.normal.base_secs == 4.0, "normal profile from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_PACER_LLM_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PACER_LOG_LEVEL", "warn");
        env::set_var("PACER_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["PACER_LOG_LEVEL", "PACER_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PACER_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("PACER_SCHEDULER_BATCH_SIZE", "7");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("pacer.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[scheduler]
batch_size = 3
stale_after_seconds = 900

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.scheduler.batch_size == 7, "env batch size should win over file")?;
            ensure(config.scheduler.stale_after_seconds == 900, "file value should beat default")?;
            Ok(())
        })();

        clear_vars(&["PACER_DATABASE_URL", "PACER_SCHEDULER_BATCH_SIZE"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PACER_SCHEDULER_POLL_INTERVAL_SECONDS", "900");
        env::set_var("PACER_SCHEDULER_STALE_AFTER_SECONDS", "600");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("scheduler.stale_after_seconds")
            );
            ensure(has_message, "validation failure should mention scheduler.stale_after_seconds")
        })();

        clear_vars(&[
            "PACER_SCHEDULER_POLL_INTERVAL_SECONDS",
            "PACER_SCHEDULER_STALE_AFTER_SECONDS",
        ]);
        result
    }

    #[test]
    fn invalid_env_override_is_reported_with_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PACER_BUFFER_QUIET_WINDOW_MS", "soon");

        let result = (|| -> Result<(), String> {
            let error = AppConfig::load(LoadOptions::default())
                .err()
                .ok_or_else(|| "expected invalid override error".to_string())?;
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. } if key == "PACER_BUFFER_QUIET_WINDOW_MS"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["PACER_BUFFER_QUIET_WINDOW_MS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_provider: Some(LlmProvider::Anthropic),
                llm_api_key: Some("sk-ant-secret-value".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;
        let debug = format!("{config:?}");

        ensure(!debug.contains("sk-ant-secret-value"), "debug output should not contain api key")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }
}
