//! Configuration types.
//!
//! Settings come from a JSON file (`~/.relay-agent/config.json` by default)
//! with every field optional, then a small set of environment overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Default literal prefix that marks a store-poll message as a command.
pub const DEFAULT_TRIGGER: &str = "/c ";

/// Agent configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Handles (phone numbers / emails) whose store-poll messages are read.
    #[serde(alias = "allowed_phone", deserialize_with = "string_or_list")]
    pub allowed_handles: Vec<String>,
    /// Literal prefix required on the store-poll channel.
    pub trigger_prefix: String,
    pub poll_interval_secs: u64,
    pub max_response_length: usize,
    pub interpreter_timeout_secs: u64,
    pub shell_timeout_secs: u64,
    pub summary_timeout_secs: u64,
    /// Interpreter executable (looked up on `PATH`).
    pub interpreter_program: String,
    /// Capabilities granted to the interpreter on natural-language commands.
    pub allowed_tools: Vec<String>,
    pub max_image_size_mb: u64,
    pub max_file_size_mb: u64,
    #[serde(deserialize_with = "optional_secret")]
    pub telegram_bot_token: Option<SecretString>,
    /// Numeric bot-channel user ids allowed to issue commands. Empty denies all.
    pub allowed_telegram_ids: Vec<i64>,
    /// Maps a sender id (bare or channel-qualified) to a shared identity.
    pub sender_identity_map: HashMap<String, String>,
    pub data_dir: PathBuf,
    pub chat_db_path: PathBuf,
    /// Working directory for shell commands and the interpreter.
    pub workspace_dir: PathBuf,
    pub maintenance_interval_secs: u64,
    pub outbox_max_age_hours: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            allowed_handles: Vec::new(),
            trigger_prefix: DEFAULT_TRIGGER.to_string(),
            poll_interval_secs: 3,
            max_response_length: 4500,
            interpreter_timeout_secs: 300,
            shell_timeout_secs: 60,
            summary_timeout_secs: 60,
            interpreter_program: "claude".to_string(),
            allowed_tools: ["Bash", "Read", "Write", "Edit", "MultiEdit"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_image_size_mb: 20,
            max_file_size_mb: 100,
            telegram_bot_token: None,
            allowed_telegram_ids: Vec::new(),
            sender_identity_map: HashMap::new(),
            data_dir: home.join(".relay-agent"),
            chat_db_path: home.join("Library/Messages/chat.db"),
            workspace_dir: home,
            maintenance_interval_secs: 3600,
            outbox_max_age_hours: 24,
        }
    }
}

impl AgentConfig {
    /// Load the config file (if present), apply env overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            Self::from_json(&raw)?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Default config location, overridable with `RELAY_AGENT_CONFIG`.
    pub fn default_path() -> PathBuf {
        std::env::var("RELAY_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".relay-agent/config.json"))
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN")
            && !token.trim().is_empty()
        {
            self.telegram_bot_token = Some(SecretString::from(token.trim().to_string()));
        }
        if let Ok(handles) = std::env::var("RELAY_AGENT_ALLOWED_HANDLES") {
            self.allowed_handles = split_list(&handles);
        }
        if let Ok(trigger) = std::env::var("RELAY_AGENT_TRIGGER") {
            self.trigger_prefix = trigger;
        }
        if let Ok(dir) = std::env::var("RELAY_AGENT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(program) = std::env::var("RELAY_AGENT_INTERPRETER") {
            self.interpreter_program = program;
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_handles.is_empty() && self.telegram_bot_token.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "allowed_handles".into(),
                hint: "Set allowed_handles and/or telegram_bot_token to enable a channel".into(),
            });
        }
        if self.trigger_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "trigger_prefix".into(),
                message: "must not be blank".into(),
            });
        }
        for (key, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("interpreter_timeout_secs", self.interpreter_timeout_secs),
            ("shell_timeout_secs", self.shell_timeout_secs),
            ("summary_timeout_secs", self.summary_timeout_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    pub fn store_poll_enabled(&self) -> bool {
        !self.allowed_handles.is_empty()
    }

    pub fn bot_enabled(&self) -> bool {
        self.telegram_bot_token.is_some()
    }

    pub fn memory_db_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir.join("last_rowid.txt")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.data_dir.join("outbox")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn interpreter_timeout(&self) -> Duration {
        Duration::from_secs(self.interpreter_timeout_secs)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// `$HOME`, or the current directory when unset.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Accept either `"+1555..."` or `["+1555...", "me@icloud.com"]`.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => split_list(&s),
        OneOrMany::Many(list) => list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

fn optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.trigger_prefix, "/c ");
        assert_eq!(config.poll_interval_secs, 3);
        assert_eq!(config.max_response_length, 4500);
        assert_eq!(config.interpreter_timeout_secs, 300);
        assert_eq!(config.shell_timeout_secs, 60);
        assert_eq!(config.allowed_tools.len(), 5);
        assert!(config.telegram_bot_token.is_none());
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = AgentConfig::from_json(r#"{"allowed_handles": ["+15550001111"]}"#).unwrap();
        assert_eq!(config.allowed_handles, vec!["+15550001111"]);
        assert_eq!(config.trigger_prefix, DEFAULT_TRIGGER);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn accepts_legacy_single_string_handle() {
        let config =
            AgentConfig::from_json(r#"{"allowed_phone": "+15550001111, me@icloud.com"}"#).unwrap();
        assert_eq!(config.allowed_handles, vec!["+15550001111", "me@icloud.com"]);
    }

    #[test]
    fn reads_secret_token_and_identity_map() {
        let config = AgentConfig::from_json(
            r#"{
                "telegram_bot_token": "123:abc",
                "allowed_telegram_ids": [42],
                "sender_identity_map": {"42": "imessage:+15550001111"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.telegram_bot_token.as_ref().unwrap().expose_secret(),
            "123:abc"
        );
        assert_eq!(config.allowed_telegram_ids, vec![42]);
        assert_eq!(
            config.sender_identity_map.get("42").map(String::as_str),
            Some("imessage:+15550001111")
        );
        assert!(config.bot_enabled());
        assert!(!config.store_poll_enabled());
    }

    #[test]
    fn blank_token_is_treated_as_missing() {
        let config = AgentConfig::from_json(r#"{"telegram_bot_token": "  "}"#).unwrap();
        assert!(config.telegram_bot_token.is_none());
    }

    #[test]
    fn validate_requires_a_channel() {
        let err = AgentConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn validate_rejects_blank_trigger_and_zero_timeouts() {
        let mut config = AgentConfig::from_json(r#"{"allowed_handles": ["a"]}"#).unwrap();
        config.trigger_prefix = "  ".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        config.trigger_prefix = "/c ".into();
        config.shell_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            AgentConfig::from_json("{not json"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let mut config = AgentConfig::default();
        config.data_dir = PathBuf::from("/tmp/relay");
        assert_eq!(config.memory_db_path(), PathBuf::from("/tmp/relay/memory.db"));
        assert_eq!(config.cursor_path(), PathBuf::from("/tmp/relay/last_rowid.txt"));
        assert_eq!(config.inbox_dir(), PathBuf::from("/tmp/relay/inbox"));
        assert_eq!(config.outbox_dir(), PathBuf::from("/tmp/relay/outbox"));
    }
}
