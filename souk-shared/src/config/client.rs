use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;
use url::Url;

use crate::models::ScopeKind;

const ENV_BACKEND_URL: &str = "SOUK_BACKEND_URL";
const ENV_API_KEY: &str = "SOUK_API_KEY";
const ENV_LOG_LEVEL: &str = "SOUK_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "SOUK_LOG_FORMAT";

const DEFAULT_BACKEND_URL: &str = "http://localhost:54321/";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// File that failed to open
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The file contents did not deserialize
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// The file extension is neither YAML nor JSON
    #[error("Unsupported configuration format `{0}`. Use 'yaml' or 'json'.")]
    UnsupportedFormat(String),
    /// An environment override could not be parsed
    #[error("Invalid {var} value `{value}`: {reason}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Raw value found in the environment
        value: String,
        /// Why it was rejected
        reason: String,
    },
    /// Validation failed; carries every problem found
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Output format of the tracing subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}` (expected text or json)")),
        }
    }
}

/// Timing knobs for transports, receipts and notifications.
///
/// Stored in milliseconds so config files stay plain integers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RealtimeSettings {
    /// A push subscription with no ack/heartbeat for this long is failed
    pub heartbeat_timeout_ms: u64,
    /// Delays between push re-establishment attempts; the last one repeats
    pub reconnect_backoff_ms: Vec<u64>,
    /// Poll period for conversation scopes
    pub conversation_poll_ms: u64,
    /// Poll period for inbox scopes
    pub inbox_poll_ms: u64,
    /// Poll period for listing feeds
    pub feed_poll_ms: u64,
    /// Consecutive poll failures before the unstable indicator is raised
    pub unstable_after_failures: u32,
    /// Delay before a visible conversation is marked read
    pub mark_read_debounce_ms: u64,
    /// How long a notification stays up before expiring
    pub notification_display_ms: u64,
    /// Retries after a read-receipt write conflict before dropping it
    pub write_conflict_retries: u32,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 12_000,
            reconnect_backoff_ms: vec![1_000, 2_000, 5_000, 10_000],
            conversation_poll_ms: 3_000,
            inbox_poll_ms: 10_000,
            feed_poll_ms: 30_000,
            unstable_after_failures: 3,
            mark_read_debounce_ms: 500,
            notification_display_ms: 5_000,
            write_conflict_retries: 1,
        }
    }
}

impl RealtimeSettings {
    /// Ack window and maximum silence of a push subscription.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Poll period for a scope kind.
    #[must_use]
    pub fn poll_period(&self, kind: ScopeKind) -> Duration {
        let millis = match kind {
            ScopeKind::Conversation => self.conversation_poll_ms,
            ScopeKind::Inbox => self.inbox_poll_ms,
            ScopeKind::Feed => self.feed_poll_ms,
        };
        Duration::from_millis(millis)
    }

    /// Delay before reconnect attempt number `attempt` (zero based).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: usize) -> Duration {
        let millis = self
            .reconnect_backoff_ms
            .get(attempt)
            .or_else(|| self.reconnect_backoff_ms.last())
            .copied()
            .unwrap_or(1_000);
        Duration::from_millis(millis)
    }

    /// Debounce applied to visible-view read receipts.
    #[must_use]
    pub fn mark_read_debounce(&self) -> Duration {
        Duration::from_millis(self.mark_read_debounce_ms)
    }

    /// Display window of a notification.
    #[must_use]
    pub fn notification_display(&self) -> Duration {
        Duration::from_millis(self.notification_display_ms)
    }

    /// Collects every invalid setting.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.heartbeat_timeout_ms == 0 {
            errors.push("heartbeat_timeout_ms must be greater than 0".to_string());
        }
        for (name, value) in [
            ("conversation_poll_ms", self.conversation_poll_ms),
            ("inbox_poll_ms", self.inbox_poll_ms),
            ("feed_poll_ms", self.feed_poll_ms),
        ] {
            if value < 100 {
                errors.push(format!("{name} must be at least 100ms, got {value}"));
            }
        }
        if self.reconnect_backoff_ms.iter().any(|delay| *delay == 0) {
            errors.push("reconnect_backoff_ms entries must be greater than 0".to_string());
        }
        if self.unstable_after_failures == 0 {
            errors.push("unstable_after_failures must be at least 1".to_string());
        }
        if self.notification_display_ms == 0 {
            errors.push("notification_display_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// The main configuration structure for the Souk client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the backend data service
    pub backend_url: String,

    /// Anonymous/service key sent as `apikey` and bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Logging level
    pub log_level: String,

    /// Logging output format
    pub log_format: LogFormat,

    /// Realtime transport settings
    pub realtime: RealtimeSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Config {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            api_key: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            realtime: RealtimeSettings::default(),
        }
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// Environment variables only fill values that are still at their default
    /// after the file is applied; `backend_override` wins over both.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable is malformed, or the resolved configuration fails validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        backend_override: Option<Url>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::with_defaults(),
        };
        let defaults = Self::with_defaults();

        if config.backend_url == defaults.backend_url
            && let Ok(raw) = env::var(ENV_BACKEND_URL)
        {
            if let Err(err) = Url::parse(&raw) {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_BACKEND_URL,
                    value: raw,
                    reason: err.to_string(),
                });
            }
            config.backend_url = raw;
        }
        if config.api_key.is_none()
            && let Ok(key) = env::var(ENV_API_KEY)
            && !key.trim().is_empty()
        {
            config.api_key = Some(key);
        }
        if config.log_level == defaults.log_level
            && let Ok(level) = env::var(ENV_LOG_LEVEL)
        {
            config.log_level = level;
        }
        if config.log_format == defaults.log_format
            && let Ok(raw) = env::var(ENV_LOG_FORMAT)
        {
            config.log_format = raw.parse().map_err(|reason| ConfigError::InvalidEnv {
                var: ENV_LOG_FORMAT,
                value: raw.clone(),
                reason,
            })?;
        }

        if let Some(url) = backend_override {
            config.backend_url = url.to_string();
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !matches!(extension.as_str(), "yaml" | "yml" | "json") {
            return Err(ConfigError::UnsupportedFormat(extension));
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        if extension == "json" {
            serde_json::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))
        } else {
            serde_yml::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))
        }
    }

    /// Parsed backend base URL, normalised to end with `/` so relative joins
    /// keep any path prefix.
    ///
    /// # Errors
    /// Returns the parse error for a malformed URL.
    pub fn backend_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.backend_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Validate the complete configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.backend_url() {
            Ok(url) if !matches!(url.scheme(), "http" | "https") => errors.push(format!(
                "backend_url must use http or https, got `{}`",
                url.scheme()
            )),
            Ok(_) => {}
            Err(err) => errors.push(format!("backend_url `{}` is invalid: {err}", self.backend_url)),
        }
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(format!("unknown log level `{}`", self.log_level));
        }
        if let Err(realtime_errors) = self.realtime.validate() {
            errors.extend(realtime_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)] // edition 2024 requires unsafe for std::env::set_var/remove_var in tests
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn cleanup_env_vars() {
        unsafe {
            std::env::remove_var(ENV_BACKEND_URL);
            std::env::remove_var(ENV_API_KEY);
            std::env::remove_var(ENV_LOG_LEVEL);
            std::env::remove_var(ENV_LOG_FORMAT);
        }
    }

    #[test]
    fn test_config_with_defaults() {
        let config = Config::with_defaults();

        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.realtime.conversation_poll_ms, 3_000);
        assert_eq!(config.realtime.inbox_poll_ms, 10_000);
        assert_eq!(config.realtime.notification_display_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_config_with_defaults() {
        cleanup_env_vars();
        let config = Config::load_config(None, None).unwrap();

        assert_eq!(config, Config::with_defaults());
    }

    #[test]
    #[serial]
    fn test_load_config_with_environment_variables() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var(ENV_BACKEND_URL, "https://project.example.co/");
            std::env::set_var(ENV_API_KEY, "anon-key");
            std::env::set_var(ENV_LOG_LEVEL, "debug");
            std::env::set_var(ENV_LOG_FORMAT, "json");
        }

        let config = Config::load_config(None, None).unwrap();

        assert_eq!(config.backend_url, "https://project.example.co/");
        assert_eq!(config.api_key.as_deref(), Some("anon-key"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_backend_override_precedence() -> Result<(), Box<dyn std::error::Error>> {
        cleanup_env_vars();
        unsafe {
            std::env::set_var(ENV_BACKEND_URL, "https://env.example.co/");
        }

        let override_url = Url::parse("https://cli.example.co/")?;
        let config = Config::load_config(None, Some(override_url.clone()))?;

        assert_eq!(config.backend_url()?, override_url);
        cleanup_env_vars();
        Ok(())
    }

    #[test]
    #[serial]
    fn test_invalid_environment_values() {
        cleanup_env_vars();
        unsafe {
            std::env::set_var(ENV_LOG_FORMAT, "xml");
        }

        let err = Config::load_config(None, None).unwrap_err();
        assert!(err.to_string().contains("Invalid SOUK_LOG_FORMAT"));

        cleanup_env_vars();
        unsafe {
            std::env::set_var(ENV_BACKEND_URL, "not a url");
        }
        let err = Config::load_config(None, None).unwrap_err();
        assert!(err.to_string().contains("Invalid SOUK_BACKEND_URL"));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_load_config_from_yaml_file() -> Result<(), Box<dyn std::error::Error>> {
        cleanup_env_vars();
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("souk.yaml");
        fs::write(
            &config_file,
            r#"
backend_url: "https://yaml.example.co/"
log_level: "trace"
realtime:
  heartbeat_timeout_ms: 15000
  conversation_poll_ms: 2000
"#,
        )?;

        let config = Config::load_config(Some(config_file), None)?;

        assert_eq!(config.backend_url, "https://yaml.example.co/");
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.realtime.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(
            config.realtime.poll_period(ScopeKind::Conversation),
            Duration::from_secs(2)
        );
        // Unspecified settings keep their defaults.
        assert_eq!(
            config.realtime.poll_period(ScopeKind::Inbox),
            Duration::from_secs(10)
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_load_config_from_json_file() -> Result<(), Box<dyn std::error::Error>> {
        cleanup_env_vars();
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("souk.json");
        fs::write(
            &config_file,
            r#"{ "backend_url": "https://json.example.co/", "log_format": "json",
                 "realtime": { "feed_poll_ms": 60000 } }"#,
        )?;

        let config = Config::load_config(Some(config_file), None)?;

        assert_eq!(config.backend_url, "https://json.example.co/");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.realtime.poll_period(ScopeKind::Feed),
            Duration::from_secs(60)
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_file_values_beat_environment() {
        cleanup_env_vars();
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("priority.yaml");
        fs::write(&config_file, "log_level: \"error\"\n").unwrap();
        unsafe {
            std::env::set_var(ENV_LOG_LEVEL, "debug");
        }

        let config = Config::load_config(Some(config_file), None).unwrap();
        assert_eq!(config.log_level, "error");

        cleanup_env_vars();
    }

    #[test]
    fn test_load_config_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("souk.toml");
        fs::write(&config_file, "log_level = 'info'").unwrap();

        let result = Config::load_config(Some(config_file), None);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported configuration format")
        );
    }

    #[test]
    fn test_load_config_nonexistent_file() {
        let result = Config::load_config(Some(PathBuf::from("/nonexistent/souk.yaml")), None);
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_config_malformed_json() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("bad.json");
        fs::write(&config_file, r#"{ "log_level": invalid }"#).unwrap();

        let result = Config::load_config(Some(config_file), None);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::with_defaults();
        config.backend_url = "ftp://files.example.co/".into();
        config.log_level = "loud".into();
        config.realtime.heartbeat_timeout_ms = 0;
        config.realtime.inbox_poll_ms = 10;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("http or https")));
        assert!(errors.iter().any(|e| e.contains("inbox_poll_ms")));
    }

    #[test]
    fn test_backend_url_gains_trailing_slash() {
        let mut config = Config::with_defaults();
        config.backend_url = "https://example.co/project".into();

        let url = config.backend_url().unwrap();
        assert_eq!(url.as_str(), "https://example.co/project/");
        assert_eq!(
            url.join("rest/v1/records").unwrap().as_str(),
            "https://example.co/project/rest/v1/records"
        );
    }

    #[test]
    fn test_reconnect_delay_repeats_last_entry() {
        let settings = RealtimeSettings {
            reconnect_backoff_ms: vec![100, 200],
            ..RealtimeSettings::default()
        };

        assert_eq!(settings.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(settings.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(settings.reconnect_delay(7), Duration::from_millis(200));

        let empty = RealtimeSettings {
            reconnect_backoff_ms: Vec::new(),
            ..RealtimeSettings::default()
        };
        assert_eq!(empty.reconnect_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config::with_defaults();

        let yaml = serde_yml::to_string(&config).unwrap();
        let from_yaml: Config = serde_yml::from_str(&yaml).unwrap();
        assert_eq!(from_yaml, config);

        let json = serde_json::to_string(&config).unwrap();
        let from_json: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json, config);
    }
}
