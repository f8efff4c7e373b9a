// src/config/file.rs
// File-based configuration from ~/.crackerjack-mcp/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Project the workflow operates on
    #[serde(default = "ServerConfig::default_project_path")]
    pub project_path: PathBuf,
    /// Directory for per-job progress snapshots. Defaults to a temp subdir.
    pub progress_dir: Option<PathBuf>,
    /// Directory for session state + checkpoints
    pub state_dir: Option<PathBuf>,
    /// Directory for the error-pattern cache
    pub cache_dir: Option<PathBuf>,
    /// True when serving MCP over stdio (console output must stay quiet)
    #[serde(default = "ServerConfig::default_stdio_mode")]
    pub stdio_mode: bool,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            project_path: Self::default_project_path(),
            progress_dir: None,
            state_dir: None,
            cache_dir: None,
            stdio_mode: true,
            rate_limits: RateLimitConfig::default(),
            validator: ValidatorConfig::default(),
            websocket: WebSocketConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

/// Rate limiting and resource bounds section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_requests_per_minute")]
    pub requests_per_minute: usize,
    #[serde(default = "RateLimitConfig::default_requests_per_hour")]
    pub requests_per_hour: usize,
    #[serde(default = "RateLimitConfig::default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "RateLimitConfig::default_max_job_duration_minutes")]
    pub max_job_duration_minutes: u64,
    #[serde(default = "RateLimitConfig::default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "RateLimitConfig::default_max_progress_files")]
    pub max_progress_files: usize,
    #[serde(default = "RateLimitConfig::default_max_cache_entries")]
    pub max_cache_entries: usize,
    #[serde(default = "RateLimitConfig::default_max_state_history")]
    pub max_state_history: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            requests_per_hour: 300,
            max_concurrent_jobs: 5,
            max_job_duration_minutes: 30,
            max_file_size_mb: 100,
            max_progress_files: 1000,
            max_cache_entries: 10000,
            max_state_history: 100,
        }
    }
}

impl RateLimitConfig {
    fn default_requests_per_minute() -> usize {
        30
    }
    fn default_requests_per_hour() -> usize {
        300
    }
    fn default_max_concurrent_jobs() -> usize {
        5
    }
    fn default_max_job_duration_minutes() -> u64 {
        30
    }
    fn default_max_file_size_mb() -> u64 {
        100
    }
    fn default_max_progress_files() -> usize {
        1000
    }
    fn default_max_cache_entries() -> usize {
        10000
    }
    fn default_max_state_history() -> usize {
        100
    }

    /// Maximum bytes a progress or state file may occupy before reads refuse it
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Input validation limits section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidatorConfig {
    #[serde(default = "ValidatorConfig::default_max_string_length")]
    pub max_string_length: usize,
    #[serde(default = "ValidatorConfig::default_max_project_name_length")]
    pub max_project_name_length: usize,
    #[serde(default = "ValidatorConfig::default_max_job_id_length")]
    pub max_job_id_length: usize,
    #[serde(default = "ValidatorConfig::default_max_command_length")]
    pub max_command_length: usize,
    #[serde(default = "ValidatorConfig::default_max_json_size")]
    pub max_json_size: usize,
    #[serde(default = "ValidatorConfig::default_max_json_depth")]
    pub max_json_depth: usize,
    #[serde(default = "ValidatorConfig::default_max_validation_failures_per_minute")]
    pub max_validation_failures_per_minute: usize,
    #[serde(default)]
    pub allow_shell_metacharacters: bool,
    #[serde(default)]
    pub strict_alphanumeric_mode: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_string_length: 10000,
            max_project_name_length: 255,
            max_job_id_length: 128,
            max_command_length: 1000,
            max_json_size: 1024 * 1024,
            max_json_depth: 10,
            max_validation_failures_per_minute: 10,
            allow_shell_metacharacters: false,
            strict_alphanumeric_mode: false,
        }
    }
}

impl ValidatorConfig {
    fn default_max_string_length() -> usize {
        10000
    }
    fn default_max_project_name_length() -> usize {
        255
    }
    fn default_max_job_id_length() -> usize {
        128
    }
    fn default_max_command_length() -> usize {
        1000
    }
    fn default_max_json_size() -> usize {
        1024 * 1024
    }
    fn default_max_json_depth() -> usize {
        10
    }
    fn default_max_validation_failures_per_minute() -> usize {
        10
    }
}

/// WebSocket security section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketConfig {
    #[serde(default = "WebSocketConfig::default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "WebSocketConfig::default_max_messages_per_connection")]
    pub max_messages_per_connection: usize,
    #[serde(default = "WebSocketConfig::default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    #[serde(default = "WebSocketConfig::default_messages_per_second")]
    pub messages_per_second: usize,
    /// Origins allowed to open a progress WebSocket (prefix match).
    /// Empty origin headers are always allowed for local tooling.
    #[serde(default = "WebSocketConfig::default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            max_messages_per_connection: 10000,
            max_concurrent_connections: 100,
            messages_per_second: 100,
            allowed_origins: Self::default_allowed_origins(),
        }
    }
}

impl WebSocketConfig {
    fn default_max_message_size() -> usize {
        1024 * 1024
    }
    fn default_max_messages_per_connection() -> usize {
        10000
    }
    fn default_max_concurrent_connections() -> usize {
        100
    }
    fn default_messages_per_second() -> usize {
        100
    }
    fn default_allowed_origins() -> Vec<String> {
        vec![
            "http://localhost".to_string(),
            "http://127.0.0.1".to_string(),
            "https://localhost".to_string(),
            "https://127.0.0.1".to_string(),
        ]
    }

    /// Check an Origin header against the allow-list (prefix match).
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None | Some("") => true,
            Some(origin) => self.allowed_origins.iter().any(|a| origin.starts_with(a)),
        }
    }
}

/// Batched state writer section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterConfig {
    /// Seconds to coalesce saves for the same key
    #[serde(default = "WriterConfig::default_debounce_delay")]
    pub debounce_delay: f64,
    /// Pending-save count that forces an immediate flush
    #[serde(default = "WriterConfig::default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            debounce_delay: 1.0,
            max_batch_size: 10,
        }
    }
}

impl WriterConfig {
    fn default_debounce_delay() -> f64 {
        1.0
    }
    fn default_max_batch_size() -> usize {
        10
    }
}

impl ServerConfig {
    fn default_project_path() -> PathBuf {
        PathBuf::from(".")
    }
    fn default_stdio_mode() -> bool {
        true
    }

    /// Load config from ~/.crackerjack-mcp/config.toml, falling back to defaults
    pub fn load() -> Self {
        let path = Self::config_path();

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crackerjack-mcp")
            .join("config.toml")
    }

    /// Effective state directory (configured or home-relative default)
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("crackerjack-mcp")
        })
    }

    /// Effective cache directory for the error-pattern cache
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| self.state_dir())
    }

    /// Effective progress directory (configured or temp subdir)
    pub fn progress_dir(&self) -> PathBuf {
        self.progress_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("crackerjack-mcp-progress"))
    }

    /// The full effective configuration as JSON, for `config_crackerjack list`
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Dotted-path lookup into the effective configuration,
    /// e.g. `rate_limits.requests_per_minute`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut value = self.as_json();
        for segment in key.split('.') {
            value = value.get(segment)?.clone();
        }
        Some(value)
    }

    /// Sanity-check limits; returns human-readable warnings
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.rate_limits.requests_per_minute == 0 {
            warnings.push("rate_limits.requests_per_minute is 0; all requests will be denied".to_string());
        }
        if self.rate_limits.requests_per_hour < self.rate_limits.requests_per_minute {
            warnings.push("rate_limits.requests_per_hour is below requests_per_minute".to_string());
        }
        if self.rate_limits.max_concurrent_jobs == 0 {
            warnings.push("rate_limits.max_concurrent_jobs is 0; no job can ever start".to_string());
        }
        if self.validator.max_json_depth == 0 {
            warnings.push("validator.max_json_depth is 0; every JSON payload will be rejected".to_string());
        }
        if self.websocket.max_message_size > 16 * 1024 * 1024 {
            warnings.push("websocket.max_message_size above 16 MiB invites memory pressure".to_string());
        }
        if self.writer.debounce_delay <= 0.0 {
            warnings.push("writer.debounce_delay must be positive; falling back to 1.0s".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.rate_limits.requests_per_minute, 30);
        assert_eq!(config.rate_limits.max_concurrent_jobs, 5);
        assert_eq!(config.validator.max_json_size, 1024 * 1024);
        assert_eq!(config.websocket.max_messages_per_connection, 10000);
        assert!(config.stdio_mode);
    }

    #[test]
    fn test_parse_partial_config_uses_defaults() {
        let toml = r#"
[rate_limits]
requests_per_minute = 3
"#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.rate_limits.requests_per_minute, 3);
        assert_eq!(config.rate_limits.requests_per_hour, 300);
        assert_eq!(config.validator.max_json_depth, 10);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.writer.max_batch_size, 10);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let toml = r#"
[websocket]
max_message_size = 2048
unknown_key = "ignored"
"#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.websocket.max_message_size, 2048);
    }

    #[test]
    fn test_corrupt_toml_falls_back_to_default() {
        let bad_toml = r#"
[rate_limits
requests_per_minute = broken
"#;
        let result: Result<ServerConfig, _> = toml::from_str(bad_toml);
        assert!(result.is_err(), "Corrupt TOML should fail to parse");
    }

    #[test]
    fn test_origin_allowed() {
        let config = WebSocketConfig::default();
        assert!(config.origin_allowed(None));
        assert!(config.origin_allowed(Some("")));
        assert!(config.origin_allowed(Some("http://localhost:8675")));
        assert!(config.origin_allowed(Some("https://127.0.0.1:9000")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
    }

    #[test]
    fn test_dotted_get() {
        let config = ServerConfig::default();
        assert_eq!(
            config.get("rate_limits.requests_per_minute"),
            Some(serde_json::json!(30))
        );
        assert_eq!(config.get("rate_limits.nope"), None);
        assert_eq!(config.get("stdio_mode"), Some(serde_json::json!(true)));
    }

    #[test]
    fn test_validate_flags_zero_limits() {
        let mut config = ServerConfig::default();
        config.rate_limits.requests_per_minute = 0;
        config.rate_limits.max_concurrent_jobs = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_validate_clean_defaults() {
        assert!(ServerConfig::default().validate().is_empty());
    }
}
