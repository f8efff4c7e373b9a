// src/sanitize/mod.rs
// Input sanitisation for every externally supplied value

use crate::config::ValidatorConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Component, Path};

/// Severity attached to a validation failure, used for security logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Uniform outcome for every validation. Callers format identical responses
/// from this instead of catching per-check errors.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub sanitized_value: Option<Value>,
    pub error_message: Option<String>,
    pub security_level: SecurityLevel,
    pub validation_type: &'static str,
}

impl ValidationResult {
    pub fn ok(validation_type: &'static str, sanitized_value: Value) -> Self {
        Self {
            valid: true,
            sanitized_value: Some(sanitized_value),
            error_message: None,
            security_level: SecurityLevel::Low,
            validation_type,
        }
    }

    pub fn fail(
        validation_type: &'static str,
        security_level: SecurityLevel,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        tracing::warn!(
            validation_type,
            security_level = ?security_level,
            reason = %message,
            "input validation rejected"
        );
        Self {
            valid: false,
            sanitized_value: None,
            error_message: Some(message),
            security_level,
            validation_type,
        }
    }

    /// Sanitized value as a string, when the validation produced one
    pub fn as_str(&self) -> Option<&str> {
        self.sanitized_value.as_ref().and_then(|v| v.as_str())
    }

    pub fn error(&self) -> &str {
        self.error_message.as_deref().unwrap_or("")
    }
}

/// Shell metacharacters rejected unless `allow_shell_chars` is set
const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\n', '\r', '\\', '"', '\'', '*', '?', '[', ']',
    '{', '}', '~', '^',
];

/// Path components that are never accepted, regardless of base directory
const DANGEROUS_PATH_COMPONENTS: &[&str] = &[
    "..", ".", "~", "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6",
    "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[allow(clippy::expect_used)]
static JOB_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,50}$").expect("job id regex"));

#[allow(clippy::expect_used)]
static ENV_VAR_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("env var name regex"));

static SQL_INJECTION_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bunion\s+(all\s+)?select\b",
        r"(?i)\bselect\b.+\bfrom\b",
        r"(?i)\binsert\s+into\b",
        r"(?i)\bdrop\s+table\b",
        r"(?i)\bdelete\s+from\b",
        r"(?i)(--|/\*|\*/|;--)",
        r#"(?i)'\s*or\s*'1'\s*=\s*'1"#,
        r"(?i)\bor\s+1\s*=\s*1\b",
        r"(?i)\bxp_cmdshell\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static CODE_INJECTION_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\beval\s*\(",
        r"(?i)\bexec\s*\(",
        r"(?i)__import__",
        r"(?i)\bcompile\s*\(",
        r"(?i)\b(getattr|setattr|delattr)\s*\(",
        r"(?i)\bos\.system\b",
        r"(?i)\bsubprocess\.",
        r"(?i)\bimportlib\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Command arguments arrive either as one string or a list of strings
#[derive(Debug, Clone)]
pub enum CommandArgs {
    Single(String),
    List(Vec<String>),
}

impl From<&str> for CommandArgs {
    fn from(s: &str) -> Self {
        CommandArgs::Single(s.to_string())
    }
}

impl From<Vec<String>> for CommandArgs {
    fn from(v: Vec<String>) -> Self {
        CommandArgs::List(v)
    }
}

/// Stateless validator over a configuration bundle
#[derive(Debug, Clone)]
pub struct InputSanitizer {
    config: ValidatorConfig,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl InputSanitizer {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate and trim a free-form string
    pub fn sanitize_string(
        &self,
        value: &str,
        max_length: usize,
        allow_shell_chars: bool,
        strict_alphanumeric: bool,
    ) -> ValidationResult {
        if value.len() > max_length {
            return ValidationResult::fail(
                "length_check",
                SecurityLevel::High,
                format!("String too long: {} > {}", value.len(), max_length),
            );
        }

        if value.contains('\0') {
            return ValidationResult::fail(
                "null_byte_injection",
                SecurityLevel::Critical,
                "Null byte detected in input",
            );
        }

        if value
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
        {
            return ValidationResult::fail(
                "control_chars",
                SecurityLevel::High,
                "Control characters detected in input",
            );
        }

        if !allow_shell_chars {
            let found: Vec<char> = value
                .chars()
                .filter(|c| SHELL_METACHARACTERS.contains(c))
                .collect();
            if !found.is_empty() {
                return ValidationResult::fail(
                    "shell_injection",
                    SecurityLevel::Critical,
                    format!("Shell metacharacters detected: {:?}", found),
                );
            }
        }

        if SQL_INJECTION_RES.iter().any(|re| re.is_match(value)) {
            return ValidationResult::fail(
                "sql_injection",
                SecurityLevel::Critical,
                "SQL injection pattern detected",
            );
        }

        if CODE_INJECTION_RES.iter().any(|re| re.is_match(value)) {
            return ValidationResult::fail(
                "code_injection",
                SecurityLevel::Critical,
                "Code injection pattern detected",
            );
        }

        if strict_alphanumeric && !is_strictly_alphanumeric(value) {
            return ValidationResult::fail(
                "alphanumeric_only",
                SecurityLevel::Medium,
                "Only alphanumeric characters, hyphens, and underscores allowed",
            );
        }

        ValidationResult::ok("string_sanitization", Value::String(value.trim().to_string()))
    }

    /// Parse a JSON payload under the configured size and depth caps
    pub fn sanitize_json(&self, value: &str) -> ValidationResult {
        if value.len() > self.config.max_json_size {
            return ValidationResult::fail(
                "json_size",
                SecurityLevel::High,
                format!(
                    "JSON too large: {} > {} bytes",
                    value.len(),
                    self.config.max_json_size
                ),
            );
        }

        let parsed: Value = match serde_json::from_str(value) {
            Ok(v) => v,
            Err(e) => {
                return ValidationResult::fail(
                    "json_syntax",
                    SecurityLevel::Medium,
                    format!("Invalid JSON: {}", e),
                );
            }
        };

        let depth = json_depth(&parsed, 0);
        if depth > self.config.max_json_depth {
            return ValidationResult::fail(
                "json_depth",
                SecurityLevel::High,
                format!(
                    "JSON nesting too deep: {} > {}",
                    depth, self.config.max_json_depth
                ),
            );
        }

        ValidationResult::ok("json_parsing", parsed)
    }

    /// Validate a filesystem path, optionally confined to a base directory
    pub fn sanitize_path(
        &self,
        value: &str,
        base_directory: Option<&Path>,
        allow_absolute: bool,
    ) -> ValidationResult {
        let path = Path::new(value);

        for component in path.components() {
            if let Component::Normal(part) = component {
                let part = part.to_string_lossy();
                let upper = part.to_uppercase();
                if DANGEROUS_PATH_COMPONENTS.contains(&upper.as_str())
                    || part.chars().any(|c| {
                        matches!(c, ';' | '&' | '|' | '<' | '>' | '$' | '`' | '\0')
                    })
                {
                    return ValidationResult::fail(
                        "path_traversal",
                        SecurityLevel::Critical,
                        format!("Dangerous path component: {}", part),
                    );
                }
            } else if matches!(component, Component::ParentDir | Component::CurDir) {
                return ValidationResult::fail(
                    "path_traversal",
                    SecurityLevel::Critical,
                    format!("Dangerous path component: {}", value),
                );
            }
        }

        let resolved = match base_directory {
            Some(base) => {
                let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
                let joined = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    base.join(path)
                };
                if !joined.starts_with(&base) {
                    return ValidationResult::fail(
                        "directory_escape",
                        SecurityLevel::Critical,
                        format!("Path outside base directory: {}", value),
                    );
                }
                joined
            }
            None => {
                if path.is_absolute() && !allow_absolute {
                    return ValidationResult::fail(
                        "absolute_path",
                        SecurityLevel::High,
                        "Absolute paths not allowed",
                    );
                }
                path.to_path_buf()
            }
        };

        ValidationResult::ok(
            "path_sanitization",
            Value::String(resolved.to_string_lossy().into_owned()),
        )
    }

    /// Validate a job identifier: a UUID or `[A-Za-z0-9_-]{1,50}`
    pub fn validate_job_id(&self, job_id: &str) -> ValidationResult {
        if uuid::Uuid::parse_str(job_id).is_ok() {
            return ValidationResult::ok("job_id_format", Value::String(job_id.to_string()));
        }

        if !JOB_ID_RE.is_match(job_id) {
            return ValidationResult::fail(
                "job_id_format",
                SecurityLevel::High,
                "Job ID must be alphanumeric with hyphens/underscores only",
            );
        }

        ValidationResult::ok("job_id_format", Value::String(job_id.to_string()))
    }

    /// Validate an environment variable name/value pair
    pub fn validate_env_var(&self, name: &str, value: &str) -> ValidationResult {
        if !ENV_VAR_NAME_RE.is_match(name) {
            return ValidationResult::fail(
                "env_var_name",
                SecurityLevel::Medium,
                "Invalid environment variable name format",
            );
        }

        let result = self.sanitize_string(value, self.config.max_string_length, false, false);
        if !result.valid {
            return result;
        }

        ValidationResult::ok(
            "env_var",
            serde_json::json!({ "name": name, "value": result.as_str().unwrap_or_default() }),
        )
    }

    /// Validate command arguments (a single string or a list of strings)
    pub fn validate_command_args(&self, args: &CommandArgs) -> ValidationResult {
        match args {
            CommandArgs::Single(s) => {
                let result = self.sanitize_string(
                    s,
                    self.config.max_command_length,
                    self.config.allow_shell_metacharacters,
                    false,
                );
                if !result.valid {
                    return result;
                }
                ValidationResult::ok(
                    "command_args",
                    Value::String(result.as_str().unwrap_or_default().to_string()),
                )
            }
            CommandArgs::List(list) => {
                let mut sanitized = Vec::with_capacity(list.len());
                for arg in list {
                    let result = self.sanitize_string(
                        arg,
                        self.config.max_command_length,
                        self.config.allow_shell_metacharacters,
                        false,
                    );
                    if !result.valid {
                        return result;
                    }
                    sanitized.push(Value::String(
                        result.as_str().unwrap_or_default().to_string(),
                    ));
                }
                ValidationResult::ok("command_args_list", Value::Array(sanitized))
            }
        }
    }

    /// Validate a project name: strict alphanumeric, bounded length
    pub fn validate_project_name(&self, name: &str) -> ValidationResult {
        self.sanitize_string(name, self.config.max_project_name_length, false, true)
    }
}

fn is_strictly_alphanumeric(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Maximum nesting depth of a JSON value
fn json_depth(value: &Value, current: usize) -> usize {
    match value {
        Value::Object(map) => map
            .values()
            .map(|v| json_depth(v, current + 1))
            .max()
            .unwrap_or(current),
        Value::Array(items) => items
            .iter()
            .map(|v| json_depth(v, current + 1))
            .max()
            .unwrap_or(current),
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> InputSanitizer {
        InputSanitizer::default()
    }

    // ============================================================================
    // String sanitisation
    // ============================================================================

    #[test]
    fn test_sanitize_string_accepts_plain_text() {
        let result = sanitizer().sanitize_string("hello world", 100, false, false);
        assert!(result.valid);
        assert_eq!(result.as_str(), Some("hello world"));
    }

    #[test]
    fn test_sanitize_string_trims_whitespace() {
        let result = sanitizer().sanitize_string("  padded  ", 100, false, false);
        assert_eq!(result.as_str(), Some("padded"));
    }

    #[test]
    fn test_sanitize_string_rejects_too_long() {
        let result = sanitizer().sanitize_string("aaaa", 3, false, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "length_check");
        assert_eq!(result.security_level, SecurityLevel::High);
    }

    #[test]
    fn test_sanitize_string_rejects_null_byte() {
        let result = sanitizer().sanitize_string("a\0b", 100, false, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "null_byte_injection");
        assert_eq!(result.security_level, SecurityLevel::Critical);
    }

    #[test]
    fn test_sanitize_string_rejects_control_chars() {
        let result = sanitizer().sanitize_string("a\x07b", 100, false, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "control_chars");
    }

    #[test]
    fn test_sanitize_string_allows_tab_and_newline() {
        let result = sanitizer().sanitize_string("a\tb", 100, false, false);
        assert!(result.valid);
    }

    #[test]
    fn test_sanitize_string_rejects_shell_metacharacters() {
        for bad in ["rm -rf; ls", "a|b", "a`b`", "$(whoami)", "a&b"] {
            let result = sanitizer().sanitize_string(bad, 100, false, false);
            assert!(!result.valid, "{bad} should be rejected");
            assert_eq!(result.validation_type, "shell_injection");
        }
    }

    #[test]
    fn test_sanitize_string_shell_chars_allowed_when_opted_in() {
        let result = sanitizer().sanitize_string("ls | grep foo", 100, true, false);
        assert!(result.valid);
    }

    #[test]
    fn test_sanitize_string_rejects_sql_injection() {
        let result =
            sanitizer().sanitize_string("1 UNION SELECT password FROM users", 100, true, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "sql_injection");
    }

    #[test]
    fn test_sanitize_string_rejects_code_injection() {
        let result = sanitizer().sanitize_string("eval(payload)", 100, true, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "code_injection");
    }

    #[test]
    fn test_strict_alphanumeric() {
        assert!(sanitizer().sanitize_string("ok-name_1", 100, false, true).valid);
        let result = sanitizer().sanitize_string("has space", 100, false, true);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "alphanumeric_only");
    }

    // ============================================================================
    // JSON sanitisation
    // ============================================================================

    #[test]
    fn test_sanitize_json_parses_object() {
        let result = sanitizer().sanitize_json(r#"{"max_iterations": 1}"#);
        assert!(result.valid);
        assert_eq!(
            result.sanitized_value,
            Some(serde_json::json!({"max_iterations": 1}))
        );
    }

    #[test]
    fn test_sanitize_json_rejects_invalid_syntax() {
        let result = sanitizer().sanitize_json("{nope");
        assert!(!result.valid);
        assert_eq!(result.validation_type, "json_syntax");
    }

    #[test]
    fn test_sanitize_json_rejects_oversized() {
        let mut config = ValidatorConfig::default();
        config.max_json_size = 8;
        let result = InputSanitizer::new(config).sanitize_json(r#"{"k": "too long"}"#);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "json_size");
    }

    #[test]
    fn test_sanitize_json_rejects_deep_nesting() {
        let deep = format!("{}1{}", "[".repeat(12), "]".repeat(12));
        let result = sanitizer().sanitize_json(&deep);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "json_depth");
    }

    #[test]
    fn test_json_depth_measurement() {
        assert_eq!(json_depth(&serde_json::json!(1), 0), 0);
        assert_eq!(json_depth(&serde_json::json!({"a": 1}), 0), 1);
        assert_eq!(json_depth(&serde_json::json!({"a": [1]}), 0), 2);
        assert_eq!(json_depth(&serde_json::json!({}), 0), 0);
    }

    // ============================================================================
    // Path sanitisation
    // ============================================================================

    #[test]
    fn test_sanitize_path_rejects_parent_traversal() {
        let result = sanitizer().sanitize_path("../etc/passwd", None, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "path_traversal");
        assert_eq!(result.security_level, SecurityLevel::Critical);
    }

    #[test]
    fn test_sanitize_path_rejects_windows_device_names() {
        let result = sanitizer().sanitize_path("logs/CON", None, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "path_traversal");
    }

    #[test]
    fn test_sanitize_path_rejects_absolute_without_opt_in() {
        let result = sanitizer().sanitize_path("/etc/passwd", None, false);
        assert!(!result.valid);
        assert_eq!(result.validation_type, "absolute_path");
    }

    #[test]
    fn test_sanitize_path_allows_absolute_with_opt_in() {
        let result = sanitizer().sanitize_path("/tmp/project", None, true);
        assert!(result.valid);
    }

    #[test]
    fn test_sanitize_path_confines_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            sanitizer().sanitize_path("job-abc.json", Some(dir.path()), false);
        assert!(result.valid);
        let escaped = sanitizer().sanitize_path("/etc/passwd", Some(dir.path()), true);
        assert!(!escaped.valid);
        assert_eq!(escaped.validation_type, "directory_escape");
    }

    // ============================================================================
    // Job ids, env vars, command args
    // ============================================================================

    #[test]
    fn test_validate_job_id_accepts_uuid() {
        let id = uuid::Uuid::new_v4().to_string();
        assert!(sanitizer().validate_job_id(&id).valid);
    }

    #[test]
    fn test_validate_job_id_accepts_short_ids() {
        assert!(sanitizer().validate_job_id("abc123_X-").valid);
    }

    #[test]
    fn test_validate_job_id_rejects_traversal() {
        let result = sanitizer().validate_job_id("../etc/passwd");
        assert!(!result.valid);
        assert_eq!(result.validation_type, "job_id_format");
        assert_eq!(result.security_level, SecurityLevel::High);
    }

    #[test]
    fn test_validate_job_id_rejects_empty_and_long() {
        assert!(!sanitizer().validate_job_id("").valid);
        assert!(!sanitizer().validate_job_id(&"a".repeat(51)).valid);
    }

    #[test]
    fn test_validate_env_var() {
        assert!(sanitizer().validate_env_var("MY_FLAG", "on").valid);
        let bad_name = sanitizer().validate_env_var("lower-case", "on");
        assert!(!bad_name.valid);
        assert_eq!(bad_name.validation_type, "env_var_name");
        let bad_value = sanitizer().validate_env_var("MY_FLAG", "$(pwn)");
        assert!(!bad_value.valid);
    }

    #[test]
    fn test_validate_command_args_string_and_list() {
        let s = sanitizer().validate_command_args(&CommandArgs::from("run tests"));
        assert!(s.valid);
        let list = sanitizer().validate_command_args(&CommandArgs::from(vec![
            "fast".to_string(),
            "tests".to_string(),
        ]));
        assert!(list.valid);
        let bad = sanitizer().validate_command_args(&CommandArgs::from("rm;reboot"));
        assert!(!bad.valid);
    }
}
