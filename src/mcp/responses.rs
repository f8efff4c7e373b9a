//! Structured output types for MCP tools.
//!
//! Every tool serialises one of a small set of shapes: success-with-payload,
//! admission-denied, validation-failed, not-found, or internal-error. No
//! ad-hoc response objects.

use crate::limits::RateDecision;
use serde::Serialize;
use serde_json::Value;

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|_| r#"{"success": false, "error": "serialization failed"}"#.to_string())
}

// ============================================================================
// Failure shapes
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Internal or unexpected failure
pub fn internal_error(message: impl Into<String>) -> String {
    to_json(&ErrorResponse {
        success: false,
        error: message.into(),
    })
}

/// Input failed the sanitiser
pub fn validation_failed(message: impl Into<String>) -> String {
    internal_error(message)
}

#[derive(Debug, Serialize)]
pub struct NotFoundResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

pub fn job_not_found(job_id: &str) -> String {
    to_json(&NotFoundResponse {
        success: false,
        error: format!("Job {} not found", job_id),
        job_id: Some(job_id.to_string()),
    })
}

#[derive(Debug, Serialize)]
pub struct AdmissionDeniedResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

/// A rate-limit or concurrency-cap refusal; not an error of the caller's
/// intent, so it carries `retry_after_seconds`.
pub fn admission_denied(decision: &RateDecision) -> String {
    to_json(&AdmissionDeniedResponse {
        success: false,
        error: format!(
            "Rate limit exceeded: {}",
            decision.reason.as_deref().unwrap_or("unknown")
        ),
        reason: decision.reason.clone(),
        retry_after_seconds: decision.retry_after_seconds,
    })
}

pub fn job_slots_exhausted(job_id: &str, retry_after_seconds: u64) -> String {
    to_json(&AdmissionDeniedResponse {
        success: false,
        error: format!("Job {} rejected: max concurrent jobs reached", job_id),
        reason: Some("max_concurrent_jobs".to_string()),
        retry_after_seconds: Some(retry_after_seconds),
    })
}

// ============================================================================
// Success shapes
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub success: bool,
    pub stage: String,
}

pub fn stage_result(stage: &str, success: bool) -> String {
    to_json(&StageResponse {
        success,
        stage: stage.to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub job_id: String,
    pub status: String,
    pub iteration: u32,
    pub message: String,
}

pub fn execution_result(job_id: &str, status: &str, iteration: u32, message: String) -> String {
    to_json(&ExecutionResponse {
        job_id: job_id.to_string(),
        status: status.to_string(),
        iteration,
        message,
    })
}

#[derive(Debug, Serialize)]
pub struct SessionActionResponse {
    pub success: bool,
    pub status: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<Vec<Value>>,
}

pub fn session_ack(status: &str, action: &str, name: Option<String>) -> String {
    to_json(&SessionActionResponse {
        success: true,
        status: status.to_string(),
        action: action.to_string(),
        name,
        checkpoints: None,
    })
}

pub fn session_checkpoint_ack(name: String, checkpoints: Vec<Value>) -> String {
    to_json(&SessionActionResponse {
        success: true,
        status: "checkpoint_created".to_string(),
        action: "checkpoint".to_string(),
        name: Some(name),
        checkpoints: Some(checkpoints),
    })
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub success: bool,
    pub analysis: Value,
    pub error_types: Vec<String>,
    pub suggestions: Vec<String>,
    pub raw_output_length: usize,
}

pub fn analysis_result(
    analysis: Value,
    error_types: Vec<String>,
    suggestions: Vec<String>,
    raw_output_length: usize,
) -> String {
    to_json(&AnalysisResponse {
        success: true,
        analysis,
        error_types,
        suggestions,
        raw_output_length,
    })
}

#[derive(Debug, Serialize)]
pub struct CleanResponse {
    pub success: bool,
    pub scope: String,
    pub dry_run: bool,
    pub files_cleaned: usize,
    pub total_size_bytes: u64,
    pub files: Vec<String>,
}

pub fn clean_result(
    scope: &str,
    dry_run: bool,
    files: Vec<String>,
    total_size_bytes: u64,
) -> String {
    to_json(&CleanResponse {
        success: true,
        scope: scope.to_string(),
        dry_run,
        files_cleaned: files.len(),
        total_size_bytes,
        files,
    })
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub success: bool,
    pub target_path: String,
    pub files_copied: Vec<String>,
    pub files_skipped: Vec<String>,
    pub errors: Vec<String>,
}

pub fn init_result(
    target_path: &str,
    files_copied: Vec<String>,
    files_skipped: Vec<String>,
    errors: Vec<String>,
) -> String {
    to_json(&InitResponse {
        success: errors.is_empty(),
        target_path: target_path.to_string(),
        files_copied,
        files_skipped,
        errors,
    })
}

/// Success with an arbitrary payload, for the status surface
pub fn payload(value: &Value) -> String {
    to_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_shapes_carry_success_false() {
        for json in [
            internal_error("boom"),
            job_not_found("abc"),
            job_slots_exhausted("abc", 60),
        ] {
            let value: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(value["success"], false);
            assert!(value["error"].is_string());
        }
    }

    #[test]
    fn test_admission_denied_carries_retry_after() {
        let decision = RateDecision {
            allowed: false,
            reason: Some("minute_limit_exceeded".to_string()),
            limit: Some(3),
            window: Some("1 minute".to_string()),
            retry_after_seconds: Some(60),
            minute_requests_remaining: None,
            hour_requests_remaining: None,
        };
        let value: Value = serde_json::from_str(&admission_denied(&decision)).unwrap();
        assert_eq!(value["retry_after_seconds"], 60);
        assert_eq!(value["reason"], "minute_limit_exceeded");
    }

    #[test]
    fn test_execution_result_shape() {
        let value: Value =
            serde_json::from_str(&execution_result("j1", "completed", 2, "done".to_string()))
                .unwrap();
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["iteration"], 2);
    }
}
