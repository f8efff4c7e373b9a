// src/mcp/tools/execution.rs
// Stage and workflow execution tools

use super::{DEFAULT_CLIENT, parse_kwargs, preflight};
use crate::context::ServerContext;
use crate::mcp::responses;
use crate::progress::store::{JobStatus, ProgressSnapshot};
use crate::workflow::{WorkflowOptions, WorkflowStage, run_stage};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_MAX_ITERATIONS: u32 = 10;
/// Pause between failed workflow passes
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// `run_crackerjack_stage`: run one named workflow stage
pub async fn run_crackerjack_stage(
    context: &Arc<ServerContext>,
    args: &str,
    kwargs: Option<&str>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let stage_arg = context
        .sanitizer
        .sanitize_string(args.trim(), 50, false, true);
    if !stage_arg.valid {
        return responses::validation_failed(format!(
            "Invalid stage argument: {}",
            stage_arg.error()
        ));
    }
    let stage_name = stage_arg.as_str().unwrap_or_default().to_lowercase();
    let Some(stage) = WorkflowStage::parse(&stage_name) else {
        return responses::validation_failed(format!(
            "Invalid stage: {}. Valid stages: fast, comprehensive, tests, cleaning, init",
            stage_name
        ));
    };

    if let Err(refusal) = parse_kwargs(context, kwargs) {
        return refusal;
    }

    let options = WorkflowOptions::for_stage(stage);
    context.state_manager.start_stage(stage.as_str()).await;

    match run_stage(context.orchestrator.as_ref(), stage, options).await {
        Ok(true) => {
            context
                .state_manager
                .complete_stage(stage.as_str(), Vec::new(), Vec::new())
                .await;
            responses::stage_result(stage.as_str(), true)
        }
        Ok(false) => {
            context
                .state_manager
                .fail_stage(stage.as_str(), "stage reported failure")
                .await;
            responses::stage_result(stage.as_str(), false)
        }
        Err(e) => {
            context.state_manager.fail_stage(stage.as_str(), &e).await;
            responses::internal_error(format!("Stage execution failed: {}", e))
        }
    }
}

/// `execute_crackerjack`: iterate the complete workflow under a fresh job id,
/// streaming progress snapshots on every transition.
pub async fn execute_crackerjack(
    context: &Arc<ServerContext>,
    args: Option<&str>,
    kwargs: Option<&str>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    if let Some(args) = args.map(str::trim).filter(|a| !a.is_empty()) {
        let validation = context
            .sanitizer
            .validate_command_args(&crate::sanitize::CommandArgs::from(args));
        if !validation.valid {
            return responses::validation_failed(format!(
                "Invalid args: {}",
                validation.error()
            ));
        }
    }

    let kwargs = match parse_kwargs(context, kwargs) {
        Ok(map) => map,
        Err(refusal) => return refusal,
    };

    let job_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

    if !context
        .rate_limiter
        .validate_progress_files(context.progress_store.progress_dir())
    {
        return responses::internal_error(
            "Progress directory is full; run clean_crackerjack with scope=progress",
        );
    }
    if !context.rate_limiter.acquire_job_resources(&job_id).await {
        return responses::job_slots_exhausted(&job_id, 60);
    }
    let result = execute_iterations(context, &job_id, &kwargs).await;
    context.rate_limiter.release_job_resources(&job_id).await;
    result
}

async fn execute_iterations(
    context: &Arc<ServerContext>,
    job_id: &str,
    kwargs: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let max_iterations = kwargs
        .get("max_iterations")
        .and_then(|v| v.as_u64())
        .map(|v| v.clamp(1, 1000) as u32)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);

    emit(context, job_id, JobStatus::Running, 1, max_iterations, 2, "initialization", "Starting workflow execution");
    emit(context, job_id, JobStatus::Running, 1, max_iterations, 5, "status_verified", "Server status verified");
    emit(context, job_id, JobStatus::Running, 1, max_iterations, 10, "services_ready", "Support services ready");
    emit(context, job_id, JobStatus::Running, 1, max_iterations, 15, "orchestrator_ready", "Workflow orchestrator ready");

    let options = WorkflowOptions::from_kwargs(kwargs);
    let mut iteration = 1;
    for i in 1..=max_iterations {
        iteration = i;
        emit(
            context,
            job_id,
            JobStatus::Running,
            i,
            max_iterations,
            (i * 80) / max_iterations,
            &format!("iteration_{}", i),
            &format!("Running iteration {} / {}", i, max_iterations),
        );

        match context
            .orchestrator
            .run_complete_workflow(options.clone())
            .await
        {
            Ok(true) => {
                let message = format!("Successfully completed after {} iterations", i);
                emit(
                    context, job_id, JobStatus::Completed, i, max_iterations, 100, "completed",
                    &message,
                );
                return responses::execution_result(job_id, "completed", i, message);
            }
            Ok(false) if i < max_iterations => {
                emit(
                    context,
                    job_id,
                    JobStatus::Running,
                    i,
                    max_iterations,
                    (i * 80) / max_iterations,
                    "retrying",
                    &format!("Iteration {} failed, retrying...", i),
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id, iteration = i, "workflow iteration error: {}", e);
                if i >= max_iterations {
                    break;
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }

    let message = format!("Failed after {} iterations", max_iterations);
    emit(
        context, job_id, JobStatus::Failed, iteration, max_iterations, 80, "failed", &message,
    );
    responses::execution_result(job_id, "failed", iteration, message)
}

/// Write one progress transition; progress files are best-effort
fn emit(
    context: &Arc<ServerContext>,
    job_id: &str,
    status: JobStatus,
    iteration: u32,
    max_iterations: u32,
    overall_progress: u32,
    current_stage: &str,
    message: &str,
) {
    let snapshot = ProgressSnapshot {
        job_id: job_id.to_string(),
        status,
        iteration,
        max_iterations,
        current_stage: current_stage.to_string(),
        overall_progress,
        stage_progress: overall_progress,
        message: message.to_string(),
        timestamp: String::new(),
        error_counts: None,
    };
    if let Err(e) = context.progress_store.write(snapshot) {
        debug!(job_id, "failed to update progress: {}", e);
    }
}

// ============================================================================
// Error analysis
// ============================================================================

static ERROR_CATEGORIES: Lazy<Vec<(&'static str, Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            "type_error",
            r"(?i)TypeError|incompatible type|type mismatch",
            "Check argument and return types against the annotated signatures",
        ),
        (
            "import_error",
            r"(?i)ImportError|ModuleNotFoundError|cannot import",
            "Verify the module is installed and the import path is correct",
        ),
        (
            "attribute_error",
            r"(?i)AttributeError|has no attribute",
            "Confirm the attribute exists on the object's actual type",
        ),
        (
            "syntax_error",
            r"(?i)SyntaxError|invalid syntax|unexpected indent",
            "Fix the syntax at the reported line before rerunning",
        ),
        (
            "test_failure",
            r"(?i)FAILED|AssertionError|assert .* failed",
            "Re-run the failing tests in isolation and inspect the assertions",
        ),
        (
            "hook_failure",
            r"(?i)hook.*(failed|error)|pre-commit.*failed",
            "Run the failing hook directly to see its full output",
        ),
    ]
    .into_iter()
    .filter_map(|(name, pattern, hint)| Regex::new(pattern).ok().map(|re| (name, re, hint)))
    .collect()
});

/// `analyze_errors`: categorise raw output and feed it through the
/// error-pattern cache.
pub async fn analyze_errors(
    context: &Arc<ServerContext>,
    output: Option<&str>,
    include_suggestions: bool,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let raw = output.unwrap_or_default();
    let mut error_types = Vec::new();
    let mut suggestions = Vec::new();
    let mut counts = serde_json::Map::new();

    for (name, regex, hint) in ERROR_CATEGORIES.iter() {
        let count = regex.find_iter(raw).count();
        if count > 0 {
            error_types.push(name.to_string());
            counts.insert(name.to_string(), serde_json::json!(count));
            if include_suggestions {
                suggestions.push(format!("{}: {}", name, hint));
            }
        }
    }

    // Parse-only pass: patterns with a recognised code, without mutating
    // the cache
    let mut parsed_patterns = Vec::new();
    if !raw.is_empty() {
        for tool in ["ruff", "pyright", "bandit"] {
            for pattern in crate::cache::parse_output(raw, tool) {
                if pattern.error_code.is_empty() {
                    continue;
                }
                parsed_patterns.push(serde_json::json!({
                    "pattern_id": pattern.pattern_id,
                    "error_type": pattern.error_type,
                    "error_code": pattern.error_code,
                    "message_pattern": pattern.message_pattern,
                    "auto_fixable": pattern.auto_fixable,
                }));
            }
        }
    }

    let analysis = serde_json::json!({
        "categories": counts,
        "patterns": parsed_patterns,
        "cache_stats": context.error_cache.stats().await,
    });
    responses::analysis_result(analysis, error_types, suggestions, raw.len())
}
