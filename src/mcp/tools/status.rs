// src/mcp/tools/status.rs
// Status surface: stage status, next-action advice, and server statistics

use super::{DEFAULT_CLIENT, preflight};
use crate::context::ServerContext;
use crate::mcp::responses;
use crate::state::StageStatus;
use crate::workflow::WorkflowStage;
use std::sync::Arc;

/// `get_stage_status`: session summary plus per-stage detail and checkpoints
pub async fn get_stage_status(context: &Arc<ServerContext>) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let summary = context.state_manager.session_summary().await;
    let snapshot = context.state_manager.snapshot().await;
    let checkpoints: Vec<serde_json::Value> = context
        .state_manager
        .list_checkpoints()
        .into_iter()
        .filter_map(|c| serde_json::to_value(c).ok())
        .collect();

    responses::payload(&serde_json::json!({
        "success": true,
        "session": summary,
        "stages": snapshot.stages,
        "checkpoints": checkpoints,
    }))
}

/// `get_next_action`: suggest the next workflow step from the session state
pub async fn get_next_action(context: &Arc<ServerContext>) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let snapshot = context.state_manager.snapshot().await;

    if let Some(current) = &snapshot.current_stage {
        return responses::payload(&serde_json::json!({
            "success": true,
            "next_action": "wait",
            "reason": format!("stage '{}' is still running", current),
        }));
    }

    if let Some(failed) = snapshot
        .stages
        .values()
        .find(|s| matches!(s.status, StageStatus::Failed | StageStatus::Error))
    {
        return responses::payload(&serde_json::json!({
            "success": true,
            "next_action": format!("rerun {}", failed.stage),
            "reason": failed
                .error_message
                .clone()
                .unwrap_or_else(|| "stage failed".to_string()),
        }));
    }

    // First stage in the canonical order that has not completed yet
    let pending = [
        WorkflowStage::Fast,
        WorkflowStage::Comprehensive,
        WorkflowStage::Tests,
        WorkflowStage::Cleaning,
    ]
    .into_iter()
    .find(|stage| {
        snapshot
            .stages
            .get(stage.as_str())
            .is_none_or(|s| s.status != StageStatus::Completed)
    });

    match pending {
        Some(stage) => responses::payload(&serde_json::json!({
            "success": true,
            "next_action": format!("run {}", stage.as_str()),
            "reason": "stage has not completed in this session",
        })),
        None => responses::payload(&serde_json::json!({
            "success": true,
            "next_action": "complete session",
            "reason": "all workflow stages completed",
        })),
    }
}

/// `get_server_stats`: statistics from every subsystem
pub async fn get_server_stats(context: &Arc<ServerContext>) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    responses::payload(&serde_json::json!({
        "success": true,
        "context": context.context_stats().await,
        "rate_limiting": context.rate_limiter.comprehensive_stats().await,
        "batched_writer": context.batched_writer.stats().await,
        "error_cache": context.error_cache.stats().await,
        "job_manager": context.job_manager.stats().await,
    }))
}

/// `get_comprehensive_status`: the bounded collector over every component
pub async fn get_comprehensive_status(context: &Arc<ServerContext>) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }
    responses::payload(&context.comprehensive_status(None).await)
}

/// `get_filtered_status`: the collector restricted to named components
pub async fn get_filtered_status(
    context: &Arc<ServerContext>,
    components: Option<&str>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let filter: Option<Vec<String>> = match components.map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => {
            let mut names = Vec::new();
            for part in raw.split(',') {
                let validation = context.sanitizer.sanitize_string(part.trim(), 50, false, true);
                if !validation.valid {
                    return responses::validation_failed(format!(
                        "Invalid component name: {}",
                        validation.error()
                    ));
                }
                names.push(validation.as_str().unwrap_or_default().to_string());
            }
            Some(names)
        }
        None => None,
    };

    responses::payload(&context.comprehensive_status(filter.as_deref()).await)
}
