// src/mcp/tools/progress.rs
// Job progress queries and session lifecycle actions

use super::{DEFAULT_CLIENT, preflight};
use crate::context::ServerContext;
use crate::mcp::responses;
use std::sync::Arc;

/// `get_job_progress`: current snapshot for a job, or a structured
/// not-found error
pub async fn get_job_progress(context: &Arc<ServerContext>, job_id: &str) -> String {
    if !context.is_initialized() {
        return responses::internal_error("Server context not available");
    }

    let validation = context.validate_job_id(job_id);
    if !validation.valid {
        return responses::validation_failed(format!("Invalid job_id: {}", validation.error()));
    }

    match context.progress_store.read(job_id) {
        Ok(Some(snapshot)) => serde_json::to_string_pretty(&snapshot)
            .unwrap_or_else(|e| responses::internal_error(format!("serialization failed: {}", e))),
        Ok(None) => responses::job_not_found(job_id),
        Err(e) => responses::internal_error(format!(
            "Failed to get progress for job {}: {}",
            job_id, e
        )),
    }
}

/// `session_management`: start/checkpoint/complete/reset the session
pub async fn session_management(
    context: &Arc<ServerContext>,
    action: &str,
    checkpoint_name: Option<&str>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    match action {
        "start" => {
            context.state_manager.start_session().await;
            responses::session_ack("session_started", "start", None)
        }
        "checkpoint" => {
            let name = match checkpoint_name.filter(|n| !n.is_empty()) {
                Some(name) => {
                    let validation = context.sanitizer.sanitize_string(name, 100, false, true);
                    if !validation.valid {
                        return responses::validation_failed(format!(
                            "Invalid checkpoint name: {}",
                            validation.error()
                        ));
                    }
                    validation.as_str().unwrap_or_default().to_string()
                }
                None => format!("checkpoint_{}", crate::cache::now_epoch() as u64),
            };
            if let Err(e) = context.state_manager.save_checkpoint(&name).await {
                return responses::internal_error(format!("Checkpoint failed: {}", e));
            }
            let checkpoints = context
                .state_manager
                .list_checkpoints()
                .into_iter()
                .filter_map(|c| serde_json::to_value(c).ok())
                .collect();
            responses::session_checkpoint_ack(name, checkpoints)
        }
        "complete" => {
            context.state_manager.complete_session().await;
            responses::session_ack("session_completed", "complete", None)
        }
        "reset" => {
            context.state_manager.reset_session().await;
            responses::session_ack("session_reset", "reset", None)
        }
        other => responses::validation_failed(format!(
            "Invalid action: {}. Valid actions: start, checkpoint, complete, reset",
            other
        )),
    }
}
