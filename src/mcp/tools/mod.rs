// src/mcp/tools/mod.rs
// Tool bodies for the MCP surface. Every body returns a serialised response
// shape; nothing propagates past the MCP boundary.

pub mod execution;
pub mod progress;
pub mod status;
pub mod utility;

use crate::context::ServerContext;
use crate::mcp::responses;
use std::sync::Arc;

/// Client id used when the transport supplies none
pub(crate) const DEFAULT_CLIENT: &str = "default";

/// Shared tool pre-flight: context must be initialised and the caller inside
/// its rate budget. Returns the refusal payload when the call must not run.
pub(crate) async fn preflight(context: &Arc<ServerContext>, client_id: &str) -> Option<String> {
    if !context.is_initialized() {
        return Some(responses::internal_error("Server context not available"));
    }
    let decision = context.rate_limiter.check_request_allowed(client_id).await;
    if !decision.allowed {
        return Some(responses::admission_denied(&decision));
    }
    None
}

/// Parse the optional `kwargs` JSON argument into an object, rejecting
/// non-object top-levels.
pub(crate) fn parse_kwargs(
    context: &Arc<ServerContext>,
    kwargs: Option<&str>,
) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let Some(raw) = kwargs.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(serde_json::Map::new());
    };
    let result = context.sanitizer.sanitize_json(raw);
    if !result.valid {
        return Err(responses::validation_failed(format!(
            "Invalid JSON in kwargs: {}",
            result.error()
        )));
    }
    match result.sanitized_value {
        Some(serde_json::Value::Object(map)) => Ok(map),
        Some(other) => Err(responses::validation_failed(format!(
            "kwargs must be a JSON object, got {}",
            json_type_name(&other)
        ))),
        None => Ok(serde_json::Map::new()),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
