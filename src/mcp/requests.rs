// src/mcp/requests.rs
// Request types for tools with parameters

use serde::Deserialize;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunStageRequest {
    #[schemars(description = "Stage to run: fast/comprehensive/tests/cleaning/init")]
    pub args: String,
    #[schemars(description = "Optional JSON object with stage options")]
    pub kwargs: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ExecuteRequest {
    #[schemars(description = "Extra command arguments (string)")]
    pub args: Option<String>,
    #[schemars(description = "JSON object with workflow options, e.g. {\"max_iterations\": 5}")]
    pub kwargs: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct JobProgressRequest {
    #[schemars(description = "Job ID returned by execute_crackerjack")]
    pub job_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SessionRequest {
    #[schemars(description = "Action: start/checkpoint/complete/reset")]
    pub action: String,
    #[schemars(description = "Checkpoint name (for the checkpoint action)")]
    pub checkpoint_name: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AnalyzeErrorsRequest {
    #[schemars(description = "Raw tool output to analyze; omit to analyze cached patterns")]
    pub output: Option<String>,
    #[schemars(description = "Include per-category fix suggestions")]
    pub include_suggestions: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FilteredStatusRequest {
    #[schemars(description = "Comma-separated components: services, jobs, server_stats")]
    pub components: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CleanRequest {
    #[schemars(description = "Scope: temp/progress/cache/all")]
    pub scope: Option<String>,
    #[schemars(description = "List what would be removed without deleting")]
    pub dry_run: Option<bool>,
    #[schemars(description = "Only remove artifacts older than this many hours")]
    pub older_than_hours: Option<u64>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ConfigRequest {
    #[schemars(description = "Action: list/get/validate")]
    pub action: String,
    #[schemars(description = "Dotted config key for the get action, e.g. rate_limits.requests_per_minute")]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AnalyzeProjectRequest {
    #[schemars(description = "Scope of the analysis: errors/session/all")]
    pub scope: Option<String>,
    #[schemars(description = "Report format: summary/detailed")]
    pub report_format: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct InitProjectRequest {
    #[schemars(description = "Project directory to initialize")]
    pub target_path: String,
    #[schemars(description = "Overwrite existing files")]
    pub force: Option<bool>,
}
