// src/mcp/mod.rs
// MCP server implementation: the tool surface over the server context

pub mod requests;
pub mod responses;
pub mod tools;

use crate::context::ServerContext;
use self::requests::*;

use rmcp::{
    ErrorData, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::ToolCallContext, wrapper::Parameters},
    model::{
        CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};
use std::sync::Arc;

/// MCP server state. The context owns every subsystem; the server adds only
/// the tool router.
#[derive(Clone)]
pub struct CrackerjackServer {
    pub context: Arc<ServerContext>,
    tool_router: ToolRouter<Self>,
}

impl CrackerjackServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl CrackerjackServer {
    #[tool(
        description = "Run one workflow stage (fast/comprehensive/tests/cleaning/init) against the project."
    )]
    async fn run_crackerjack_stage(
        &self,
        Parameters(req): Parameters<RunStageRequest>,
    ) -> Result<String, String> {
        Ok(tools::execution::run_crackerjack_stage(
            &self.context,
            &req.args,
            req.kwargs.as_deref(),
        )
        .await)
    }

    #[tool(
        description = "Execute the complete quality workflow, iterating until it passes or max_iterations is reached. Returns a job_id for progress tracking."
    )]
    async fn execute_crackerjack(
        &self,
        Parameters(req): Parameters<ExecuteRequest>,
    ) -> Result<String, String> {
        Ok(tools::execution::execute_crackerjack(
            &self.context,
            req.args.as_deref(),
            req.kwargs.as_deref(),
        )
        .await)
    }

    #[tool(description = "Get the current progress snapshot for a job.")]
    async fn get_job_progress(
        &self,
        Parameters(req): Parameters<JobProgressRequest>,
    ) -> Result<String, String> {
        Ok(tools::progress::get_job_progress(&self.context, &req.job_id).await)
    }

    #[tool(
        description = "Manage the workflow session. Actions: start, checkpoint (optionally named), complete, reset."
    )]
    async fn session_management(
        &self,
        Parameters(req): Parameters<SessionRequest>,
    ) -> Result<String, String> {
        Ok(tools::progress::session_management(
            &self.context,
            &req.action,
            req.checkpoint_name.as_deref(),
        )
        .await)
    }

    #[tool(
        description = "Analyze raw tool output for known error categories and recurring patterns."
    )]
    async fn analyze_errors(
        &self,
        Parameters(req): Parameters<AnalyzeErrorsRequest>,
    ) -> Result<String, String> {
        Ok(tools::execution::analyze_errors(
            &self.context,
            req.output.as_deref(),
            req.include_suggestions.unwrap_or(false),
        )
        .await)
    }

    #[tool(description = "Get per-stage session status, issue counts, and checkpoints.")]
    async fn get_stage_status(&self) -> Result<String, String> {
        Ok(tools::status::get_stage_status(&self.context).await)
    }

    #[tool(description = "Suggest the next workflow action from the session state.")]
    async fn get_next_action(&self) -> Result<String, String> {
        Ok(tools::status::get_next_action(&self.context).await)
    }

    #[tool(description = "Get server statistics from every subsystem.")]
    async fn get_server_stats(&self) -> Result<String, String> {
        Ok(tools::status::get_server_stats(&self.context).await)
    }

    #[tool(description = "Collect comprehensive status across all components, bounded and cached.")]
    async fn get_comprehensive_status(&self) -> Result<String, String> {
        Ok(tools::status::get_comprehensive_status(&self.context).await)
    }

    #[tool(
        description = "Collect status for selected components only. Components: services, jobs, server_stats."
    )]
    async fn get_filtered_status(
        &self,
        Parameters(req): Parameters<FilteredStatusRequest>,
    ) -> Result<String, String> {
        Ok(tools::status::get_filtered_status(&self.context, req.components.as_deref()).await)
    }

    #[tool(
        description = "Clean stale artifacts. Scopes: temp, progress, cache, all. Supports dry_run and older_than_hours."
    )]
    async fn clean_crackerjack(
        &self,
        Parameters(req): Parameters<CleanRequest>,
    ) -> Result<String, String> {
        Ok(tools::utility::clean_crackerjack(
            &self.context,
            req.scope.as_deref(),
            req.dry_run.unwrap_or(false),
            req.older_than_hours,
        )
        .await)
    }

    #[tool(description = "Inspect server configuration. Actions: list, get <key>, validate.")]
    async fn config_crackerjack(
        &self,
        Parameters(req): Parameters<ConfigRequest>,
    ) -> Result<String, String> {
        Ok(tools::utility::config_crackerjack(&self.context, &req.action, req.key.as_deref())
            .await)
    }

    #[tool(description = "Analyze error-cache and session analytics. Formats: summary, detailed.")]
    async fn analyze_crackerjack(
        &self,
        Parameters(req): Parameters<AnalyzeProjectRequest>,
    ) -> Result<String, String> {
        Ok(tools::utility::analyze_crackerjack(
            &self.context,
            req.scope.as_deref(),
            req.report_format.as_deref(),
        )
        .await)
    }

    #[tool(description = "Initialize a project with the packaged quality-workflow config files.")]
    async fn init_crackerjack(
        &self,
        Parameters(req): Parameters<InitProjectRequest>,
    ) -> Result<String, String> {
        Ok(tools::utility::init_crackerjack(
            &self.context,
            &req.target_path,
            req.force.unwrap_or(false),
        )
        .await)
    }
}

impl ServerHandler for CrackerjackServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "crackerjack-mcp".into(),
                title: Some("Crackerjack - Python project quality workflow".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Crackerjack runs lint, type-check, test, clean, and init stages for Python projects and streams per-job progress.".into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
            meta: None,
        }))
    }

    #[allow(clippy::manual_async_fn)]
    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            let tool_name = request.name.to_string();
            let start = std::time::Instant::now();

            let ctx = ToolCallContext::new(self, request, context);
            let result = self.tool_router.call(ctx).await;

            tracing::debug!(
                tool = %tool_name,
                duration_ms = start.elapsed().as_millis() as u64,
                success = result.is_ok(),
                "tool call finished"
            );
            result
        }
    }
}
