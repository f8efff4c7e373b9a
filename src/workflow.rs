// src/workflow.rs
// The seam to the workflow backend. Tools drive an orchestrator through this
// trait; what each stage actually spawns is the backend's business.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The named phases a workflow run is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStage {
    Fast,
    Comprehensive,
    Tests,
    Cleaning,
    Init,
}

impl WorkflowStage {
    pub const ALL: [WorkflowStage; 5] = [
        WorkflowStage::Fast,
        WorkflowStage::Comprehensive,
        WorkflowStage::Tests,
        WorkflowStage::Cleaning,
        WorkflowStage::Init,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fast" => Some(Self::Fast),
            "comprehensive" => Some(Self::Comprehensive),
            "tests" => Some(Self::Tests),
            "cleaning" => Some(Self::Cleaning),
            "init" => Some(Self::Init),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Comprehensive => "comprehensive",
            Self::Tests => "tests",
            Self::Cleaning => "cleaning",
            Self::Init => "init",
        }
    }
}

/// Options handed to the orchestrator for one pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub test: bool,
    pub clean: bool,
    pub skip_hooks: bool,
    pub ai_agent: bool,
    pub proactive_mode: bool,
}

impl WorkflowOptions {
    /// Options for a single-stage run
    pub fn for_stage(stage: WorkflowStage) -> Self {
        let mut options = Self::default();
        match stage {
            WorkflowStage::Fast | WorkflowStage::Comprehensive => options.skip_hooks = false,
            WorkflowStage::Tests => options.test = true,
            WorkflowStage::Cleaning => options.clean = true,
            WorkflowStage::Init => options.skip_hooks = true,
        }
        options
    }

    /// Options for a complete-workflow pass, overridable from tool kwargs
    pub fn from_kwargs(kwargs: &serde_json::Map<String, serde_json::Value>) -> Self {
        let flag = |key: &str, default: bool| {
            kwargs.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
        };
        Self {
            test: flag("test", true),
            clean: flag("clean", false),
            skip_hooks: flag("skip_hooks", false),
            ai_agent: flag("ai_agent", true),
            proactive_mode: flag("proactive_mode", true),
        }
    }
}

/// Externally provided workflow backend. Each method runs one phase and
/// reports whether it passed; errors are backend failures, not phase
/// failures.
pub trait WorkflowOrchestrator: Send + Sync {
    fn run_fast_hooks(&self, options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>>;
    fn run_comprehensive_hooks(
        &self,
        options: WorkflowOptions,
    ) -> BoxFuture<'_, Result<bool, String>>;
    fn run_tests(&self, options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>>;
    fn run_cleaning(&self, options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>>;
    fn run_init(&self, options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>>;
    /// One full pass over every phase
    fn run_complete_workflow(
        &self,
        options: WorkflowOptions,
    ) -> BoxFuture<'_, Result<bool, String>>;
}

/// Dispatch one named stage to the matching orchestrator method
pub async fn run_stage(
    orchestrator: &dyn WorkflowOrchestrator,
    stage: WorkflowStage,
    options: WorkflowOptions,
) -> Result<bool, String> {
    match stage {
        WorkflowStage::Fast => orchestrator.run_fast_hooks(options).await,
        WorkflowStage::Comprehensive => orchestrator.run_comprehensive_hooks(options).await,
        WorkflowStage::Tests => orchestrator.run_tests(options).await,
        WorkflowStage::Cleaning => orchestrator.run_cleaning(options).await,
        WorkflowStage::Init => orchestrator.run_init(options).await,
    }
}

/// Orchestrator used when no workflow backend is wired in. Every phase
/// reports success without doing anything.
#[derive(Debug, Default)]
pub struct NullOrchestrator;

impl WorkflowOrchestrator for NullOrchestrator {
    fn run_fast_hooks(&self, _options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }

    fn run_comprehensive_hooks(
        &self,
        _options: WorkflowOptions,
    ) -> BoxFuture<'_, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }

    fn run_tests(&self, _options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }

    fn run_cleaning(&self, _options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }

    fn run_init(&self, _options: WorkflowOptions) -> BoxFuture<'_, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }

    fn run_complete_workflow(
        &self,
        _options: WorkflowOptions,
    ) -> BoxFuture<'_, Result<bool, String>> {
        Box::pin(async { Ok(true) })
    }
}
