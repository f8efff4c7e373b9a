// src/state/mod.rs
// In-memory session model: stages, issues, fixes, checkpoints

use crate::cache::now_epoch;
use crate::writer::BatchedWriter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
}

impl StageStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuePriority {
    Critical,
    High,
    Medium,
    Low,
}

impl IssuePriority {
    pub const ALL: [IssuePriority; 4] = [
        IssuePriority::Critical,
        IssuePriority::High,
        IssuePriority::Medium,
        IssuePriority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// One problem surfaced by a workflow stage. Identity is `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    pub message: String,
    pub file_path: String,
    #[serde(default)]
    pub line_number: Option<u32>,
    pub priority: IssuePriority,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
    #[serde(default)]
    pub auto_fixable: bool,
}

/// Outcome of one stage run. `duration = end_time - start_time` whenever
/// both ends are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub start_time: f64,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub issues_found: Vec<Issue>,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl StageResult {
    fn running(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Running,
            start_time: now_epoch(),
            end_time: None,
            duration: None,
            issues_found: Vec::new(),
            fixes_applied: Vec::new(),
            error_message: None,
        }
    }

    fn finish(&mut self, status: StageStatus) {
        self.status = status;
        let end = now_epoch();
        self.end_time = Some(end);
        self.duration = Some(end - self.start_time);
    }
}

/// The whole session. One per server lifetime; checkpoints round-trip it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub start_time: f64,
    #[serde(default)]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub stages: HashMap<String, StageResult>,
    #[serde(default)]
    pub global_issues: Vec<Issue>,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SessionState {
    fn fresh() -> Self {
        Self {
            session_id: generate_session_id(),
            start_time: now_epoch(),
            current_stage: None,
            stages: HashMap::new(),
            global_issues: Vec::new(),
            fixes_applied: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    name: String,
    timestamp: f64,
    session_state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub name: String,
    pub timestamp: f64,
    pub file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration: f64,
    pub current_stage: Option<String>,
    pub stages: HashMap<String, String>,
    pub total_issues: usize,
    pub issues_by_priority: HashMap<String, usize>,
    pub issues_by_type: HashMap<String, usize>,
    pub total_fixes: usize,
    pub auto_fixable_issues: usize,
}

/// Wraps the session behind a lock and persists every mutation.
/// Persistence is best-effort; the in-memory state is the source of truth.
pub struct StateManager {
    state_dir: PathBuf,
    checkpoints_dir: PathBuf,
    session: Mutex<SessionState>,
    writer: Option<Arc<BatchedWriter>>,
}

impl StateManager {
    pub fn new(state_dir: &Path, writer: Option<Arc<BatchedWriter>>) -> std::io::Result<Self> {
        let checkpoints_dir = state_dir.join("checkpoints");
        std::fs::create_dir_all(&checkpoints_dir)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            checkpoints_dir,
            session: Mutex::new(SessionState::fresh()),
            writer,
        })
    }

    pub async fn session_id(&self) -> String {
        self.session.lock().await.session_id.clone()
    }

    pub async fn snapshot(&self) -> SessionState {
        self.session.lock().await.clone()
    }

    // ------------------------------------------------------------------
    // Stage lifecycle
    // ------------------------------------------------------------------

    pub async fn start_stage(&self, stage: &str) {
        let mut session = self.session.lock().await;
        session.current_stage = Some(stage.to_string());
        session
            .stages
            .insert(stage.to_string(), StageResult::running(stage));
        self.save(&session).await;
    }

    pub async fn complete_stage(&self, stage: &str, issues: Vec<Issue>, fixes: Vec<String>) {
        let mut session = self.session.lock().await;
        {
            let Some(result) = session.stages.get_mut(stage) else {
                return;
            };
            result.finish(StageStatus::Completed);
            if !issues.is_empty() {
                result.issues_found = issues.clone();
            }
            if !fixes.is_empty() {
                result.fixes_applied = fixes.clone();
            }
        }
        session.global_issues.extend(issues);
        session.fixes_applied.extend(fixes);
        if session.current_stage.as_deref() == Some(stage) {
            session.current_stage = None;
        }
        self.save(&session).await;
    }

    pub async fn fail_stage(&self, stage: &str, error_message: &str) {
        let mut session = self.session.lock().await;
        let Some(result) = session.stages.get_mut(stage) else {
            return;
        };
        result.finish(StageStatus::Failed);
        result.error_message = Some(error_message.to_string());
        if session.current_stage.as_deref() == Some(stage) {
            session.current_stage = None;
        }
        self.save(&session).await;
    }

    /// Overwrite a stage's status, creating the stage in `running` if absent.
    /// Terminal statuses stamp the end time.
    pub async fn update_stage_status(&self, stage: &str, status: &str) -> bool {
        let Some(parsed) = StageStatus::parse(status) else {
            return false;
        };
        let mut session = self.session.lock().await;
        match session.stages.get_mut(stage) {
            Some(result) => {
                result.status = parsed;
                if parsed.is_terminal() {
                    result.end_time = Some(now_epoch());
                }
            }
            None => {
                let mut result = StageResult::running(stage);
                result.status = parsed;
                session.stages.insert(stage.to_string(), result);
            }
        }
        self.save(&session).await;
        true
    }

    // ------------------------------------------------------------------
    // Issues
    // ------------------------------------------------------------------

    pub async fn add_issue(&self, issue: Issue) {
        let mut session = self.session.lock().await;
        session.global_issues.push(issue);
        self.save(&session).await;
    }

    pub async fn remove_issue(&self, issue_id: &str) -> bool {
        let mut session = self.session.lock().await;
        let before = session.global_issues.len();
        session.global_issues.retain(|i| i.id != issue_id);
        let removed = session.global_issues.len() < before;
        if removed {
            self.save(&session).await;
        }
        removed
    }

    pub async fn issues_by_priority(&self, priority: IssuePriority) -> Vec<Issue> {
        self.session
            .lock()
            .await
            .global_issues
            .iter()
            .filter(|i| i.priority == priority)
            .cloned()
            .collect()
    }

    pub async fn issues_by_type(&self, issue_type: &str) -> Vec<Issue> {
        self.session
            .lock()
            .await
            .global_issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .cloned()
            .collect()
    }

    pub async fn auto_fixable_issues(&self) -> Vec<Issue> {
        self.session
            .lock()
            .await
            .global_issues
            .iter()
            .filter(|i| i.auto_fixable)
            .cloned()
            .collect()
    }

    pub async fn session_summary(&self) -> SessionSummary {
        let session = self.session.lock().await;
        let mut issues_by_priority = HashMap::new();
        for priority in IssuePriority::ALL {
            let count = session
                .global_issues
                .iter()
                .filter(|i| i.priority == priority)
                .count();
            issues_by_priority.insert(priority.as_str().to_string(), count);
        }
        let mut issues_by_type: HashMap<String, usize> = HashMap::new();
        for issue in &session.global_issues {
            *issues_by_type.entry(issue.issue_type.clone()).or_insert(0) += 1;
        }
        let stages = session
            .stages
            .iter()
            .map(|(name, result)| (name.clone(), result.status.as_str().to_string()))
            .collect();

        SessionSummary {
            session_id: session.session_id.clone(),
            duration: now_epoch() - session.start_time,
            current_stage: session.current_stage.clone(),
            stages,
            total_issues: session.global_issues.len(),
            issues_by_priority,
            issues_by_type,
            total_fixes: session.fixes_applied.len(),
            auto_fixable_issues: session.global_issues.iter().filter(|i| i.auto_fixable).count(),
        }
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub async fn save_checkpoint(&self, name: &str) -> crate::Result<()> {
        let session = self.session.lock().await;
        let checkpoint = Checkpoint {
            name: name.to_string(),
            timestamp: now_epoch(),
            session_state: session.clone(),
        };
        let path = self.checkpoints_dir.join(format!("{}.json", name));
        std::fs::write(&path, serde_json::to_string_pretty(&checkpoint)?)?;
        Ok(())
    }

    /// Replace the current session wholesale from a named checkpoint
    pub async fn load_checkpoint(&self, name: &str) -> bool {
        let path = self.checkpoints_dir.join(format!("{}.json", name));
        let Ok(text) = std::fs::read_to_string(&path) else {
            return false;
        };
        let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&text) else {
            return false;
        };
        let mut session = self.session.lock().await;
        *session = checkpoint.session_state;
        self.save(&session).await;
        true
    }

    /// Newest-first checkpoint summaries
    pub fn list_checkpoints(&self) -> Vec<CheckpointSummary> {
        let mut checkpoints = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.checkpoints_dir) else {
            return checkpoints;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&text) else {
                continue;
            };
            checkpoints.push(CheckpointSummary {
                name: checkpoint.name,
                timestamp: checkpoint.timestamp,
                file: path.to_string_lossy().into_owned(),
            });
        }
        checkpoints.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        checkpoints
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub async fn start_session(&self) {
        let session = self.session.lock().await;
        self.save(&session).await;
    }

    pub async fn complete_session(&self) {
        let mut session = self.session.lock().await;
        session
            .metadata
            .insert("status".to_string(), serde_json::json!("completed"));
        session
            .metadata
            .insert("completed_time".to_string(), serde_json::json!(now_epoch()));
        self.save(&session).await;
    }

    pub async fn reset_session(&self) {
        let mut session = self.session.lock().await;
        *session = SessionState::fresh();
        self.save(&session).await;
    }

    /// Restore the persisted session, if any, by round-tripping
    /// `current_session.json` through the checkpoint format.
    pub async fn load_state(&self) -> bool {
        let state_file = self.state_dir.join("current_session.json");
        let Ok(text) = std::fs::read_to_string(&state_file) else {
            return false;
        };
        let Ok(session) = serde_json::from_str::<SessionState>(&text) else {
            return false;
        };
        let temp = Checkpoint {
            name: "_temp".to_string(),
            timestamp: now_epoch(),
            session_state: session,
        };
        let temp_path = self.checkpoints_dir.join("_temp.json");
        if let Ok(json) = serde_json::to_string(&temp) {
            if std::fs::write(&temp_path, json).is_err() {
                return false;
            }
        } else {
            return false;
        }
        let loaded = self.load_checkpoint("_temp").await;
        let _ = std::fs::remove_file(&temp_path);
        loaded
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn save(&self, session: &SessionState) {
        let state_file = self.state_dir.join("current_session.json");
        let Ok(json) = serde_json::to_string_pretty(session) else {
            return;
        };
        match &self.writer {
            Some(writer) => {
                let path = state_file.clone();
                writer
                    .schedule(
                        "current_session.json",
                        Box::new(move || {
                            if let Err(e) = std::fs::write(&path, &json) {
                                debug!(error = %e, "Failed to persist session state");
                            }
                        }),
                    )
                    .await;
            }
            None => {
                if let Err(e) = std::fs::write(&state_file, json) {
                    debug!(error = %e, "Failed to persist session state");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, priority: IssuePriority, auto_fixable: bool) -> Issue {
        Issue {
            id: id.to_string(),
            issue_type: "lint".to_string(),
            message: "line too long".to_string(),
            file_path: "src/a.py".to_string(),
            line_number: Some(10),
            priority,
            stage: "fast".to_string(),
            suggested_fix: None,
            auto_fixable,
        }
    }

    async fn manager(dir: &Path) -> StateManager {
        StateManager::new(dir, None).unwrap()
    }

    #[tokio::test]
    async fn test_start_stage_sets_current_and_running() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        mgr.start_stage("fast").await;
        let snap = mgr.snapshot().await;
        assert_eq!(snap.current_stage.as_deref(), Some("fast"));
        assert_eq!(snap.stages["fast"].status, StageStatus::Running);
    }

    #[tokio::test]
    async fn test_complete_stage_clears_current_and_derives_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        mgr.start_stage("fast").await;
        mgr.complete_stage("fast", vec![issue("i1", IssuePriority::High, false)], vec!["fix".to_string()])
            .await;

        let snap = mgr.snapshot().await;
        assert!(snap.current_stage.is_none());
        let stage = &snap.stages["fast"];
        assert_eq!(stage.status, StageStatus::Completed);
        let end = stage.end_time.unwrap();
        let duration = stage.duration.unwrap();
        assert!((duration - (end - stage.start_time)).abs() < 1e-9);
        assert_eq!(snap.global_issues.len(), 1);
        assert_eq!(snap.fixes_applied, vec!["fix"]);
    }

    #[tokio::test]
    async fn test_complete_unknown_stage_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.complete_stage("ghost", vec![], vec![]).await;
        assert!(mgr.snapshot().await.stages.is_empty());
    }

    #[tokio::test]
    async fn test_fail_stage_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.start_stage("tests").await;
        mgr.fail_stage("tests", "3 tests failed").await;

        let snap = mgr.snapshot().await;
        assert!(snap.current_stage.is_none());
        let stage = &snap.stages["tests"];
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.error_message.as_deref(), Some("3 tests failed"));
    }

    #[tokio::test]
    async fn test_update_stage_status_creates_absent_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;

        assert!(mgr.update_stage_status("cleaning", "completed").await);
        let snap = mgr.snapshot().await;
        let stage = &snap.stages["cleaning"];
        assert_eq!(stage.status, StageStatus::Completed);
        assert!(!mgr.update_stage_status("cleaning", "bogus").await);
    }

    #[tokio::test]
    async fn test_issue_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.add_issue(issue("i1", IssuePriority::High, true)).await;
        mgr.add_issue(issue("i2", IssuePriority::Low, false)).await;

        assert_eq!(mgr.issues_by_priority(IssuePriority::High).await.len(), 1);
        assert_eq!(mgr.issues_by_type("lint").await.len(), 2);
        assert_eq!(mgr.auto_fixable_issues().await.len(), 1);
        assert!(mgr.remove_issue("i1").await);
        assert!(!mgr.remove_issue("i1").await);
    }

    #[tokio::test]
    async fn test_session_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.start_stage("fast").await;
        mgr.add_issue(issue("i1", IssuePriority::Critical, true)).await;

        let summary = mgr.session_summary().await;
        assert_eq!(summary.total_issues, 1);
        assert_eq!(summary.issues_by_priority["critical"], 1);
        assert_eq!(summary.issues_by_priority["low"], 0);
        assert_eq!(summary.issues_by_type["lint"], 1);
        assert_eq!(summary.stages["fast"], "running");
        assert_eq!(summary.auto_fixable_issues, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.start_stage("fast").await;
        mgr.complete_stage("fast", vec![issue("i1", IssuePriority::Medium, false)], vec![])
            .await;
        let before = mgr.snapshot().await;

        mgr.save_checkpoint("before-reset").await.unwrap();
        mgr.reset_session().await;
        assert_ne!(mgr.snapshot().await.session_id, before.session_id);

        assert!(mgr.load_checkpoint("before-reset").await);
        let after = mgr.snapshot().await;
        assert_eq!(after.session_id, before.session_id);
        assert_eq!(after.global_issues.len(), 1);
        assert_eq!(after.stages["fast"].status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_load_missing_checkpoint_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        assert!(!mgr.load_checkpoint("nope").await);
    }

    #[tokio::test]
    async fn test_list_checkpoints_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.save_checkpoint("first").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mgr.save_checkpoint("second").await.unwrap();

        let list = mgr.list_checkpoints();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "second");
    }

    #[tokio::test]
    async fn test_load_state_round_trips_through_checkpoint_format() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.start_stage("fast").await;
        let session_id = mgr.session_id().await;

        let fresh = manager(dir.path()).await;
        assert!(fresh.load_state().await);
        assert_eq!(fresh.session_id().await, session_id);
        assert!(!dir.path().join("checkpoints/_temp.json").exists());
    }

    #[tokio::test]
    async fn test_complete_session_sets_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.complete_session().await;
        let snap = mgr.snapshot().await;
        assert_eq!(snap.metadata["status"], serde_json::json!("completed"));
    }

    #[test]
    fn test_session_id_is_eight_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
