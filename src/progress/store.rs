// src/progress/store.rs
// Per-job progress snapshots, one pretty-printed JSON file per job

use crate::error::CrackerjackError;
use crate::sanitize::InputSanitizer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// The materialised state of one job. Progress fields are clamped to 0..100
/// on every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_stage: String,
    pub overall_progress: u32,
    pub stage_progress: u32,
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_counts: Option<HashMap<String, u64>>,
}

impl ProgressSnapshot {
    /// The synthetic frame sent to subscribers before a job has written
    /// anything.
    pub fn waiting(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::Waiting,
            iteration: 0,
            max_iterations: 10,
            current_stage: "Initializing".to_string(),
            overall_progress: 0,
            stage_progress: 0,
            message: "Waiting for job to start...".to_string(),
            timestamp: now_iso(),
            error_counts: None,
        }
    }

    fn clamp(&mut self) {
        self.overall_progress = self.overall_progress.min(100);
        self.stage_progress = self.stage_progress.min(100);
    }
}

pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Extract `<id>` from a `job-<id>.json` file name
pub fn job_id_from_file_name(name: &str) -> Option<&str> {
    name.strip_prefix("job-")?.strip_suffix(".json")
}

/// Authoritative producer side of progress events. Writers validate job ids,
/// clamp progress, replace the whole file, and notify the bounded progress
/// queue; readers re-validate the path and enforce the size cap.
pub struct ProgressStore {
    progress_dir: PathBuf,
    sanitizer: InputSanitizer,
    max_file_size: u64,
    events_tx: Option<mpsc::Sender<ProgressSnapshot>>,
    dropped_events: AtomicU64,
}

impl ProgressStore {
    pub fn new(
        progress_dir: &Path,
        sanitizer: InputSanitizer,
        max_file_size: u64,
        events_tx: Option<mpsc::Sender<ProgressSnapshot>>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(progress_dir)?;
        Ok(Self {
            progress_dir: progress_dir.to_path_buf(),
            sanitizer,
            max_file_size,
            events_tx,
            dropped_events: AtomicU64::new(0),
        })
    }

    pub fn progress_dir(&self) -> &Path {
        &self.progress_dir
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Path of the snapshot file for a validated job id
    pub fn file_path(&self, job_id: &str) -> crate::Result<PathBuf> {
        let result = self.sanitizer.validate_job_id(job_id);
        if !result.valid {
            return Err(CrackerjackError::InvalidInput(format!(
                "Invalid job_id: {}",
                result.error()
            )));
        }
        let path = self.progress_dir.join(format!("job-{}.json", job_id));
        if !path.starts_with(&self.progress_dir) {
            return Err(CrackerjackError::InvalidInput(format!(
                "Invalid job_id: {}",
                job_id
            )));
        }
        Ok(path)
    }

    /// Write a snapshot with whole-file replacement (write to a temp file in
    /// the same directory, then rename over the target).
    pub fn write(&self, mut snapshot: ProgressSnapshot) -> crate::Result<()> {
        let path = self.file_path(&snapshot.job_id)?;
        snapshot.clamp();
        if snapshot.timestamp.is_empty() {
            snapshot.timestamp = now_iso();
        }
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        if std::fs::rename(&tmp, &path).is_err() {
            // Rename can fail across filesystems; fall back to a plain overwrite
            std::fs::write(&path, &json)?;
            let _ = std::fs::remove_file(&tmp);
        }

        self.notify(snapshot);
        Ok(())
    }

    /// Queue the snapshot for in-process observers. A full queue drops the
    /// new event and counts it; progress updates are never load-bearing.
    fn notify(&self, snapshot: ProgressSnapshot) {
        if let Some(tx) = &self.events_tx {
            if tx.try_send(snapshot).is_err() {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Read the current snapshot for a job, or None when no file exists
    pub fn read(&self, job_id: &str) -> crate::Result<Option<ProgressSnapshot>> {
        let path = self.file_path(job_id)?;
        self.read_file(&path)
    }

    /// Read and parse a snapshot file, enforcing containment and size caps
    pub fn read_file(&self, path: &Path) -> crate::Result<Option<ProgressSnapshot>> {
        if !path.starts_with(&self.progress_dir) {
            return Err(CrackerjackError::InvalidInput(format!(
                "Path outside progress directory: {}",
                path.display()
            )));
        }
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if meta.len() > self.max_file_size {
            return Err(CrackerjackError::InvalidInput(format!(
                "Progress file too large: {} bytes",
                meta.len()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Snapshot summaries for every valid job file in the directory
    pub fn list_jobs(&self) -> Vec<ProgressSnapshot> {
        let Ok(entries) = std::fs::read_dir(&self.progress_dir) else {
            return Vec::new();
        };
        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(job_id) = job_id_from_file_name(&name.to_string_lossy()).map(String::from)
            else {
                continue;
            };
            if !self.sanitizer.validate_job_id(&job_id).valid {
                debug!(job_id, "skipping job file with invalid id");
                continue;
            }
            match self.read_file(&entry.path()) {
                Ok(Some(snapshot)) => jobs.push(snapshot),
                Ok(None) => {}
                Err(e) => warn!(job_id, error = %e, "failed to read progress file"),
            }
        }
        jobs
    }

    /// Job id of the most recently written snapshot file, by mtime
    pub fn latest_job_id(&self) -> Option<String> {
        let entries = std::fs::read_dir(&self.progress_dir).ok()?;
        let mut latest: Option<(std::time::SystemTime, String)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(job_id) = job_id_from_file_name(&name.to_string_lossy()).map(String::from)
            else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            if latest.as_ref().is_none_or(|(best, _)| mtime > *best) {
                latest = Some((mtime, job_id));
            }
        }
        latest.map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> ProgressStore {
        ProgressStore::new(dir, InputSanitizer::default(), 1024 * 1024, None).unwrap()
    }

    fn snapshot(job_id: &str, status: JobStatus, overall: u32) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: job_id.to_string(),
            status,
            iteration: 1,
            max_iterations: 10,
            current_stage: "iteration_1".to_string(),
            overall_progress: overall,
            stage_progress: 50,
            message: "working".to_string(),
            timestamp: String::new(),
            error_counts: None,
        }
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(snapshot("abc", JobStatus::Running, 40)).unwrap();

        let read = store.read("abc").unwrap().unwrap();
        assert_eq!(read.job_id, "abc");
        assert_eq!(read.status, JobStatus::Running);
        assert_eq!(read.overall_progress, 40);
        assert!(!read.timestamp.is_empty());
        assert!(dir.path().join("job-abc.json").exists());
    }

    #[test]
    fn test_write_clamps_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(snapshot("abc", JobStatus::Running, 400)).unwrap();
        let read = store.read("abc").unwrap().unwrap();
        assert_eq!(read.overall_progress, 100);
    }

    #[test]
    fn test_invalid_job_id_rejected_without_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store.write(snapshot("../etc/passwd", JobStatus::Running, 1));
        assert!(err.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(store.read("../etc/passwd").is_err());
    }

    #[test]
    fn test_read_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read("ghost").unwrap().is_none());
    }

    #[test]
    fn test_read_enforces_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), InputSanitizer::default(), 4, None).unwrap();
        std::fs::write(dir.path().join("job-big.json"), "{\"padding\": true}").unwrap();
        assert!(store.read("big").is_err());
    }

    #[test]
    fn test_read_rejects_path_outside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.read_file(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_list_jobs_skips_invalid_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(snapshot("good", JobStatus::Completed, 100)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let jobs = store.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "good");
    }

    #[test]
    fn test_latest_job_id_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(snapshot("first", JobStatus::Running, 10)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.write(snapshot("second", JobStatus::Running, 20)).unwrap();

        assert_eq!(store.latest_job_id().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let store =
            ProgressStore::new(dir.path(), InputSanitizer::default(), 1024 * 1024, Some(tx))
                .unwrap();

        store.write(snapshot("a", JobStatus::Running, 1)).unwrap();
        store.write(snapshot("b", JobStatus::Running, 2)).unwrap();

        assert_eq!(store.dropped_events(), 1);
        assert_eq!(rx.recv().await.unwrap().job_id, "a");
    }

    #[test]
    fn test_job_id_from_file_name() {
        assert_eq!(job_id_from_file_name("job-abc.json"), Some("abc"));
        assert_eq!(job_id_from_file_name("job-.json"), Some(""));
        assert_eq!(job_id_from_file_name("other.json"), None);
        assert_eq!(job_id_from_file_name("job-abc.txt"), None);
    }
}
