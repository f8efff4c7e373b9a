// src/jobs.rs
// Job manager: connection registry, snapshot broadcast, and the background
// loops that reap stale or abandoned jobs

use crate::progress::JobStatus;
use crate::progress::monitor::ProgressMonitor;
use crate::progress::store::{ProgressSnapshot, ProgressStore, job_id_from_file_name};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

/// Per-connection send timeout during a broadcast
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
/// Overall timeout for one broadcast batch
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Progress files older than this with no live connections get deleted
const MAX_JOB_AGE_SECS: u64 = 24 * 60 * 60;
/// A running job whose file has not been touched for this long has stalled
const STALL_TIMEOUT_SECS: u64 = 30 * 60;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(60);

pub const STALL_MESSAGE: &str = "Job timed out (no updates for 30 minutes)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

type ConnectionMap = HashMap<String, HashMap<u64, mpsc::Sender<Value>>>;

/// Owns job-observer connections and the background reaping loops.
/// Connections are outbound JSON channels; the WebSocket gateway drains
/// them. Snapshot changes arrive through the progress monitor, so exactly
/// one directory-watching mechanism runs.
pub struct JobManager {
    store: Arc<ProgressStore>,
    monitor: Arc<ProgressMonitor>,
    connections: Mutex<ConnectionMap>,
    next_conn_id: AtomicU64,
    known_jobs: Mutex<HashSet<String>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(store: Arc<ProgressStore>, monitor: Arc<ProgressMonitor>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            store,
            monitor,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            known_jobs: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ProgressMonitor> {
        &self.monitor
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub async fn add_connection(
        &self,
        job_id: &str,
        sender: mpsc::Sender<Value>,
    ) -> ConnectionId {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().await;
        connections
            .entry(job_id.to_string())
            .or_default()
            .insert(id, sender);
        debug!(job_id, connection = id, "connection registered");
        ConnectionId(id)
    }

    /// Idempotent; drops the job entry once its last connection leaves
    pub async fn remove_connection(&self, job_id: &str, id: ConnectionId) {
        let mut connections = self.connections.lock().await;
        if let Some(set) = connections.get_mut(job_id) {
            set.remove(&id.0);
            if set.is_empty() {
                connections.remove(job_id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.values().map(HashMap::len).sum()
    }

    pub async fn has_connections(&self, job_id: &str) -> bool {
        self.connections.lock().await.contains_key(job_id)
    }

    /// Send `data` to every connection watching `job_id`. Slow or failed
    /// receivers are dropped; the rest are unaffected.
    pub async fn broadcast(&self, job_id: &str, data: &Value) {
        let targets: Vec<(u64, mpsc::Sender<Value>)> = {
            let connections = self.connections.lock().await;
            match connections.get(job_id) {
                Some(set) => set.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return,
            }
        };
        if targets.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(targets.len());
        for (id, tx) in targets {
            let payload = data.clone();
            handles.push((
                id,
                tokio::spawn(async move {
                    tokio::time::timeout(SEND_TIMEOUT, tx.send(payload))
                        .await
                        .map_err(|_| "send timeout".to_string())
                        .and_then(|r| r.map_err(|_| "receiver closed".to_string()))
                }),
            ));
        }

        let deadline = tokio::time::Instant::now() + BROADCAST_TIMEOUT;
        let mut failed = Vec::new();
        for (id, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(reason))) => {
                    debug!(job_id, connection = id, reason, "dropping connection");
                    failed.push(id);
                }
                Ok(Err(_)) => failed.push(id),
                Err(_) => {
                    // Batch deadline hit; drop whatever is still pending
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.lock().await;
            if let Some(set) = connections.get_mut(job_id) {
                for id in failed {
                    set.remove(&id);
                }
                if set.is_empty() {
                    connections.remove(job_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn latest_job_id(&self) -> Option<String> {
        self.store.latest_job_id()
    }

    pub fn get_progress(&self, job_id: &str) -> crate::Result<Option<ProgressSnapshot>> {
        self.store.read(job_id)
    }

    pub async fn stats(&self) -> Value {
        serde_json::json!({
            "running": self.running.load(Ordering::SeqCst),
            "monitor": self.monitor.kind(),
            "active_connections": self.connection_count().await,
            "known_jobs": self.known_jobs.lock().await.len(),
        })
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Start the progress monitor, bridge its notifications into the
    /// broadcast path, and spawn the cleanup and stall loops.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.monitor.start().await;
        let weak: Weak<JobManager> = Arc::downgrade(self);
        self.monitor.subscribe_all(Arc::new(move |job_id: &str, snapshot: &ProgressSnapshot| {
            let Some(manager) = weak.upgrade() else {
                return Err("job manager gone".to_string());
            };
            let job_id = job_id.to_string();
            let value = serde_json::to_value(snapshot).map_err(|e| e.to_string())?;
            tokio::spawn(async move {
                if manager.known_jobs.lock().await.insert(job_id.clone()) {
                    info!(job_id, "new job detected");
                }
                manager.broadcast(&job_id, &value).await;
            });
            Ok(())
        }));

        let mut tasks = self.tasks.lock().await;
        let cleanup = Arc::clone(self);
        tasks.push(tokio::spawn(run_with_backoff(
            "job cleanup",
            CLEANUP_INTERVAL,
            self.shutdown_tx.subscribe(),
            move || {
                let manager = Arc::clone(&cleanup);
                async move { manager.cleanup_tick(MAX_JOB_AGE_SECS).await }
            },
        )));

        let stall = Arc::clone(self);
        tasks.push(tokio::spawn(run_with_backoff(
            "job stall timeout",
            STALL_CHECK_INTERVAL,
            self.shutdown_tx.subscribe(),
            move || {
                let manager = Arc::clone(&stall);
                async move { manager.stall_tick(STALL_TIMEOUT_SECS).await }
            },
        )));
        info!("job manager background loops started");
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.monitor.stop().await;
        let _ = self.shutdown_tx.send(true);
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }
        let _ = self.shutdown_tx.send(false);
        info!("job manager background loops stopped");
    }

    /// Delete progress files older than `max_age_secs` whose jobs nobody is
    /// watching
    pub async fn cleanup_tick(&self, max_age_secs: u64) -> Result<(), String> {
        let entries =
            std::fs::read_dir(self.store.progress_dir()).map_err(|e| e.to_string())?;
        let cutoff = SystemTime::now() - Duration::from_secs(max_age_secs);
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(job_id) = job_id_from_file_name(&name.to_string_lossy()).map(String::from)
            else {
                continue;
            };
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if !old || self.has_connections(&job_id).await {
                continue;
            }
            if std::fs::remove_file(entry.path()).is_ok() {
                info!(job_id, "cleaned up old job");
                self.known_jobs.lock().await.remove(&job_id);
            }
        }
        Ok(())
    }

    /// Rewrite running snapshots whose files have not been updated within
    /// `stall_secs` as failed
    pub async fn stall_tick(&self, stall_secs: u64) -> Result<(), String> {
        let entries =
            std::fs::read_dir(self.store.progress_dir()).map_err(|e| e.to_string())?;
        let cutoff = SystemTime::now() - Duration::from_secs(stall_secs);
        for entry in entries.flatten() {
            let name = entry.file_name();
            if job_id_from_file_name(&name.to_string_lossy()).is_none() {
                continue;
            }
            let stalled_by_mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime <= cutoff)
                .unwrap_or(false);
            if !stalled_by_mtime {
                continue;
            }
            let Ok(Some(mut snapshot)) = self.store.read_file(&entry.path()) else {
                continue;
            };
            if snapshot.status != JobStatus::Running {
                continue;
            }
            snapshot.status = JobStatus::Failed;
            snapshot.message = STALL_MESSAGE.to_string();
            snapshot.timestamp = String::new();
            let job_id = snapshot.job_id.clone();
            if let Err(e) = self.store.write(snapshot) {
                warn!(job_id, "failed to mark stalled job: {}", e);
            } else {
                warn!(job_id, "job timed out and marked as failed");
            }
        }
        Ok(())
    }
}

/// Drive `tick` on `interval`, backing off exponentially on failure (capped
/// at 60s) and giving up after five consecutive failures.
async fn run_with_backoff<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut consecutive_failures: u32 = 0;
    loop {
        let delay = if consecutive_failures == 0 {
            interval
        } else {
            BACKOFF_CAP.min(Duration::from_secs(5) * 2u32.pow(consecutive_failures - 1))
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match tick().await {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    loop_name = name,
                    consecutive_failures, "background loop error: {}", e
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!(loop_name = name, "too many consecutive errors, stopping loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::InputSanitizer;
    use std::path::Path;

    fn store(dir: &Path) -> Arc<ProgressStore> {
        Arc::new(ProgressStore::new(dir, InputSanitizer::default(), 1024 * 1024, None).unwrap())
    }

    fn manager(store: Arc<ProgressStore>) -> Arc<JobManager> {
        let monitor = Arc::new(ProgressMonitor::polling(store.clone()));
        JobManager::new(store, monitor)
    }

    fn snapshot(job_id: &str, status: JobStatus) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: job_id.to_string(),
            status,
            iteration: 1,
            max_iterations: 10,
            current_stage: "iteration_1".to_string(),
            overall_progress: 40,
            stage_progress: 40,
            message: "working".to_string(),
            timestamp: String::new(),
            error_counts: None,
        }
    }

    #[tokio::test]
    async fn test_connection_registry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(store(dir.path()));

        let (tx, _rx) = mpsc::channel(4);
        let id = manager.add_connection("j1", tx).await;
        assert_eq!(manager.connection_count().await, 1);
        assert!(manager.has_connections("j1").await);

        manager.remove_connection("j1", id).await;
        manager.remove_connection("j1", id).await;
        assert_eq!(manager.connection_count().await, 0);
        assert!(!manager.has_connections("j1").await);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_and_drops_closed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(store(dir.path()));

        let (good_tx, mut good_rx) = mpsc::channel(4);
        let (dead_tx, dead_rx) = mpsc::channel(4);
        drop(dead_rx);
        manager.add_connection("j1", good_tx).await;
        manager.add_connection("j1", dead_tx).await;

        let payload = serde_json::json!({"status": "running"});
        manager.broadcast("j1", &payload).await;

        assert_eq!(good_rx.recv().await.unwrap(), payload);
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(store(dir.path()));
        manager.broadcast("ghost", &serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn test_started_manager_bridges_monitor_to_connections() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manager = manager(store.clone());
        manager.start().await;

        let (tx, mut rx) = mpsc::channel(4);
        manager.add_connection("j1", tx).await;
        store.write(snapshot("j1", JobStatus::Running)).unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("broadcast within poll interval")
            .unwrap();
        assert_eq!(seen["job_id"], "j1");
        assert_eq!(manager.stats().await["known_jobs"], 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_tick_spares_watched_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manager = manager(store.clone());

        store.write(snapshot("watched", JobStatus::Completed)).unwrap();
        store.write(snapshot("orphan", JobStatus::Completed)).unwrap();
        let (tx, _rx) = mpsc::channel(4);
        manager.add_connection("watched", tx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.cleanup_tick(0).await.unwrap();
        assert!(dir.path().join("job-watched.json").exists());
        assert!(!dir.path().join("job-orphan.json").exists());
    }

    #[tokio::test]
    async fn test_stall_tick_rewrites_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manager = manager(store.clone());

        store.write(snapshot("stuck", JobStatus::Running)).unwrap();
        store.write(snapshot("done", JobStatus::Completed)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.stall_tick(0).await.unwrap();

        let stuck = store.read("stuck").unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Failed);
        assert_eq!(stuck.message, STALL_MESSAGE);
        let done = store.read("done").unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_latest_job_id_and_get_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manager = manager(store.clone());

        assert!(manager.latest_job_id().is_none());
        store.write(snapshot("j1", JobStatus::Running)).unwrap();
        assert_eq!(manager.latest_job_id().as_deref(), Some("j1"));
        assert!(manager.get_progress("j1").unwrap().is_some());
        assert!(manager.get_progress("../evil").is_err());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(store(dir.path()));
        manager.start().await;
        manager.start().await;
        manager.stop().await;
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_backoff_stops_after_max_failures() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        run_with_backoff(
            "always fails",
            Duration::from_millis(1),
            rx,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CONSECUTIVE_FAILURES as u64);
    }
}
