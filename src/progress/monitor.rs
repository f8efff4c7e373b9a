// src/progress/monitor.rs
// Subscriber fan-out over the progress directory: OS file-watch when
// available, mtime polling otherwise. Exactly one implementation runs.

use super::store::{ProgressSnapshot, ProgressStore, job_id_from_file_name};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

/// Identical file events inside this window are collapsed
const EVENT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Scan period of the polling fallback
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Snapshot observer. Returning Err drops the subscription.
pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) -> Result<(), String> + Send + Sync>;

/// Observer of every job, used to bridge snapshot changes into the job
/// manager's broadcast path. Returning Err drops the subscription.
pub type AllJobsCallback =
    Arc<dyn Fn(&str, &ProgressSnapshot) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of per-job callbacks shared by both monitor implementations
struct Subscribers {
    inner: std::sync::Mutex<HashMap<String, HashMap<u64, ProgressCallback>>>,
    all: std::sync::Mutex<HashMap<u64, AllJobsCallback>>,
    next_id: AtomicU64,
}

impl Subscribers {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: std::sync::Mutex::new(HashMap::new()),
            all: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn subscribe_all(&self, callback: AllJobsCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut all) = self.all.lock() {
            all.insert(id, callback);
        }
        SubscriptionId(id)
    }

    fn subscribe(&self, job_id: &str, callback: ProgressCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .entry(job_id.to_string())
                .or_default()
                .insert(id, callback);
        }
        debug!(job_id, subscription = id, "subscribed to job updates");
        SubscriptionId(id)
    }

    fn unsubscribe(&self, job_id: &str, id: SubscriptionId) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(set) = inner.get_mut(job_id) {
                set.remove(&id.0);
                if set.is_empty() {
                    inner.remove(job_id);
                }
            }
        }
    }

    /// Invoke every callback registered for the job. Failing callbacks are
    /// removed from the set; other subscribers are unaffected.
    fn notify(&self, job_id: &str, snapshot: &ProgressSnapshot) {
        let callbacks: Vec<(u64, ProgressCallback)> = match self.inner.lock() {
            Ok(inner) => inner
                .get(job_id)
                .map(|set| set.iter().map(|(id, cb)| (*id, cb.clone())).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        let mut failed = Vec::new();
        for (id, callback) in callbacks {
            if let Err(e) = callback(snapshot) {
                warn!(job_id, subscription = id, error = %e, "progress callback failed");
                failed.push(id);
            }
        }
        if !failed.is_empty()
            && let Ok(mut inner) = self.inner.lock()
            && let Some(set) = inner.get_mut(job_id)
        {
            for id in failed {
                set.remove(&id);
            }
            if set.is_empty() {
                inner.remove(job_id);
            }
        }

        let all_callbacks: Vec<(u64, AllJobsCallback)> = match self.all.lock() {
            Ok(all) => all.iter().map(|(id, cb)| (*id, cb.clone())).collect(),
            Err(_) => return,
        };
        let mut all_failed = Vec::new();
        for (id, callback) in all_callbacks {
            if callback(job_id, snapshot).is_err() {
                all_failed.push(id);
            }
        }
        if !all_failed.is_empty() && let Ok(mut all) = self.all.lock() {
            for id in all_failed {
                all.remove(&id);
            }
        }
    }

    fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }
}

/// The two interchangeable fan-out implementations. `create` probes the OS
/// watcher once and picks a single implementation; a strict server never
/// runs both.
pub enum ProgressMonitor {
    Event(EventMonitor),
    Polling(PollingMonitor),
}

impl ProgressMonitor {
    pub fn create(store: Arc<ProgressStore>) -> Self {
        if watcher_available() {
            Self::Event(EventMonitor::new(store))
        } else {
            info!("OS file watcher unavailable, falling back to polling");
            Self::Polling(PollingMonitor::new(store))
        }
    }

    pub fn polling(store: Arc<ProgressStore>) -> Self {
        Self::Polling(PollingMonitor::new(store))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Polling(_) => "polling",
        }
    }

    pub fn subscribe(&self, job_id: &str, callback: ProgressCallback) -> SubscriptionId {
        self.subscribers().subscribe(job_id, callback)
    }

    /// Observe every job's snapshot changes
    pub fn subscribe_all(&self, callback: AllJobsCallback) -> SubscriptionId {
        self.subscribers().subscribe_all(callback)
    }

    pub fn unsubscribe(&self, job_id: &str, id: SubscriptionId) {
        self.subscribers().unsubscribe(job_id, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().subscriber_count()
    }

    pub fn get_current(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.store().read(job_id).ok().flatten()
    }

    /// Delete terminal snapshots older than the cutoff; malformed files are
    /// unlinked unconditionally. Returns the number removed.
    pub fn cleanup_completed(&self, max_age_minutes: u64) -> usize {
        cleanup_completed_files(self.store(), max_age_minutes)
    }

    pub async fn start(&self) {
        match self {
            Self::Event(m) => m.start().await,
            Self::Polling(m) => m.start().await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Self::Event(m) => m.stop().await,
            Self::Polling(m) => m.stop().await,
        }
    }

    fn subscribers(&self) -> &Arc<Subscribers> {
        match self {
            Self::Event(m) => &m.subscribers,
            Self::Polling(m) => &m.subscribers,
        }
    }

    fn store(&self) -> &Arc<ProgressStore> {
        match self {
            Self::Event(m) => &m.store,
            Self::Polling(m) => &m.store,
        }
    }
}

fn watcher_available() -> bool {
    RecommendedWatcher::new(|_res: Result<Event, notify::Error>| {}, Config::default()).is_ok()
}

fn cleanup_completed_files(store: &Arc<ProgressStore>, max_age_minutes: u64) -> usize {
    let Ok(entries) = std::fs::read_dir(store.progress_dir()) else {
        return 0;
    };
    let cutoff = SystemTime::now() - Duration::from_secs(max_age_minutes * 60);
    let mut cleaned = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        if job_id_from_file_name(&name.to_string_lossy()).is_none() {
            continue;
        }
        let path = entry.path();
        match store.read_file(&path) {
            Ok(Some(snapshot)) => {
                let old_enough = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|mtime| mtime < cutoff)
                    .unwrap_or(false);
                if old_enough && snapshot.status.is_terminal() && std::fs::remove_file(&path).is_ok()
                {
                    debug!(file = %path.display(), "cleaned up old progress file");
                    cleaned += 1;
                }
            }
            Ok(None) => {}
            Err(_) => {
                if std::fs::remove_file(&path).is_ok() {
                    debug!(file = %path.display(), "removed corrupted progress file");
                    cleaned += 1;
                }
            }
        }
    }
    cleaned
}

/// Event-driven monitor over an OS directory watch
pub struct EventMonitor {
    store: Arc<ProgressStore>,
    subscribers: Arc<Subscribers>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventMonitor {
    fn new(store: Arc<ProgressStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            subscribers: Subscribers::new(),
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<PathBuf>(1000);
        let mut watcher: RecommendedWatcher = match Watcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    for path in event.paths {
                        let is_job_file = path
                            .file_name()
                            .map(|n| job_id_from_file_name(&n.to_string_lossy()).is_some())
                            .unwrap_or(false);
                        if is_job_file {
                            // try_send keeps the notify callback thread from blocking
                            if let Err(e) = tx.try_send(path) {
                                debug!("progress event dropped (channel full or closed): {}", e);
                            }
                        }
                    }
                }
                Err(e) => warn!("progress watcher notify error: {}", e),
            },
            Config::default(),
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!("failed to create progress watcher: {}", e);
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        if let Err(e) = watcher.watch(self.store.progress_dir(), RecursiveMode::NonRecursive) {
            warn!(
                dir = %self.store.progress_dir().display(),
                "failed to watch progress directory: {}", e
            );
            self.running.store(false, Ordering::SeqCst);
            return;
        }
        info!(dir = %self.store.progress_dir().display(), "started monitoring progress directory");

        let store = self.store.clone();
        let subscribers = self.subscribers.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            // The watcher lives inside the task; dropping it stops the watch
            let _watcher = watcher;
            let mut last_processed: HashMap<PathBuf, Instant> = HashMap::new();

            loop {
                tokio::select! {
                    Some(path) = rx.recv() => {
                        let now = Instant::now();
                        if last_processed
                            .get(&path)
                            .is_some_and(|at| now.duration_since(*at) < EVENT_DEBOUNCE)
                        {
                            continue;
                        }
                        last_processed.insert(path.clone(), now);

                        let Some(job_id) = path
                            .file_name()
                            .and_then(|n| job_id_from_file_name(&n.to_string_lossy()).map(String::from))
                        else {
                            continue;
                        };
                        match store.read_file(&path) {
                            Ok(Some(snapshot)) => subscribers.notify(&job_id, &snapshot),
                            Ok(None) => {}
                            Err(e) => warn!(job_id, "failed to read progress file: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.shutdown_tx.send(false);
        info!("stopped progress directory monitoring");
    }
}

/// Polling fallback: periodic directory scans keyed on file mtimes
pub struct PollingMonitor {
    store: Arc<ProgressStore>,
    subscribers: Arc<Subscribers>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PollingMonitor {
    fn new(store: Arc<ProgressStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            subscribers: Subscribers::new(),
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(dir = %self.store.progress_dir().display(), "started polling progress directory");

        let store = self.store.clone();
        let subscribers = self.subscribers.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut seen_mtimes: HashMap<String, SystemTime> = HashMap::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        Self::scan(&store, &subscribers, &mut seen_mtimes);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    fn scan(
        store: &Arc<ProgressStore>,
        subscribers: &Arc<Subscribers>,
        seen_mtimes: &mut HashMap<String, SystemTime>,
    ) {
        let Ok(entries) = std::fs::read_dir(store.progress_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(job_id) = job_id_from_file_name(&name.to_string_lossy()).map(String::from)
            else {
                continue;
            };
            let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let changed = seen_mtimes
                .get(&job_id)
                .is_none_or(|last| mtime > *last);
            if !changed {
                continue;
            }
            seen_mtimes.insert(job_id.clone(), mtime);
            match store.read_file(&entry.path()) {
                Ok(Some(snapshot)) => subscribers.notify(&job_id, &snapshot),
                Ok(None) => {}
                Err(e) => warn!(job_id, "failed to read progress file: {}", e),
            }
        }
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.shutdown_tx.send(false);
        info!("stopped polling progress directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::store::JobStatus;
    use crate::sanitize::InputSanitizer;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn store(dir: &Path) -> Arc<ProgressStore> {
        Arc::new(ProgressStore::new(dir, InputSanitizer::default(), 1024 * 1024, None).unwrap())
    }

    fn snapshot(job_id: &str, status: JobStatus) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: job_id.to_string(),
            status,
            iteration: 1,
            max_iterations: 10,
            current_stage: "tests".to_string(),
            overall_progress: 10,
            stage_progress: 10,
            message: "working".to_string(),
            timestamp: String::new(),
            error_counts: None,
        }
    }

    #[test]
    fn test_subscribers_notify_and_remove_failing() {
        let subs = Subscribers::new();
        let good_calls = Arc::new(AtomicUsize::new(0));
        let g = good_calls.clone();
        subs.subscribe(
            "j1",
            Arc::new(move |_| {
                g.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        subs.subscribe("j1", Arc::new(|_| Err("broken pipe".to_string())));
        assert_eq!(subs.subscriber_count(), 2);

        subs.notify("j1", &snapshot("j1", JobStatus::Running));
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
        assert_eq!(subs.subscriber_count(), 1);

        subs.notify("j1", &snapshot("j1", JobStatus::Running));
        assert_eq!(good_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_all_sees_every_job() {
        let subs = Subscribers::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let s = seen.clone();
        subs.subscribe_all(Arc::new(move |job_id, _| {
            s.lock().map_err(|_| "poisoned".to_string())?.push(job_id.to_string());
            Ok(())
        }));

        subs.notify("a", &snapshot("a", JobStatus::Running));
        subs.notify("b", &snapshot("b", JobStatus::Running));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);

        // A failing all-jobs callback is dropped like any other
        subs.subscribe_all(Arc::new(|_, _| Err("gone".to_string())));
        subs.notify("c", &snapshot("c", JobStatus::Running));
        subs.notify("d", &snapshot("d", JobStatus::Running));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_unsubscribe_drops_empty_job_entry() {
        let subs = Subscribers::new();
        let id = subs.subscribe("j1", Arc::new(|_| Ok(())));
        subs.unsubscribe("j1", id);
        assert_eq!(subs.subscriber_count(), 0);
        // Unknown job/subscription is a no-op
        subs.unsubscribe("ghost", SubscriptionId(99));
    }

    #[test]
    fn test_notify_other_job_does_not_fire() {
        let subs = Subscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        subs.subscribe(
            "j1",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        subs.notify("j2", &snapshot("j2", JobStatus::Running));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_polling_monitor_fires_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let monitor = ProgressMonitor::polling(store.clone());
        monitor.start().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        monitor.subscribe(
            "j1",
            Arc::new(move |snap| {
                assert_eq!(snap.job_id, "j1");
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        store.write(snapshot("j1", JobStatus::Running)).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);

        monitor.stop().await;
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_get_current_reads_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(snapshot("j1", JobStatus::Completed)).unwrap();
        let monitor = ProgressMonitor::polling(store);
        assert!(monitor.get_current("j1").is_some());
        assert!(monitor.get_current("ghost").is_none());
    }

    #[test]
    fn test_cleanup_removes_old_terminal_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.write(snapshot("done", JobStatus::Completed)).unwrap();
        store.write(snapshot("live", JobStatus::Running)).unwrap();
        std::fs::write(dir.path().join("job-bad.json"), "{corrupt").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // Cutoff of zero minutes makes both written files "old"
        let cleaned = cleanup_completed_files(&store, 0);
        assert_eq!(cleaned, 2);
        assert!(!dir.path().join("job-done.json").exists());
        assert!(dir.path().join("job-live.json").exists());
        assert!(!dir.path().join("job-bad.json").exists());
    }

    #[test]
    fn test_create_probes_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ProgressMonitor::create(store(dir.path()));
        assert!(matches!(monitor.kind(), "event" | "polling"));
    }
}
