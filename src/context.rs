// src/context.rs
// Composition root: owns every subsystem, orders startup and shutdown

use crate::cache::ErrorCache;
use crate::config::ServerConfig;
use crate::error::CrackerjackError;
use crate::jobs::JobManager;
use crate::limits::RateLimitMiddleware;
use crate::progress::monitor::ProgressMonitor;
use crate::progress::store::{ProgressSnapshot, ProgressStore, now_iso};
use crate::sanitize::{InputSanitizer, ValidationResult};
use crate::state::StateManager;
use crate::status::{Collector, StatusCollector};
use crate::workflow::{BoxFuture, WorkflowOrchestrator};
use crate::writer::BatchedWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Bound of the in-process progress event queue
const PROGRESS_QUEUE_SIZE: usize = 1000;

/// Registered startup/shutdown step
pub type TaskFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// All status components the collector knows
pub const STATUS_COMPONENTS: [&str; 3] = ["services", "jobs", "server_stats"];

/// Builds a [`ServerContext`], carrying the tasks to run around
/// initialisation. Nothing is started until `initialize` runs.
pub struct ContextBuilder {
    config: ServerConfig,
    orchestrator: Arc<dyn WorkflowOrchestrator>,
    startup_tasks: Vec<TaskFn>,
    shutdown_tasks: Vec<TaskFn>,
}

impl ContextBuilder {
    pub fn new(config: ServerConfig, orchestrator: Arc<dyn WorkflowOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            startup_tasks: Vec::new(),
            shutdown_tasks: Vec::new(),
        }
    }

    pub fn add_startup_task(mut self, task: TaskFn) -> Self {
        self.startup_tasks.push(task);
        self
    }

    pub fn add_shutdown_task(mut self, task: TaskFn) -> Self {
        self.shutdown_tasks.push(task);
        self
    }

    /// Run the ordered initialisation sequence, rolling back started
    /// components on any failure.
    pub async fn initialize(self) -> crate::Result<Arc<ServerContext>> {
        let config = self.config;
        let sanitizer = InputSanitizer::new(config.validator.clone());

        // 1. Directories
        let progress_dir = config.progress_dir();
        let state_dir = config.state_dir();
        let cache_dir = config.cache_dir();
        for dir in [&progress_dir, &state_dir, &cache_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                CrackerjackError::Config(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        // 2. State manager bound to the batched writer
        let batched_writer = BatchedWriter::new(&config.writer);
        let state_manager = Arc::new(
            StateManager::new(&state_dir, Some(batched_writer.clone())).map_err(|e| {
                CrackerjackError::Config(format!("state manager init failed: {}", e))
            })?,
        );

        // 3. Error cache
        let error_cache = Arc::new(ErrorCache::new(&cache_dir).map_err(|e| {
            CrackerjackError::Config(format!("error cache init failed: {}", e))
        })?);

        // 4. Rate-limit middleware
        let rate_limiter = RateLimitMiddleware::new(config.rate_limits.clone());
        rate_limiter.start().await;

        // 5. Batched writer
        batched_writer.start().await;

        // 6. Progress store + job manager over the bounded event queue
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_QUEUE_SIZE);
        let progress_store = match ProgressStore::new(
            &progress_dir,
            sanitizer.clone(),
            config.rate_limits.max_file_size_bytes(),
            Some(progress_tx),
        ) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                rate_limiter.stop().await;
                batched_writer.stop().await;
                return Err(CrackerjackError::Config(format!(
                    "progress store init failed: {}",
                    e
                )));
            }
        };
        let progress_monitor = Arc::new(ProgressMonitor::create(progress_store.clone()));
        let job_manager = JobManager::new(progress_store.clone(), progress_monitor);
        job_manager.start().await;

        // 7. Informational Git probe
        match git2::Repository::discover(&config.project_path) {
            Ok(repo) => {
                if let Some(workdir) = repo.workdir() {
                    info!(git_root = %workdir.display(), "git repository detected");
                }
            }
            Err(e) => debug!("no git repository detected: {}", e),
        }

        let context = Arc::new(ServerContext {
            config,
            sanitizer,
            batched_writer,
            state_manager,
            error_cache,
            rate_limiter,
            progress_store,
            job_manager,
            status: StatusCollector::default(),
            orchestrator: self.orchestrator,
            progress_rx: Mutex::new(Some(progress_rx)),
            shutdown_tasks: Mutex::new(self.shutdown_tasks),
            initialized: AtomicBool::new(false),
            started_at: Instant::now(),
        });

        // 8. Startup tasks, in registration order
        for (index, task) in self.startup_tasks.iter().enumerate() {
            if let Err(e) = task().await {
                context.rollback().await;
                return Err(CrackerjackError::Config(format!(
                    "startup task {} failed: {}",
                    index, e
                )));
            }
        }

        context.initialized.store(true, Ordering::SeqCst);
        info!("server context initialized");
        Ok(context)
    }
}

/// The assembled server. Components are owned by value; none of them hold a
/// pointer back to the context.
pub struct ServerContext {
    pub config: ServerConfig,
    pub sanitizer: InputSanitizer,
    pub batched_writer: Arc<BatchedWriter>,
    pub state_manager: Arc<StateManager>,
    pub error_cache: Arc<ErrorCache>,
    pub rate_limiter: Arc<RateLimitMiddleware>,
    pub progress_store: Arc<ProgressStore>,
    pub job_manager: Arc<JobManager>,
    pub status: StatusCollector,
    pub orchestrator: Arc<dyn WorkflowOrchestrator>,
    progress_rx: Mutex<Option<mpsc::Receiver<ProgressSnapshot>>>,
    shutdown_tasks: Mutex<Vec<TaskFn>>,
    initialized: AtomicBool,
    started_at: Instant,
}

impl ServerContext {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Hand the in-process progress event stream to its single consumer
    pub async fn take_progress_receiver(&self) -> Option<mpsc::Receiver<ProgressSnapshot>> {
        self.progress_rx.lock().await.take()
    }

    pub fn validate_job_id(&self, job_id: &str) -> ValidationResult {
        self.sanitizer.validate_job_id(job_id)
    }

    pub fn progress_file_path(&self, job_id: &str) -> crate::Result<PathBuf> {
        self.progress_store.file_path(job_id)
    }

    pub async fn schedule_state_save(&self, key: &str, save: crate::writer::SaveFn) {
        self.batched_writer.schedule(key, save).await;
    }

    pub fn current_time(&self) -> String {
        now_iso()
    }

    /// Run shutdown tasks in reverse order, then stop every component.
    /// Every step is best-effort; one failure never blocks the next.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.shutdown_tasks.lock().await);
        for task in tasks.iter().rev() {
            if let Err(e) = task().await {
                warn!("error during shutdown task: {}", e);
            }
        }
        self.rollback().await;
        info!("server context shut down");
    }

    async fn rollback(&self) {
        self.job_manager.stop().await;
        self.rate_limiter.stop().await;
        self.batched_writer.stop().await;
    }

    pub async fn context_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "initialized": self.is_initialized(),
            "stdio_mode": self.config.stdio_mode,
            "project_path": self.config.project_path.display().to_string(),
            "progress_dir": self.progress_store.progress_dir().display().to_string(),
            "uptime_seconds": self.uptime_seconds(),
            "components": {
                "state_manager": true,
                "error_cache": true,
                "rate_limiter": true,
                "batched_writer": true,
                "job_manager": true,
            },
            "progress_queue": {
                "maxsize": PROGRESS_QUEUE_SIZE,
                "dropped_events": self.progress_store.dropped_events(),
            },
        })
    }

    /// Concurrent, bounded collection of the requested status components
    pub async fn comprehensive_status(
        self: &Arc<Self>,
        components: Option<&[String]>,
    ) -> serde_json::Value {
        let wanted: Vec<&str> = match components {
            Some(filter) => STATUS_COMPONENTS
                .iter()
                .copied()
                .filter(|c| filter.iter().any(|f| f == c))
                .collect(),
            None => STATUS_COMPONENTS.to_vec(),
        };
        if wanted.is_empty() {
            return serde_json::json!({
                "errors": ["no known components requested"],
                "known_components": STATUS_COMPONENTS,
            });
        }

        let mut collectors = Vec::with_capacity(wanted.len());
        for name in &wanted {
            collectors.push(match *name {
                "services" => self.services_collector(),
                "jobs" => self.jobs_collector(),
                _ => self.server_stats_collector(),
            });
        }
        let cache_key = wanted.join(",");
        self.status.collect(&cache_key, collectors).await
    }

    fn services_collector(self: &Arc<Self>) -> Collector {
        let context = Arc::clone(self);
        Collector::new(
            "services",
            Box::pin(async move {
                let writer_stats = context.batched_writer.stats().await;
                Ok(serde_json::json!({
                    "context": context.context_stats().await,
                    "batched_writer": writer_stats,
                }))
            }),
        )
    }

    fn jobs_collector(self: &Arc<Self>) -> Collector {
        let context = Arc::clone(self);
        Collector::new(
            "jobs",
            Box::pin(async move {
                let jobs: Vec<serde_json::Value> = context
                    .progress_store
                    .list_jobs()
                    .into_iter()
                    .map(|s| {
                        serde_json::json!({
                            "job_id": s.job_id,
                            "status": s.status.as_str(),
                            "progress": s.overall_progress,
                            "message": s.message,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({
                    "jobs": jobs,
                    "latest_job_id": context.progress_store.latest_job_id(),
                    "active_slots": context
                        .rate_limiter
                        .resource_monitor()
                        .active_job_count()
                        .await,
                }))
            }),
        )
    }

    fn server_stats_collector(self: &Arc<Self>) -> Collector {
        let context = Arc::clone(self);
        Collector::new(
            "server_stats",
            Box::pin(async move {
                Ok(serde_json::json!({
                    "rate_limiting": context.rate_limiter.comprehensive_stats().await,
                    "error_cache": context.error_cache.stats().await,
                    "job_manager": context.job_manager.stats().await,
                    "session": context.state_manager.session_summary().await,
                }))
            }),
        )
    }
}
