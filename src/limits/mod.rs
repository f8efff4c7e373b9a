// src/limits/mod.rs
// Per-client rate limiting and job-slot admission control

use crate::config::RateLimitConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// How long a job-slot acquire may wait before the admission decision
/// comes back negative
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Cadence of the middleware's stale-job sweep
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute_requests_remaining: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour_requests_remaining: Option<usize>,
}

impl RateDecision {
    fn allowed(minute_remaining: usize, hour_remaining: usize) -> Self {
        Self {
            allowed: true,
            reason: None,
            limit: None,
            window: None,
            retry_after_seconds: None,
            minute_requests_remaining: Some(minute_remaining),
            hour_requests_remaining: Some(hour_remaining),
        }
    }

    fn denied(reason: &str, limit: Option<usize>, window: Option<&str>, retry_after: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            limit,
            window: window.map(String::from),
            retry_after_seconds: Some(retry_after),
            minute_requests_remaining: None,
            hour_requests_remaining: None,
        }
    }
}

#[derive(Default)]
struct Windows {
    minute: HashMap<String, VecDeque<Instant>>,
    hour: HashMap<String, VecDeque<Instant>>,
    global_minute: VecDeque<Instant>,
    global_hour: VecDeque<Instant>,
}

/// Sliding-window rate limiter: per-client minute/hour windows plus global
/// windows at 10x capacity. One mutex guards all four.
pub struct RateLimiter {
    requests_per_minute: usize,
    requests_per_hour: usize,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: usize, requests_per_hour: usize) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub async fn is_allowed(&self, client_id: &str) -> RateDecision {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        Self::evict(&mut windows, now);

        let minute_count = windows.minute.get(client_id).map_or(0, VecDeque::len);
        let hour_count = windows.hour.get(client_id).map_or(0, VecDeque::len);

        if minute_count >= self.requests_per_minute {
            return RateDecision::denied(
                "minute_limit_exceeded",
                Some(self.requests_per_minute),
                Some("1 minute"),
                60,
            );
        }
        if hour_count >= self.requests_per_hour {
            return RateDecision::denied(
                "hour_limit_exceeded",
                Some(self.requests_per_hour),
                Some("1 hour"),
                3600,
            );
        }
        if windows.global_minute.len() >= self.requests_per_minute * 10 {
            return RateDecision::denied("global_minute_limit_exceeded", None, None, 60);
        }
        if windows.global_hour.len() >= self.requests_per_hour * 10 {
            return RateDecision::denied("global_hour_limit_exceeded", None, None, 3600);
        }

        windows
            .minute
            .entry(client_id.to_string())
            .or_default()
            .push_back(now);
        windows
            .hour
            .entry(client_id.to_string())
            .or_default()
            .push_back(now);
        windows.global_minute.push_back(now);
        windows.global_hour.push_back(now);

        RateDecision::allowed(
            self.requests_per_minute - minute_count - 1,
            self.requests_per_hour - hour_count - 1,
        )
    }

    fn evict(windows: &mut Windows, now: Instant) {
        let expired = |window: &mut VecDeque<Instant>, age: Duration| {
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= age)
            {
                window.pop_front();
            }
        };

        for window in windows.minute.values_mut() {
            expired(window, MINUTE);
        }
        for window in windows.hour.values_mut() {
            expired(window, HOUR);
        }
        windows.minute.retain(|_, w| !w.is_empty());
        windows.hour.retain(|_, w| !w.is_empty());
        expired(&mut windows.global_minute, MINUTE);
        expired(&mut windows.global_hour, HOUR);
    }

    pub async fn stats(&self) -> serde_json::Value {
        let mut windows = self.windows.lock().await;
        Self::evict(&mut windows, Instant::now());
        serde_json::json!({
            "active_clients": windows.minute.len(),
            "global_minute_requests": windows.global_minute.len(),
            "global_hour_requests": windows.global_hour.len(),
            "limits": {
                "requests_per_minute": self.requests_per_minute,
                "requests_per_hour": self.requests_per_hour,
            },
        })
    }
}

struct JobSlot {
    started: Instant,
    // Dropping the slot returns the permit, which keeps the number of
    // active jobs bounded by the semaphore capacity by construction.
    _permit: OwnedSemaphorePermit,
}

/// Semaphore-bounded pool of job slots with a staleness reaper and file
/// size/count checks.
pub struct ResourceMonitor {
    config: RateLimitConfig,
    semaphore: Arc<Semaphore>,
    active_jobs: Mutex<HashMap<String, JobSlot>>,
}

impl ResourceMonitor {
    pub fn new(config: RateLimitConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            config,
            semaphore,
            active_jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take a job slot. The wait is bounded so admission stays prompt.
    pub async fn acquire(&self, job_id: &str) -> bool {
        let permit = match tokio::time::timeout(
            ACQUIRE_TIMEOUT,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(
                    job_id,
                    max = self.config.max_concurrent_jobs,
                    "job rejected: max concurrent jobs reached"
                );
                return false;
            }
        };

        let mut jobs = self.active_jobs.lock().await;
        jobs.insert(
            job_id.to_string(),
            JobSlot {
                started: Instant::now(),
                _permit: permit,
            },
        );
        info!(
            job_id,
            active = jobs.len(),
            max = self.config.max_concurrent_jobs,
            "job slot acquired"
        );
        true
    }

    pub async fn release(&self, job_id: &str) {
        let mut jobs = self.active_jobs.lock().await;
        if let Some(slot) = jobs.remove(job_id) {
            debug!(
                job_id,
                duration_secs = slot.started.elapsed().as_secs_f64(),
                active = jobs.len(),
                "job slot released"
            );
        }
    }

    /// Force-release slots held longer than the configured job duration
    pub async fn cleanup_stale(&self) -> usize {
        let max_age = Duration::from_secs(self.config.max_job_duration_minutes * 60);
        let mut jobs = self.active_jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, slot| slot.started.elapsed() <= max_age);
        let cleaned = before - jobs.len();
        if cleaned > 0 {
            info!(
                cleaned,
                max_minutes = self.config.max_job_duration_minutes,
                "cleaned up stale jobs"
            );
        }
        cleaned
    }

    /// False when the file exists and exceeds the configured size cap
    pub fn check_file_size(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) => {
                if meta.len() > self.config.max_file_size_bytes() {
                    warn!(
                        path = %path.display(),
                        size = meta.len(),
                        limit_mb = self.config.max_file_size_mb,
                        "file exceeds size limit"
                    );
                    false
                } else {
                    true
                }
            }
            Err(_) => true,
        }
    }

    /// False when the progress directory holds more job files than allowed
    pub fn check_progress_dir(&self, progress_dir: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(progress_dir) else {
            return true;
        };
        let count = entries
            .flatten()
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("job-") && name.ends_with(".json")
            })
            .count();
        if count > self.config.max_progress_files {
            warn!(
                count,
                limit = self.config.max_progress_files,
                "progress files exceed limit"
            );
            return false;
        }
        true
    }

    pub async fn active_job_count(&self) -> usize {
        self.active_jobs.lock().await.len()
    }

    pub async fn stats(&self) -> serde_json::Value {
        let jobs = self.active_jobs.lock().await;
        let details: HashMap<&String, serde_json::Value> = jobs
            .iter()
            .map(|(id, slot)| {
                (
                    id,
                    serde_json::json!({ "duration": slot.started.elapsed().as_secs_f64() }),
                )
            })
            .collect();
        serde_json::json!({
            "active_jobs": jobs.len(),
            "max_concurrent_jobs": self.config.max_concurrent_jobs,
            "available_slots": self.semaphore.available_permits(),
            "job_details": details,
            "limits": {
                "max_concurrent_jobs": self.config.max_concurrent_jobs,
                "max_job_duration_minutes": self.config.max_job_duration_minutes,
                "max_file_size_mb": self.config.max_file_size_mb,
                "max_progress_files": self.config.max_progress_files,
            },
        })
    }
}

/// Wraps the rate limiter and resource monitor and owns the periodic
/// stale-job sweep.
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    rate_limiter: RateLimiter,
    resource_monitor: ResourceMonitor,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            rate_limiter: RateLimiter::new(config.requests_per_minute, config.requests_per_hour),
            resource_monitor: ResourceMonitor::new(config.clone()),
            config,
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Start the periodic cleanup task. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let middleware = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        middleware.resource_monitor.cleanup_stale().await;
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
        info!("Rate limiting middleware started");
    }

    /// Stop and await the cleanup task. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.shutdown_tx.send(false);
        info!("Rate limiting middleware stopped");
    }

    pub async fn check_request_allowed(&self, client_id: &str) -> RateDecision {
        self.rate_limiter.is_allowed(client_id).await
    }

    pub async fn acquire_job_resources(&self, job_id: &str) -> bool {
        self.resource_monitor.acquire(job_id).await
    }

    pub async fn release_job_resources(&self, job_id: &str) {
        self.resource_monitor.release(job_id).await
    }

    pub fn validate_file_size(&self, path: &Path) -> bool {
        self.resource_monitor.check_file_size(path)
    }

    pub fn validate_progress_files(&self, progress_dir: &Path) -> bool {
        self.resource_monitor.check_progress_dir(progress_dir)
    }

    pub fn resource_monitor(&self) -> &ResourceMonitor {
        &self.resource_monitor
    }

    pub async fn comprehensive_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "rate_limiting": self.rate_limiter.stats().await,
            "resource_usage": self.resource_monitor.stats().await,
            "config": {
                "requests_per_minute": self.config.requests_per_minute,
                "requests_per_hour": self.config.requests_per_hour,
                "max_concurrent_jobs": self.config.max_concurrent_jobs,
                "max_job_duration_minutes": self.config.max_job_duration_minutes,
            },
        })
    }
}
