// src/writer.rs
// Debounced, key-coalescing writer for state save callbacks

use crate::config::WriterConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

/// A pending save callback. Per key, the latest scheduled one wins.
pub type SaveFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    saves: HashMap<String, (SaveFn, Instant)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriterStats {
    pub running: bool,
    pub pending_saves: usize,
    pub debounce_delay: f64,
    pub max_batch_size: usize,
}

/// Coalesces save callbacks per key and flushes them on a debounce timer,
/// or immediately once the pending count reaches the batch cap.
pub struct BatchedWriter {
    debounce: Duration,
    max_batch_size: usize,
    pending: Mutex<Pending>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BatchedWriter {
    pub fn new(config: &WriterConfig) -> Arc<Self> {
        let delay = if config.debounce_delay > 0.0 {
            config.debounce_delay
        } else {
            1.0
        };
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            debounce: Duration::from_secs_f64(delay),
            max_batch_size: config.max_batch_size.max(1),
            pending: Mutex::new(Pending::default()),
            running: AtomicBool::new(false),
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    /// Start the background flush loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let writer = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(writer.debounce) => {
                        writer.flush_ready().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.worker.lock().await = Some(handle);
        debug!("Batched writer started");
    }

    /// Stop the loop and flush everything still pending. Idempotent, and
    /// the flush happens even when the loop never started.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            if let Some(handle) = self.worker.lock().await.take() {
                let _ = handle.await;
            }
            let _ = self.shutdown_tx.send(false);
            debug!("Batched writer stopped");
        }
        self.flush_all().await;
    }

    /// Schedule a save under `key`, replacing any pending save for it.
    /// Reaching the batch cap flushes immediately.
    pub async fn schedule(&self, key: &str, save: SaveFn) {
        let flush_now = {
            let mut pending = self.pending.lock().await;
            pending.saves.insert(key.to_string(), (save, Instant::now()));
            pending.saves.len() >= self.max_batch_size
        };
        if flush_now {
            self.flush_all().await;
        }
    }

    /// Flush saves whose scheduling age has reached the debounce delay
    async fn flush_ready(&self) {
        let ready: Vec<(String, SaveFn)> = {
            let mut pending = self.pending.lock().await;
            let now = Instant::now();
            let keys: Vec<String> = pending
                .saves
                .iter()
                .filter(|(_, (_, at))| now.duration_since(*at) >= self.debounce)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.saves.remove(&k).map(|(f, _)| (k, f)))
                .collect()
        };
        Self::run_saves(ready);
    }

    /// Flush everything pending, regardless of age
    pub async fn flush_all(&self) {
        let drained: Vec<(String, SaveFn)> = {
            let mut pending = self.pending.lock().await;
            pending.saves.drain().map(|(k, (f, _))| (k, f)).collect()
        };
        Self::run_saves(drained);
    }

    fn run_saves(saves: Vec<(String, SaveFn)>) {
        for (key, save) in saves {
            // A panicking callback must not take the flush loop down with it
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(save)).is_err() {
                warn!(key = %key, "save callback panicked");
            }
        }
    }

    pub async fn stats(&self) -> WriterStats {
        WriterStats {
            running: self.running.load(Ordering::SeqCst),
            pending_saves: self.pending.lock().await.saves.len(),
            debounce_delay: self.debounce.as_secs_f64(),
            max_batch_size: self.max_batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(debounce: f64, batch: usize) -> WriterConfig {
        WriterConfig {
            debounce_delay: debounce,
            max_batch_size: batch,
        }
    }

    #[tokio::test]
    async fn test_flush_after_debounce() {
        let writer = BatchedWriter::new(&config(0.05, 10));
        writer.start().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        writer
            .schedule("k", Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        writer.stop().await;
    }

    #[tokio::test]
    async fn test_latest_save_wins_per_key() {
        let writer = BatchedWriter::new(&config(0.05, 10));
        writer.start().await;

        let counter = Arc::new(AtomicUsize::new(0));
        for add in [10usize, 100] {
            let c = counter.clone();
            writer
                .schedule("same", Box::new(move || {
                    c.fetch_add(add, Ordering::SeqCst);
                }))
                .await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        writer.stop().await;
    }

    #[tokio::test]
    async fn test_batch_cap_flushes_immediately() {
        let writer = BatchedWriter::new(&config(60.0, 2));

        let counter = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let c = counter.clone();
            writer
                .schedule(key, Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }

        // No loop running and a 60s debounce: only the cap can have flushed
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(writer.stats().await.pending_saves, 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_and_is_idempotent() {
        let writer = BatchedWriter::new(&config(60.0, 10));
        writer.start().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        writer
            .schedule("k", Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        writer.stop().await;
        writer.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_kill_loop() {
        let writer = BatchedWriter::new(&config(0.05, 10));
        writer.start().await;

        writer
            .schedule("boom", Box::new(|| panic!("save failed")))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        writer
            .schedule("ok", Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        writer.stop().await;
    }
}
