// src/status.rs
// Bounded status collection: per-collector timeouts, a single-flight lock,
// and a short-lived cache to absorb stampedes

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Per-collector execution budget
const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a caller may wait for the in-flight collection to finish
const LOCK_BUDGET: Duration = Duration::from_secs(5);
/// Collected results stay fresh this long
const CACHE_TTL: Duration = Duration::from_secs(5);

/// One named status source
pub struct Collector {
    pub name: &'static str,
    pub future: crate::workflow::BoxFuture<'static, Result<Value, String>>,
}

impl Collector {
    pub fn new(
        name: &'static str,
        future: crate::workflow::BoxFuture<'static, Result<Value, String>>,
    ) -> Self {
        Self { name, future }
    }
}

struct CachedEntry {
    at: Instant,
    value: Value,
}

/// Runs collectors concurrently and bounds every axis of the collection:
/// execution time, lock wait, and result staleness. Partial failures land in
/// the `errors` list instead of aborting the whole collection.
pub struct StatusCollector {
    collector_timeout: Duration,
    lock_budget: Duration,
    cache_ttl: Duration,
    collection_lock: Mutex<()>,
    cache: Mutex<HashMap<String, CachedEntry>>,
}

impl Default for StatusCollector {
    fn default() -> Self {
        Self::new(COLLECTOR_TIMEOUT, LOCK_BUDGET, CACHE_TTL)
    }
}

impl StatusCollector {
    pub fn new(collector_timeout: Duration, lock_budget: Duration, cache_ttl: Duration) -> Self {
        Self {
            collector_timeout,
            lock_budget,
            cache_ttl,
            collection_lock: Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Collect all named components. `cache_key` identifies the component
    /// set so differently filtered requests do not share results.
    pub async fn collect(&self, cache_key: &str, collectors: Vec<Collector>) -> Value {
        if let Some(cached) = self.cached(cache_key).await {
            return cached;
        }

        let Ok(_guard) =
            tokio::time::timeout(self.lock_budget, self.collection_lock.lock()).await
        else {
            return serde_json::json!({
                "error": "status collection busy",
                "errors": ["collection lock wait exceeded budget"],
            });
        };

        // Another caller may have filled the cache while we waited
        if let Some(cached) = self.cached(cache_key).await {
            return cached;
        }

        let mut names = Vec::with_capacity(collectors.len());
        let mut futures = Vec::with_capacity(collectors.len());
        for collector in collectors {
            names.push(collector.name);
            futures.push(tokio::time::timeout(self.collector_timeout, collector.future));
        }
        let outcomes = futures::future::join_all(futures).await;

        let mut result = serde_json::Map::new();
        let mut errors: Vec<String> = Vec::new();
        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(value)) => {
                    result.insert(name.to_string(), value);
                }
                Ok(Err(e)) => {
                    warn!(component = name, error = %e, "status collector failed");
                    result.insert(name.to_string(), Value::Null);
                    errors.push(format!("{}: {}", name, e));
                }
                Err(_) => {
                    warn!(component = name, "status collector timed out");
                    result.insert(name.to_string(), Value::Null);
                    errors.push(format!("{}: collection timed out", name));
                }
            }
        }
        result.insert("errors".to_string(), serde_json::json!(errors));
        result.insert(
            "collected_at".to_string(),
            serde_json::json!(crate::progress::store::now_iso()),
        );
        let value = Value::Object(result);

        self.cache.lock().await.insert(
            cache_key.to_string(),
            CachedEntry {
                at: Instant::now(),
                value: value.clone(),
            },
        );
        value
    }

    async fn cached(&self, cache_key: &str) -> Option<Value> {
        let cache = self.cache.lock().await;
        cache.get(cache_key).and_then(|entry| {
            (entry.at.elapsed() < self.cache_ttl).then(|| entry.value.clone())
        })
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_collector(name: &'static str, value: Value) -> Collector {
        Collector::new(name, Box::pin(async move { Ok(value) }))
    }

    #[tokio::test]
    async fn test_collects_all_components() {
        let collector = StatusCollector::default();
        let result = collector
            .collect(
                "all",
                vec![
                    ok_collector("services", serde_json::json!({"up": true})),
                    ok_collector("jobs", serde_json::json!([])),
                ],
            )
            .await;
        assert_eq!(result["services"]["up"], true);
        assert_eq!(result["jobs"], serde_json::json!([]));
        assert_eq!(result["errors"], serde_json::json!([]));
        assert!(result["collected_at"].is_string());
    }

    #[tokio::test]
    async fn test_partial_failure_lands_in_errors() {
        let collector = StatusCollector::default();
        let result = collector
            .collect(
                "partial",
                vec![
                    ok_collector("services", serde_json::json!({})),
                    Collector::new("jobs", Box::pin(async { Err("disk gone".to_string()) })),
                ],
            )
            .await;
        assert_eq!(result["jobs"], Value::Null);
        let errors = result["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().contains("disk gone"));
    }

    #[tokio::test]
    async fn test_slow_collector_times_out() {
        let collector =
            StatusCollector::new(Duration::from_millis(50), LOCK_BUDGET, CACHE_TTL);
        let result = collector
            .collect(
                "slow",
                vec![Collector::new(
                    "stuck",
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(serde_json::json!({}))
                    }),
                )],
            )
            .await;
        assert_eq!(result["stuck"], Value::Null);
        assert!(result["errors"][0]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_cache_serves_repeat_requests() {
        let collector = StatusCollector::default();
        let first = collector
            .collect("k", vec![ok_collector("services", serde_json::json!(1))])
            .await;
        // Second call supplies a different value; the cache must win
        let second = collector
            .collect("k", vec![ok_collector("services", serde_json::json!(2))])
            .await;
        assert_eq!(first["services"], second["services"]);

        collector.clear_cache().await;
        let third = collector
            .collect("k", vec![ok_collector("services", serde_json::json!(3))])
            .await;
        assert_eq!(third["services"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share_cache() {
        let collector = StatusCollector::default();
        let a = collector
            .collect("a", vec![ok_collector("services", serde_json::json!("a"))])
            .await;
        let b = collector
            .collect("b", vec![ok_collector("services", serde_json::json!("b"))])
            .await;
        assert_ne!(a["services"], b["services"]);
    }
}
