// src/cache/mod.rs
// Persistent cache of recurring tool-output error patterns and fix outcomes

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Epoch seconds, the timestamp unit used throughout the cache files
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn default_frequency() -> u64 {
    1
}

/// A recurring error signature extracted from tool output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern_id: String,
    pub error_type: String,
    pub error_code: String,
    pub message_pattern: String,
    #[serde(default)]
    pub file_pattern: Option<String>,
    #[serde(default)]
    pub common_fixes: Vec<String>,
    #[serde(default)]
    pub auto_fixable: bool,
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    #[serde(default = "now_epoch")]
    pub last_seen: f64,
}

/// Outcome of one attempted fix, appended and never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    pub fix_id: String,
    pub pattern_id: String,
    pub success: bool,
    pub files_affected: Vec<String>,
    pub time_taken: f64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Aggregate statistics over the cache contents
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_patterns: usize,
    pub auto_fixable_patterns: usize,
    pub auto_fixable_rate: f64,
    pub total_fix_attempts: usize,
    pub successful_fixes: usize,
    pub fix_success_rate: f64,
    pub average_pattern_frequency: f64,
    pub error_types: HashMap<String, usize>,
}

#[derive(Default)]
struct CacheInner {
    patterns: HashMap<String, ErrorPattern>,
    fix_results: Vec<FixResult>,
}

/// File-backed error-pattern cache. All mutations serialise on one mutex;
/// disk write failures are swallowed (the in-memory view stays authoritative).
pub struct ErrorCache {
    patterns_file: PathBuf,
    fixes_file: PathBuf,
    inner: Mutex<CacheInner>,
}

impl ErrorCache {
    /// Open the cache in `cache_dir`, loading any existing files.
    /// Unparseable files reset the corresponding in-memory view to empty.
    pub fn new(cache_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let patterns_file = cache_dir.join("error_patterns.json");
        let fixes_file = cache_dir.join("fix_results.json");

        let patterns = std::fs::read_to_string(&patterns_file)
            .ok()
            .and_then(|text| serde_json::from_str::<HashMap<String, ErrorPattern>>(&text).ok())
            .unwrap_or_default();
        let fix_results = std::fs::read_to_string(&fixes_file)
            .ok()
            .and_then(|text| serde_json::from_str::<Vec<FixResult>>(&text).ok())
            .unwrap_or_default();

        Ok(Self {
            patterns_file,
            fixes_file,
            inner: Mutex::new(CacheInner {
                patterns,
                fix_results,
            }),
        })
    }

    /// Insert a pattern, or merge into an existing one with the same id:
    /// frequency bumps, last_seen refreshes, common_fixes union.
    pub async fn add_pattern(&self, pattern: ErrorPattern) {
        let mut inner = self.inner.lock().await;
        match inner.patterns.get_mut(&pattern.pattern_id) {
            Some(existing) => {
                existing.frequency += 1;
                existing.last_seen = now_epoch();
                for fix in &pattern.common_fixes {
                    if !existing.common_fixes.contains(fix) {
                        existing.common_fixes.push(fix.clone());
                    }
                }
            }
            None => {
                inner.patterns.insert(pattern.pattern_id.clone(), pattern);
            }
        }
        self.save_patterns(&inner);
    }

    /// Append a fix result. A successful fix marks its pattern auto-fixable
    /// and records a synthetic fix note on it.
    pub async fn add_fix_result(&self, result: FixResult) {
        let mut inner = self.inner.lock().await;
        let pattern_id = result.pattern_id.clone();
        let success = result.success;
        inner.fix_results.push(result);
        if success && let Some(pattern) = inner.patterns.get_mut(&pattern_id) {
            pattern.auto_fixable = true;
            let note = format!("Auto-fix applied for {}", pattern_id);
            if !pattern.common_fixes.contains(&note) {
                pattern.common_fixes.push(note);
            }
        }
        self.save_fixes(&inner);
        self.save_patterns(&inner);
    }

    pub async fn get_pattern(&self, pattern_id: &str) -> Option<ErrorPattern> {
        self.inner.lock().await.patterns.get(pattern_id).cloned()
    }

    pub async fn find_by_type(&self, error_type: &str) -> Vec<ErrorPattern> {
        self.inner
            .lock()
            .await
            .patterns
            .values()
            .filter(|p| p.error_type == error_type)
            .cloned()
            .collect()
    }

    pub async fn find_by_code(&self, error_code: &str) -> Vec<ErrorPattern> {
        self.inner
            .lock()
            .await
            .patterns
            .values()
            .filter(|p| p.error_code == error_code)
            .cloned()
            .collect()
    }

    /// Most frequent patterns, descending
    pub async fn top_by_frequency(&self, limit: usize) -> Vec<ErrorPattern> {
        let mut patterns: Vec<ErrorPattern> =
            self.inner.lock().await.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        patterns.truncate(limit);
        patterns
    }

    pub async fn auto_fixable_only(&self) -> Vec<ErrorPattern> {
        self.inner
            .lock()
            .await
            .patterns
            .values()
            .filter(|p| p.auto_fixable)
            .cloned()
            .collect()
    }

    /// Fraction of fix attempts for a pattern that succeeded; 0 for unknown
    pub async fn fix_success_rate(&self, pattern_id: &str) -> f64 {
        let inner = self.inner.lock().await;
        let attempts: Vec<&FixResult> = inner
            .fix_results
            .iter()
            .filter(|r| r.pattern_id == pattern_id)
            .collect();
        if attempts.is_empty() {
            return 0.0;
        }
        let successes = attempts.iter().filter(|r| r.success).count();
        successes as f64 / attempts.len() as f64
    }

    /// Patterns seen within the last `hours`
    pub async fn recent(&self, hours: u64) -> Vec<ErrorPattern> {
        let cutoff = now_epoch() - (hours as f64 * 3600.0);
        self.inner
            .lock()
            .await
            .patterns
            .values()
            .filter(|p| p.last_seen >= cutoff)
            .cloned()
            .collect()
    }

    /// Parse raw tool output into patterns and store them.
    /// Sections are blank-line separated; within each section the first line
    /// that yields a code or a message of at least 10 characters wins.
    pub async fn analyze_output(&self, output: &str, tool: &str) -> Vec<ErrorPattern> {
        let mut found = Vec::new();
        for section in output.split("\n\n") {
            if section.trim().is_empty() {
                continue;
            }
            if let Some(pattern) = pattern_from_section(section, tool) {
                self.add_pattern(pattern.clone()).await;
                found.push(pattern);
            }
        }
        found
    }

    /// Drop patterns not seen for `days`; returns the number removed
    pub async fn cleanup_old(&self, days: u64) -> usize {
        let cutoff = now_epoch() - (days as f64 * 86400.0);
        let mut inner = self.inner.lock().await;
        let before = inner.patterns.len();
        inner.patterns.retain(|_, p| p.last_seen >= cutoff);
        let removed = before - inner.patterns.len();
        if removed > 0 {
            self.save_patterns(&inner);
        }
        removed
    }

    /// Write a snapshot bundle of the entire cache to `path`
    pub async fn export(&self, path: &Path) -> crate::Result<()> {
        let inner = self.inner.lock().await;
        let stats = stats_of(&inner);
        let bundle = serde_json::json!({
            "export_time": now_epoch(),
            "total_patterns": inner.patterns.len(),
            "patterns": inner.patterns.values().collect::<Vec<_>>(),
            "fix_results": inner.fix_results,
            "stats": stats,
        });
        std::fs::write(path, serde_json::to_string_pretty(&bundle)?)?;
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        stats_of(&*self.inner.lock().await)
    }

    pub async fn pattern_count(&self) -> usize {
        self.inner.lock().await.patterns.len()
    }

    fn save_patterns(&self, inner: &CacheInner) {
        match serde_json::to_string_pretty(&inner.patterns) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.patterns_file, text) {
                    debug!(error = %e, "Failed to persist error patterns");
                }
            }
            Err(e) => debug!(error = %e, "Failed to serialize error patterns"),
        }
    }

    fn save_fixes(&self, inner: &CacheInner) {
        match serde_json::to_string_pretty(&inner.fix_results) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.fixes_file, text) {
                    debug!(error = %e, "Failed to persist fix results");
                }
            }
            Err(e) => debug!(error = %e, "Failed to serialize fix results"),
        }
    }
}

fn stats_of(inner: &CacheInner) -> CacheStats {
    let total_patterns = inner.patterns.len();
    let auto_fixable = inner.patterns.values().filter(|p| p.auto_fixable).count();
    let total_fixes = inner.fix_results.len();
    let successful = inner.fix_results.iter().filter(|r| r.success).count();
    let avg_frequency = if total_patterns == 0 {
        0.0
    } else {
        inner.patterns.values().map(|p| p.frequency).sum::<u64>() as f64 / total_patterns as f64
    };
    let mut error_types: HashMap<String, usize> = HashMap::new();
    for pattern in inner.patterns.values() {
        *error_types.entry(pattern.error_type.clone()).or_insert(0) += 1;
    }

    CacheStats {
        total_patterns,
        auto_fixable_patterns: auto_fixable,
        auto_fixable_rate: if total_patterns == 0 {
            0.0
        } else {
            auto_fixable as f64 / total_patterns as f64 * 100.0
        },
        total_fix_attempts: total_fixes,
        successful_fixes: successful,
        fix_success_rate: if total_fixes == 0 {
            0.0
        } else {
            successful as f64 / total_fixes as f64 * 100.0
        },
        average_pattern_frequency: avg_frequency,
        error_types,
    }
}

/// Parse-only variant of `analyze_output`: extract patterns without
/// touching the cache.
pub fn parse_output(output: &str, tool: &str) -> Vec<ErrorPattern> {
    output
        .split("\n\n")
        .filter(|section| !section.trim().is_empty())
        .filter_map(|section| pattern_from_section(section, tool))
        .collect()
}

/// Extract the first meaningful pattern from one output section
fn pattern_from_section(section: &str, tool: &str) -> Option<ErrorPattern> {
    for line in section.lines() {
        let line = line.trim();
        if line.is_empty() || !line.chars().any(|c| c.is_alphabetic()) {
            continue;
        }
        let (code, message) = extract_error_info(line, tool);
        if !code.is_empty() || message.len() >= 10 {
            return Some(build_pattern(tool, &code, &message));
        }
    }
    None
}

fn extract_error_info(line: &str, tool: &str) -> (String, String) {
    match tool {
        "ruff" => extract_ruff_info(line),
        "pyright" => extract_pyright_info(line),
        "bandit" => extract_bandit_info(line),
        _ => (String::new(), line.to_string()),
    }
}

/// Ruff: `<file>:<line>:<col>: <CODE> <message>` — code is the leading
/// uppercase token after the third colon.
fn extract_ruff_info(line: &str) -> (String, String) {
    if line.chars().any(|c| c.is_ascii_digit()) {
        let mut segments = line.splitn(4, ':');
        if let (Some(_file), Some(_line), Some(_col), Some(rest)) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            let rest = rest.trim();
            if let Some((code, message)) = rest.split_once(' ')
                && !code.is_empty()
                && code.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                && code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            {
                return (code.to_string(), message.trim().to_string());
            }
        }
    }
    (String::new(), line.to_string())
}

/// Pyright: `... -error: <message> (<CODE>)` — code sits in the trailing parens
fn extract_pyright_info(line: &str) -> (String, String) {
    if let Some((_, message)) = line.split_once("-error: ") {
        let message = message.trim().to_string();
        if let (Some(open), Some(close)) = (message.rfind('('), message.rfind(')'))
            && open < close
        {
            let code = message[open + 1..close].to_string();
            return (code, message);
        }
        return (String::new(), message);
    }
    (String::new(), line.to_string())
}

/// Bandit: `Issue: <text>  Test: <CODE>`
fn extract_bandit_info(line: &str) -> (String, String) {
    if let Some((_, after_issue)) = line.split_once("Issue: ") {
        let after_issue = after_issue.trim();
        if let Some((message, code)) = after_issue.split_once("Test: ") {
            return (code.trim().to_string(), message.trim().to_string());
        }
        return (String::new(), after_issue.to_string());
    }
    (String::new(), line.to_string())
}

fn build_pattern(tool: &str, code: &str, message: &str) -> ErrorPattern {
    ErrorPattern {
        pattern_id: format!("{}_{}_{}", tool, code, stable_hash(message) % 10000),
        error_type: tool.to_string(),
        error_code: code.to_string(),
        message_pattern: message.to_string(),
        file_pattern: None,
        common_fixes: Vec::new(),
        auto_fixable: tool == "ruff",
        frequency: 1,
        last_seen: now_epoch(),
    }
}

/// FNV-1a over the message text. Pattern ids must be stable across runs,
/// so the hash cannot depend on process state.
fn stable_hash(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(dir: &Path) -> ErrorCache {
        ErrorCache::new(dir).unwrap()
    }

    fn pattern(id: &str) -> ErrorPattern {
        ErrorPattern {
            pattern_id: id.to_string(),
            error_type: "ruff".to_string(),
            error_code: "E501".to_string(),
            message_pattern: "line too long".to_string(),
            file_pattern: None,
            common_fixes: vec!["shorten the line".to_string()],
            auto_fixable: false,
            frequency: 1,
            last_seen: now_epoch(),
        }
    }

    #[tokio::test]
    async fn test_add_pattern_then_merge_increments_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;

        cache.add_pattern(pattern("p1")).await;
        let mut dup = pattern("p1");
        dup.common_fixes = vec!["shorten the line".to_string(), "wrap it".to_string()];
        cache.add_pattern(dup).await;

        let stored = cache.get_pattern("p1").await.unwrap();
        assert_eq!(stored.frequency, 2);
        assert_eq!(stored.common_fixes, vec!["shorten the line", "wrap it"]);
        assert_eq!(cache.pattern_count().await, 1);
    }

    #[tokio::test]
    async fn test_successful_fix_marks_pattern_auto_fixable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        cache.add_pattern(pattern("p1")).await;

        cache
            .add_fix_result(FixResult {
                fix_id: "f1".to_string(),
                pattern_id: "p1".to_string(),
                success: true,
                files_affected: vec!["src/a.py".to_string()],
                time_taken: 0.4,
                error_message: None,
            })
            .await;

        let stored = cache.get_pattern("p1").await.unwrap();
        assert!(stored.auto_fixable);
        assert!(stored
            .common_fixes
            .iter()
            .any(|f| f.contains("Auto-fix applied")));
        assert_eq!(cache.fix_success_rate("p1").await, 1.0);
        assert_eq!(cache.fix_success_rate("unknown").await, 0.0);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = cache(dir.path()).await;
            cache.add_pattern(pattern("p1")).await;
        }
        let reloaded = cache(dir.path()).await;
        assert!(reloaded.get_pattern("p1").await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_patterns_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("error_patterns.json"), "{not json").unwrap();
        let cache = cache(dir.path()).await;
        assert_eq!(cache.pattern_count().await, 0);
    }

    #[tokio::test]
    async fn test_analyze_ruff_line() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;

        let found = cache
            .analyze_output("src/a.py:10:80: E501 line too long (82 > 79)", "ruff")
            .await;
        assert_eq!(found.len(), 1);
        let p = &found[0];
        assert_eq!(p.error_type, "ruff");
        assert_eq!(p.error_code, "E501");
        assert!(p.message_pattern.contains("line too long"));
        assert!(p.auto_fixable);

        // Identical output merges, it does not duplicate
        cache
            .analyze_output("src/a.py:10:80: E501 line too long (82 > 79)", "ruff")
            .await;
        assert_eq!(cache.pattern_count().await, 1);
        let stored = cache.get_pattern(&p.pattern_id).await.unwrap();
        assert_eq!(stored.frequency, 2);
    }

    #[tokio::test]
    async fn test_analyze_pyright_line() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        let found = cache
            .analyze_output(
                "src/a.py:12:5 -error: Expression of type None (reportGeneralTypeIssues)",
                "pyright",
            )
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_code, "reportGeneralTypeIssues");
        assert!(!found[0].auto_fixable);
    }

    #[tokio::test]
    async fn test_analyze_bandit_line() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        let found = cache
            .analyze_output(
                "Issue: Use of insecure MD5 hash function  Test: B303",
                "bandit",
            )
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].error_code, "B303");
        assert!(found[0].message_pattern.contains("MD5"));
    }

    #[tokio::test]
    async fn test_analyze_skips_noise_sections() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        let found = cache.analyze_output("----\n\nok\n\n", "ruff").await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_old_drops_stale_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        let mut stale = pattern("old");
        stale.last_seen = now_epoch() - 40.0 * 86400.0;
        cache.add_pattern(stale).await;
        cache.add_pattern(pattern("fresh")).await;

        let removed = cache.cleanup_old(30).await;
        assert_eq!(removed, 1);
        assert!(cache.get_pattern("old").await.is_none());
        assert!(cache.get_pattern("fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_queries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        cache.add_pattern(pattern("a")).await;
        let mut b = pattern("b");
        b.error_type = "pyright".to_string();
        b.error_code = "X1".to_string();
        b.auto_fixable = true;
        cache.add_pattern(b).await;
        // Bump "a" twice so it outranks "b"
        cache.add_pattern(pattern("a")).await;

        assert_eq!(cache.find_by_type("ruff").await.len(), 1);
        assert_eq!(cache.find_by_code("X1").await.len(), 1);
        assert_eq!(cache.auto_fixable_only().await.len(), 1);
        let top = cache.top_by_frequency(1).await;
        assert_eq!(top[0].pattern_id, "a");
        assert_eq!(cache.recent(1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_export_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path()).await;
        cache.add_pattern(pattern("p1")).await;
        let out = dir.path().join("export.json");
        cache.export(&out).await.unwrap();

        let bundle: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(bundle["total_patterns"], 1);
        assert!(bundle["stats"]["total_patterns"].is_number());
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        assert_eq!(stable_hash("line too long"), stable_hash("line too long"));
        assert_ne!(stable_hash("a"), stable_hash("b"));
    }
}
