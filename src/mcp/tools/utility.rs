// src/mcp/tools/utility.rs
// Housekeeping tools: clean, config, analyze, init

use super::{DEFAULT_CLIENT, preflight};
use crate::context::ServerContext;
use crate::mcp::responses;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

const DEFAULT_OLDER_THAN_HOURS: u64 = 24;

/// Temp-dir debris eligible for cleaning
fn is_temp_debris(name: &str) -> bool {
    name.ends_with(".log") || name.starts_with(".coverage")
}

/// `clean_crackerjack`: remove stale artifacts by scope
pub async fn clean_crackerjack(
    context: &Arc<ServerContext>,
    scope: Option<&str>,
    dry_run: bool,
    older_than_hours: Option<u64>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let scope = scope.unwrap_or("temp");
    let older_than_hours = older_than_hours.unwrap_or(DEFAULT_OLDER_THAN_HOURS);
    let cutoff = SystemTime::now() - Duration::from_secs(older_than_hours * 3600);

    let mut files: Vec<String> = Vec::new();
    let mut total_size: u64 = 0;

    match scope {
        "temp" => {
            clean_dir(&std::env::temp_dir(), is_temp_debris, cutoff, dry_run, &mut files, &mut total_size);
        }
        "progress" => {
            clean_dir(
                context.progress_store.progress_dir(),
                |name| name.starts_with("job-") && name.ends_with(".json"),
                cutoff,
                dry_run,
                &mut files,
                &mut total_size,
            );
        }
        "cache" => {
            let days = older_than_hours.div_ceil(24).max(1);
            let removed = if dry_run {
                let total = context.error_cache.pattern_count().await;
                total - context.error_cache.recent(days * 24).await.len()
            } else {
                context.error_cache.cleanup_old(days).await
            };
            files.push(format!("{} expired error patterns", removed));
        }
        "all" => {
            clean_dir(&std::env::temp_dir(), is_temp_debris, cutoff, dry_run, &mut files, &mut total_size);
            clean_dir(
                context.progress_store.progress_dir(),
                |name| name.starts_with("job-") && name.ends_with(".json"),
                cutoff,
                dry_run,
                &mut files,
                &mut total_size,
            );
            let days = older_than_hours.div_ceil(24).max(1);
            if !dry_run {
                let removed = context.error_cache.cleanup_old(days).await;
                files.push(format!("{} expired error patterns", removed));
            }
        }
        other => {
            return responses::validation_failed(format!(
                "Invalid scope: {}. Valid scopes: temp, progress, cache, all",
                other
            ));
        }
    }

    responses::clean_result(scope, dry_run, files, total_size)
}

fn clean_dir(
    dir: &Path,
    matches: impl Fn(&str) -> bool,
    cutoff: SystemTime,
    dry_run: bool,
    files: &mut Vec<String>,
    total_size: &mut u64,
) {
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if !matches(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let old_enough = meta.modified().map(|m| m < cutoff).unwrap_or(false);
        if !old_enough {
            continue;
        }
        if !dry_run && std::fs::remove_file(entry.path()).is_err() {
            continue;
        }
        *total_size += meta.len();
        files.push(entry.path().display().to_string());
    }
}

/// `config_crackerjack`: list / get / validate the effective configuration
pub async fn config_crackerjack(
    context: &Arc<ServerContext>,
    action: &str,
    key: Option<&str>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    match action {
        "list" => responses::payload(&serde_json::json!({
            "success": true,
            "config": context.config.as_json(),
        })),
        "get" => {
            let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
                return responses::validation_failed("get requires a config key");
            };
            match context.config.get(key) {
                Some(value) => responses::payload(&serde_json::json!({
                    "success": true,
                    "key": key,
                    "value": value,
                })),
                None => responses::validation_failed(format!("Unknown config key: {}", key)),
            }
        }
        "validate" => {
            let warnings = context.config.validate();
            responses::payload(&serde_json::json!({
                "success": true,
                "valid": warnings.is_empty(),
                "warnings": warnings,
            }))
        }
        other => responses::validation_failed(format!(
            "Unknown action: {}. Valid actions: list, get, validate",
            other
        )),
    }
}

/// `analyze_crackerjack`: aggregate cache and session analytics
pub async fn analyze_crackerjack(
    context: &Arc<ServerContext>,
    scope: Option<&str>,
    report_format: Option<&str>,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let scope = scope.unwrap_or("all");
    let report_format = report_format.unwrap_or("summary");

    let mut analysis = serde_json::Map::new();
    if matches!(scope, "errors" | "all") {
        analysis.insert(
            "error_cache".to_string(),
            serde_json::to_value(context.error_cache.stats().await).unwrap_or_default(),
        );
    }
    if matches!(scope, "session" | "all") {
        analysis.insert(
            "session".to_string(),
            serde_json::to_value(context.state_manager.session_summary().await)
                .unwrap_or_default(),
        );
    }

    if report_format == "detailed" {
        let top: Vec<serde_json::Value> = context
            .error_cache
            .top_by_frequency(10)
            .await
            .into_iter()
            .filter_map(|p| serde_json::to_value(p).ok())
            .collect();
        analysis.insert("top_patterns".to_string(), serde_json::json!(top));
        analysis.insert(
            "auto_fixable".to_string(),
            serde_json::json!(context.error_cache.auto_fixable_only().await.len()),
        );
    }

    responses::payload(&serde_json::json!({
        "success": true,
        "scope": scope,
        "report_format": report_format,
        "analysis": analysis,
    }))
}

/// `init_crackerjack`: copy the packaged quality-workflow config files into
/// a target project
pub async fn init_crackerjack(
    context: &Arc<ServerContext>,
    target_path: &str,
    force: bool,
) -> String {
    if let Some(refusal) = preflight(context, DEFAULT_CLIENT).await {
        return refusal;
    }

    let validation = context.sanitizer.sanitize_path(target_path, None, true);
    if !validation.valid {
        return responses::validation_failed(format!(
            "Invalid target path: {}",
            validation.error()
        ));
    }
    let target = std::path::PathBuf::from(validation.as_str().unwrap_or_default());

    let report = crate::init::initialize_project(&target, force);
    responses::init_result(
        &target.display().to_string(),
        report.files_copied,
        report.files_skipped,
        report.errors,
    )
}
