// src/init.rs
// Project initializer: copies the packaged quality-workflow config files
// into a target project. Plain copies only; merging is the caller's problem.

use std::path::Path;
use tracing::{debug, info};

/// Packaged configuration templates laid down by `init_crackerjack`
const TEMPLATES: &[(&str, &str)] = &[
    (
        ".gitignore",
        r#"__pycache__/
*.py[cod]
.venv/
.pytest_cache/
.ruff_cache/
.coverage
.coverage.*
dist/
build/
*.egg-info/
"#,
    ),
    (
        ".pre-commit-config.yaml",
        r#"repos:
  - repo: https://github.com/astral-sh/ruff-pre-commit
    rev: v0.8.0
    hooks:
      - id: ruff
        args: [--fix]
      - id: ruff-format
  - repo: https://github.com/pre-commit/pre-commit-hooks
    rev: v5.0.0
    hooks:
      - id: trailing-whitespace
      - id: end-of-file-fixer
      - id: check-yaml
"#,
    ),
    (
        "pyproject.toml",
        r#"[tool.ruff]
line-length = 88
target-version = "py313"

[tool.ruff.lint]
select = ["E", "F", "I", "UP", "B"]

[tool.pytest.ini_options]
addopts = "-ra"
testpaths = ["tests"]
"#,
    ),
];

#[derive(Debug, Default)]
pub struct InitReport {
    pub files_copied: Vec<String>,
    pub files_skipped: Vec<String>,
    pub errors: Vec<String>,
}

/// Lay the packaged templates down in `target`. Existing files are skipped
/// unless `force` is set.
pub fn initialize_project(target: &Path, force: bool) -> InitReport {
    let mut report = InitReport::default();

    if let Err(e) = std::fs::create_dir_all(target) {
        report
            .errors
            .push(format!("cannot create {}: {}", target.display(), e));
        return report;
    }

    for (name, content) in TEMPLATES {
        let destination = target.join(name);
        if destination.exists() && !force {
            debug!(file = name, "skipping existing file");
            report.files_skipped.push(name.to_string());
            continue;
        }
        match std::fs::write(&destination, content) {
            Ok(()) => {
                info!(file = name, target = %target.display(), "copied config file");
                report.files_copied.push(name.to_string());
            }
            Err(e) => report.errors.push(format!("{}: {}", name, e)),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_copies_all_templates() {
        let dir = tempfile::tempdir().unwrap();
        let report = initialize_project(dir.path(), false);
        assert_eq!(report.files_copied.len(), TEMPLATES.len());
        assert!(report.files_skipped.is_empty());
        assert!(report.errors.is_empty());
        assert!(dir.path().join(".gitignore").exists());
        assert!(dir.path().join("pyproject.toml").exists());
    }

    #[test]
    fn test_initialize_skips_existing_without_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "mine\n").unwrap();

        let report = initialize_project(dir.path(), false);
        assert_eq!(report.files_skipped, vec![".gitignore"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".gitignore")).unwrap(),
            "mine\n"
        );

        let forced = initialize_project(dir.path(), true);
        assert!(forced.files_skipped.is_empty());
        assert_ne!(
            std::fs::read_to_string(dir.path().join(".gitignore")).unwrap(),
            "mine\n"
        );
    }

    #[test]
    fn test_initialize_creates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("new").join("project");
        let report = initialize_project(&nested, false);
        assert!(report.errors.is_empty());
        assert!(nested.join(".pre-commit-config.yaml").exists());
    }
}
