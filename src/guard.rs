//! Guardrails: static validation of a proposed diff against a safety policy.
//!
//! This is a pure structural analysis. The diff text is scanned line by line
//! and never interpreted as executable content. `validate` is total: any
//! input, however malformed, yields a `ValidationResult`. All violations are
//! collected rather than stopping at the first, because the reasons feed the
//! requester's retry prompt.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Policy describing what a generated patch is allowed to touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    /// Every touched file must live under this prefix (deletions exempted).
    pub allowed_path_prefix: String,
    /// Exact paths that must never be touched.
    pub forbidden_paths: Vec<String>,
    /// Path prefixes that must never be touched.
    pub forbidden_path_prefixes: Vec<String>,
    /// Regexes over touched paths that must never match.
    pub forbidden_file_patterns: Vec<String>,
    /// Hard cap on the number of touched files.
    pub max_changed_files: usize,
    /// Hard cap on added + removed content lines.
    pub max_changed_lines: usize,
    /// Patterns that, if removed from a file, must be re-added in that same
    /// file. Protects load-bearing integration points such as the root mount
    /// call of the rendering framework.
    pub critical_markers: Vec<String>,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            allowed_path_prefix: "src/".to_string(),
            forbidden_paths: vec![
                "package.json".to_string(),
                "package-lock.json".to_string(),
                "vite.config.js".to_string(),
                "vite.config.ts".to_string(),
                "index.html".to_string(),
            ],
            forbidden_path_prefixes: vec![
                "node_modules/".to_string(),
                "dist/".to_string(),
                ".git/".to_string(),
            ],
            forbidden_file_patterns: vec![r"\.(lock|env|pem|key)$".to_string()],
            max_changed_files: 5,
            max_changed_lines: 300,
            critical_markers: vec![],
        }
    }
}

/// A single policy violation found in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    BinaryPatch,
    NotAUnifiedDiff,
    ForbiddenPath { path: String },
    ForbiddenPrefix { path: String, prefix: String },
    ForbiddenPattern { path: String, pattern: String },
    OutsideAllowedPrefix { path: String, prefix: String },
    CriticalMarkerRemoved { path: String, marker: String },
    TooManyFiles { count: usize, max: usize },
    TooManyLines { count: usize, max: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BinaryPatch => write!(f, "binary patches are not allowed"),
            Violation::NotAUnifiedDiff => write!(f, "not a unified diff"),
            Violation::ForbiddenPath { path } => {
                write!(f, "touches forbidden path {}", path)
            }
            Violation::ForbiddenPrefix { path, prefix } => {
                write!(f, "touches {} under forbidden prefix {}", path, prefix)
            }
            Violation::ForbiddenPattern { path, pattern } => {
                write!(f, "touches {} matching forbidden pattern {}", path, pattern)
            }
            Violation::OutsideAllowedPrefix { path, prefix } => {
                write!(f, "touches {} outside allowed prefix {}", path, prefix)
            }
            Violation::CriticalMarkerRemoved { path, marker } => {
                write!(
                    f,
                    "removes critical marker {:?} from {} without re-adding it",
                    marker, path
                )
            }
            Violation::TooManyFiles { count, max } => {
                write!(f, "too many changed files: {} (max {})", count, max)
            }
            Violation::TooManyLines { count, max } => {
                write!(f, "too many changed lines: {} (max {})", count, max)
            }
        }
    }
}

/// Result of validating a diff: `violations` is exhaustive, not first-match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    /// Violations rendered for logs and retry prompts.
    pub fn reasons(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }
}

/// Per-file slice of a scanned diff.
#[derive(Debug, Default)]
struct FileChanges {
    added: Vec<String>,
    removed: Vec<String>,
    is_deletion: bool,
}

/// Old/new line counts from a `@@ -start,count +start,count @@` header.
/// An omitted count means 1.
fn hunk_counts(line: &str) -> Option<(usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let (old_part, rest) = rest.split_once(" +")?;
    let (new_part, _) = rest.split_once(" @@")?;
    let count = |part: &str| match part.split_once(',') {
        Some((_, c)) => c.parse().ok(),
        None => Some(1),
    };
    Some((count(old_part)?, count(new_part)?))
}

/// Strip the `a/`-style prefix and any trailing timestamp from a header path.
fn header_path(raw: &str) -> String {
    let mut path = raw.trim().to_string();
    if let Some(tab_pos) = path.find('\t') {
        path.truncate(tab_pos);
    }
    for prefix in ["a/", "b/"] {
        if let Some(stripped) = path.strip_prefix(prefix) {
            path = stripped.to_string();
            break;
        }
    }
    path
}

/// Validate a diff against a policy. Never executes the diff's content.
pub fn validate(diff_text: &str, policy: &GuardPolicy) -> ValidationResult {
    // Binary patches can hide anything; reject before any other analysis.
    if diff_text.contains("GIT binary patch") || diff_text.contains("Binary files ") {
        return ValidationResult::from_violations(vec![Violation::BinaryPatch]);
    }

    let has_file_header = diff_text
        .lines()
        .any(|l| l.starts_with("--- ") || l.starts_with("+++ "));
    let has_hunk_header = diff_text.lines().any(|l| l.starts_with("@@"));
    if !has_file_header || !has_hunk_header {
        return ValidationResult::from_violations(vec![Violation::NotAUnifiedDiff]);
    }

    // Scan: track the current file from header lines, classify content lines.
    // Hunk bodies are scoped by the @@ header's line counts so removed text
    // beginning with "-- " (rendered "--- ...") is never read as a header.
    // BTreeMap keeps violation ordering deterministic across runs.
    let mut files: BTreeMap<String, FileChanges> = BTreeMap::new();
    let mut current_file: Option<String> = None;
    let mut pending_old: Option<String> = None;
    let mut changed_lines = 0usize;
    let mut remaining_old = 0usize;
    let mut remaining_new = 0usize;

    for line in diff_text.lines() {
        let in_hunk = remaining_old > 0 || remaining_new > 0;

        if !in_hunk {
            if let Some(raw) = line.strip_prefix("--- ") {
                let path = header_path(raw);
                pending_old = (path != "/dev/null").then_some(path);
                continue;
            }
            if let Some(raw) = line.strip_prefix("+++ ") {
                let new_path = header_path(raw);
                if new_path == "/dev/null" {
                    // Deletion: the touched file is the old side.
                    if let Some(old) = pending_old.take() {
                        files.entry(old.clone()).or_default().is_deletion = true;
                        current_file = Some(old);
                    }
                } else {
                    files.entry(new_path.clone()).or_default();
                    current_file = Some(new_path);
                }
                continue;
            }
        }

        if line.starts_with("@@") {
            if let Some((old, new)) = hunk_counts(line) {
                remaining_old = old;
                remaining_new = new;
            }
            continue;
        }
        if !in_hunk || line.starts_with('\\') {
            // Between hunks, or a "\ No newline at end of file" marker.
            continue;
        }

        if let Some(content) = line.strip_prefix('+') {
            remaining_new = remaining_new.saturating_sub(1);
            changed_lines += 1;
            if let Some(file) = &current_file {
                files
                    .entry(file.clone())
                    .or_default()
                    .added
                    .push(content.to_string());
            }
        } else if let Some(content) = line.strip_prefix('-') {
            remaining_old = remaining_old.saturating_sub(1);
            changed_lines += 1;
            if let Some(file) = &current_file {
                files
                    .entry(file.clone())
                    .or_default()
                    .removed
                    .push(content.to_string());
            }
        } else {
            // Context line, counted against both sides.
            remaining_old = remaining_old.saturating_sub(1);
            remaining_new = remaining_new.saturating_sub(1);
        }
    }

    let mut violations = Vec::new();

    for (path, changes) in &files {
        if policy.forbidden_paths.iter().any(|p| p == path) {
            violations.push(Violation::ForbiddenPath { path: path.clone() });
        }
        for prefix in &policy.forbidden_path_prefixes {
            if path.starts_with(prefix.as_str()) {
                violations.push(Violation::ForbiddenPrefix {
                    path: path.clone(),
                    prefix: prefix.clone(),
                });
            }
        }
        for pattern in &policy.forbidden_file_patterns {
            // Invalid patterns are caught at config validation; skip here so
            // validate stays total.
            if let Ok(re) = Regex::new(pattern) {
                if re.is_match(path) {
                    violations.push(Violation::ForbiddenPattern {
                        path: path.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
        }
        if !changes.is_deletion && !path.starts_with(policy.allowed_path_prefix.as_str()) {
            violations.push(Violation::OutsideAllowedPrefix {
                path: path.clone(),
                prefix: policy.allowed_path_prefix.clone(),
            });
        }
    }

    for marker in &policy.critical_markers {
        let Ok(re) = Regex::new(marker) else {
            continue;
        };
        for (path, changes) in &files {
            let removed = changes.removed.iter().any(|l| re.is_match(l));
            let readded = changes.added.iter().any(|l| re.is_match(l));
            if removed && !readded {
                violations.push(Violation::CriticalMarkerRemoved {
                    path: path.clone(),
                    marker: marker.clone(),
                });
            }
        }
    }

    if files.len() > policy.max_changed_files {
        violations.push(Violation::TooManyFiles {
            count: files.len(),
            max: policy.max_changed_files,
        });
    }
    if changed_lines > policy.max_changed_lines {
        violations.push(Violation::TooManyLines {
            count: changed_lines,
            max: policy.max_changed_lines,
        });
    }

    ValidationResult::from_violations(violations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff_for(path: &str, body: &str) -> String {
        format!(
            "--- a/{path}\n+++ b/{path}\n@@ -1,2 +1,2 @@\n{body}\n context\n"
        )
    }

    #[test]
    fn test_valid_diff_inside_prefix() {
        let diff = diff_for("src/game/player.js", "-const speed = 1;\n+const speed = 2;");
        let result = validate(&diff, &GuardPolicy::default());
        assert!(result.valid, "violations: {:?}", result.violations);
    }

    #[test]
    fn test_forbidden_path_blocked() {
        let diff = diff_for("package.json", "-  \"old\": 1,\n+  \"new\": 2,");
        let result = validate(&diff, &GuardPolicy::default());
        assert!(!result.valid);
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::ForbiddenPath { path } if path == "package.json")));
    }

    #[test]
    fn test_rejects_binary_patch() {
        let diff = "diff --git a/x b/x\nGIT binary patch\nliteral 5\n";
        let result = validate(diff, &GuardPolicy::default());
        assert_eq!(result.violations, vec![Violation::BinaryPatch]);
    }

    #[test]
    fn test_rejects_non_diff_text() {
        let result = validate("here is your patch, enjoy!", &GuardPolicy::default());
        assert_eq!(result.violations, vec![Violation::NotAUnifiedDiff]);
    }

    #[test]
    fn test_exhaustive_violations_for_multiple_files() {
        // Two files outside the allowed prefix must yield at least two violations.
        let diff = format!(
            "{}{}",
            diff_for("tools/build.js", "-a\n+b"),
            diff_for("scripts/deploy.js", "-c\n+d")
        );
        let result = validate(&diff, &GuardPolicy::default());
        let outside = result
            .violations
            .iter()
            .filter(|v| matches!(v, Violation::OutsideAllowedPrefix { .. }))
            .count();
        assert!(outside >= 2);
    }

    #[test]
    fn test_too_many_changed_lines() {
        let mut body = String::new();
        for i in 0..350 {
            body.push_str(&format!("+line {}\n", i));
        }
        let diff = format!("--- a/src/big.js\n+++ b/src/big.js\n@@ -1,1 +1,351 @@\n context\n{body}");
        let policy = GuardPolicy {
            max_changed_lines: 300,
            ..GuardPolicy::default()
        };
        let result = validate(&diff, &policy);
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::TooManyLines { count: 350, max: 300 })));
    }

    #[test]
    fn test_too_many_changed_files() {
        let mut diff = String::new();
        for i in 0..7 {
            diff.push_str(&diff_for(&format!("src/file{}.js", i), "-a\n+b"));
        }
        let policy = GuardPolicy {
            max_changed_files: 5,
            ..GuardPolicy::default()
        };
        let result = validate(&diff, &policy);
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::TooManyFiles { count: 7, max: 5 })));
    }

    #[test]
    fn test_critical_marker_removed_without_readd() {
        let policy = GuardPolicy {
            critical_markers: vec![r"mountRenderer\(".to_string()],
            ..GuardPolicy::default()
        };
        let diff = diff_for("src/main.js", "-mountRenderer(root);\n+console.log('gone');");
        let result = validate(&diff, &policy);
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::CriticalMarkerRemoved { .. })));
    }

    #[test]
    fn test_critical_marker_moved_is_fine() {
        let policy = GuardPolicy {
            critical_markers: vec![r"mountRenderer\(".to_string()],
            ..GuardPolicy::default()
        };
        let diff = diff_for(
            "src/main.js",
            "-mountRenderer(root);\n+setup();\n+mountRenderer(root);",
        );
        let result = validate(&diff, &policy);
        assert!(result.valid, "violations: {:?}", result.violations);
    }

    #[test]
    fn test_deletion_exempt_from_allowed_prefix() {
        let diff = "--- a/notes.txt\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-scratch\n";
        let result = validate(diff, &GuardPolicy::default());
        assert!(!result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::OutsideAllowedPrefix { .. })));
    }

    #[test]
    fn test_dashed_content_inside_hunk_is_not_a_header() {
        // A removed line whose text starts with "-- " renders as "--- ..."
        // in the diff; it must still count as removed content and still
        // feed critical-marker matching.
        let policy = GuardPolicy {
            critical_markers: vec![r"mountRenderer\(".to_string()],
            max_changed_lines: 1,
            ..GuardPolicy::default()
        };
        let diff = "--- a/src/main.js\n+++ b/src/main.js\n@@ -1,2 +1,2 @@\n\
                    --- mountRenderer(root);\n+++ draw();\n context\n";
        let result = validate(diff, &policy);
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::CriticalMarkerRemoved { .. })));
        assert!(result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::TooManyLines { count: 2, max: 1 })));
        // The bogus "header" must not have registered as a touched file.
        assert!(!result
            .violations
            .iter()
            .any(|v| matches!(v, Violation::OutsideAllowedPrefix { .. })));
    }

    #[test]
    fn test_header_lines_do_not_count_as_changes() {
        let diff = diff_for("src/a.js", "-x\n+y");
        let policy = GuardPolicy {
            max_changed_lines: 2,
            ..GuardPolicy::default()
        };
        // Exactly 2 content lines changed; the ---/+++ headers must not count.
        assert!(validate(&diff, &policy).valid);
    }
}
