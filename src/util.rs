use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Truncate a string to `max` characters, appending an ellipsis when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Outcome of running an external command with a deadline.
#[derive(Debug)]
pub struct CommandOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    /// Combined output tail for logging, stderr last so failures surface.
    pub fn tail(&self, max_chars: usize) -> String {
        let mut combined = String::new();
        if !self.stdout.is_empty() {
            combined.push_str(self.stdout.trim_end());
        }
        if !self.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(self.stderr.trim_end());
        }
        truncate(&combined, max_chars)
    }
}

/// Run `program args...` in `cwd`, killing the child if it outlives `timeout`.
///
/// Stdout/stderr are drained on reader threads so a chatty child can't
/// deadlock on a full pipe.
pub fn run_with_timeout(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutcome, String> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", program, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(stdout).read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(stderr).read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(format!("failed to wait for {}: {}", program, e)),
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutcome {
        success: !timed_out && status.is_some_and(|s| s.success()),
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        duration: start.elapsed(),
    })
}

/// Resolve a repo-relative path, rejecting anything that could escape the root.
///
/// Absolute paths and parent traversal are refused outright; the file does not
/// have to exist yet. The nearest existing ancestor is canonicalized and
/// checked against the canonical root so a symlink inside the repo cannot
/// point resolution outside it.
pub fn resolve_repo_relative(repo_root: &Path, candidate: &Path) -> Result<PathBuf, String> {
    if candidate.as_os_str().is_empty() {
        return Err("path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = repo_root
        .canonicalize()
        .map_err(|e| format!("failed to resolve repo root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("path escapes repository: {}", candidate.display()));
    }

    Ok(joined)
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("failed to resolve path {}: {}", current.display(), e))
}

/// Split a command string into program + args.
///
/// Whitespace splitting only; commands needing shell quoting belong in a
/// script the command points at.
pub fn split_command(command: &str) -> Result<(String, Vec<String>), String> {
    let mut parts = command.split_whitespace().map(|s| s.to_string());
    let program = parts
        .next()
        .ok_or_else(|| "command is empty".to_string())?;
    Ok((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "错误: 失败 😊 and more text here";
        let out = truncate(input, 8);
        assert_eq!(out.chars().count(), 8);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_truncate_no_cut() {
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn test_resolve_rejects_absolute() {
        let root = Path::new("/repo");
        assert!(resolve_repo_relative(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_resolve_rejects_parent_traversal() {
        let root = Path::new("/repo");
        assert!(resolve_repo_relative(root, Path::new("../outside.js")).is_err());
        assert!(resolve_repo_relative(root, Path::new("src/../../outside.js")).is_err());
    }

    #[test]
    fn test_resolve_joins_relative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let root = dir.path().canonicalize().unwrap();
        let resolved = resolve_repo_relative(&root, Path::new("src/main.js")).unwrap();
        assert_eq!(resolved, root.join("src/main.js"));
    }

    #[test]
    fn test_resolve_allows_new_file_in_new_subdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_repo_relative(dir.path(), Path::new("src/deep/new.js")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("vendor")).unwrap();

        let err = resolve_repo_relative(dir.path(), Path::new("vendor/secret.js"))
            .expect_err("symlinked paths must not escape the root");
        assert!(err.contains("escapes"));
    }

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("npm run build").unwrap();
        assert_eq!(program, "npm");
        assert_eq!(args, vec!["run".to_string(), "build".to_string()]);
        assert!(split_command("   ").is_err());
    }
}
