//! Transactional patch application against the working tree.
//!
//! Patch primitives are delegated to the host's `git apply`: `--check` for
//! the dry run, plain apply for the mutation, `-R` for revert. A diff is only
//! ever applied after its dry run passes, so the apply step is all-or-nothing
//! across every file in the diff.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{ApplyCheckError, RevertInconsistencyError};
use crate::util::truncate;

const GIT_OUTPUT_MAX_CHARS: usize = 1200;

/// Applies and reverts unified diffs in one repository's working tree.
#[derive(Debug, Clone)]
pub struct Patcher {
    repo_root: PathBuf,
}

impl Patcher {
    pub fn new(repo_root: impl AsRef<Path>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
        }
    }

    /// Dry-run the diff against the current tree without touching it.
    pub fn check(&self, diff_text: &str) -> Result<(), ApplyCheckError> {
        self.git_apply(diff_text, &["--check"])
            .map_err(|message| ApplyCheckError { message })
    }

    /// Apply the diff. Checked first, so a structurally incompatible diff
    /// (e.g. stale context lines) never lands partially.
    pub fn apply(&self, diff_text: &str) -> Result<(), ApplyCheckError> {
        self.check(diff_text)?;
        self.git_apply(diff_text, &[])
            .map_err(|message| ApplyCheckError { message })
    }

    /// Reverse-apply a previously applied diff, restoring every touched file
    /// byte-identically. Failure here is fatal to the loop: the tree's state
    /// is no longer known.
    pub fn revert(&self, diff_text: &str) -> Result<(), RevertInconsistencyError> {
        self.git_apply(diff_text, &["--reverse"])
            .map_err(|message| RevertInconsistencyError { message })
    }

    fn git_apply(&self, diff_text: &str, extra_args: &[&str]) -> Result<(), String> {
        let mut child = Command::new("git")
            .arg("apply")
            .args(extra_args)
            .arg("--whitespace=nowarn")
            .arg("-")
            .current_dir(&self.repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to start git apply: {}", e))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| "failed to open git apply stdin".to_string())?;
            stdin
                .write_all(diff_text.as_bytes())
                .map_err(|e| format!("failed to write diff to git apply: {}", e))?;
            // git apply wants the patch newline-terminated.
            if !diff_text.ends_with('\n') {
                stdin
                    .write_all(b"\n")
                    .map_err(|e| format!("failed to write diff to git apply: {}", e))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| format!("failed to wait for git apply: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            let mut combined = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if combined.is_empty() {
                combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            Err(truncate(&combined, GIT_OUTPUT_MAX_CHARS))
        }
    }
}
