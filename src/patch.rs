//! Patch acquisition from an external generation service.
//!
//! The service is modeled as a capability (`PatchService`) so the backend —
//! hosted HTTP endpoint, local model server, scripted test double — is
//! swappable without touching loop logic. Responses are normalized into a
//! unified diff: either extracted directly (fenced or bare), or compiled
//! deterministically from a JSON `{edits: [...]}` payload. A candidate that
//! does not dry-run-apply is sent back with the rejection reason appended to
//! the prompt, up to a fixed attempt budget.

use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use crate::apply::Patcher;
use crate::error::{EditNotFoundError, EditPathError, GenerationError, ServiceError};
use crate::guard::GuardPolicy;
use crate::metrics::MetricsSummary;
use crate::util::{resolve_repo_relative, truncate};

/// Where a candidate diff came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    DirectDiff,
    CompiledFromEdits,
}

/// A normalized candidate patch, ready for validation.
#[derive(Debug, Clone)]
pub struct PatchCandidate {
    pub diff: String,
    pub provenance: Provenance,
}

/// Capability interface over the patch-generation backend.
pub trait PatchService: Send + Sync {
    fn request<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ServiceError>> + Send + 'a>>;
}

impl<T: PatchService + ?Sized> PatchService for std::sync::Arc<T> {
    fn request<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ServiceError>> + Send + 'a>> {
        self.as_ref().request(prompt)
    }
}

#[derive(Serialize)]
struct ServiceRequest<'a> {
    prompt: &'a str,
}

/// HTTP backend: `POST {prompt}` returning `{patch}` (provider variants
/// `diff` and `content` are accepted too).
pub struct HttpPatchService {
    client: reqwest::Client,
    endpoint: String,
    max_retries: usize,
}

const INITIAL_BACKOFF_MS: u64 = 1000;

impl HttpPatchService {
    pub fn new(endpoint: String, timeout: Duration, max_retries: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            max_retries,
        })
    }

    async fn request_once(&self, prompt: &str) -> Result<String, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ServiceRequest { prompt })
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response body: {}", e))?;

        if !status.is_success() {
            return Err(format!("service returned {}: {}", status, truncate(&text, 300)));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| format!("response is not JSON: {}", e))?;
        for field in ["patch", "diff", "content"] {
            if let Some(value) = body.get(field).and_then(|v| v.as_str()) {
                return Ok(value.to_string());
            }
        }
        Err("response has no patch field".to_string())
    }

    async fn request_with_retries(&self, prompt: &str) -> Result<String, ServiceError> {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff_ms = INITIAL_BACKOFF_MS * 2u64.pow(attempt as u32 - 1);
                tracing::debug!(attempt, backoff_ms, "retrying patch service");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            match self.request_once(prompt).await {
                Ok(raw) => return Ok(raw),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "patch service call failed");
                    last_error = err;
                }
            }
        }
        Err(ServiceError::new(format!(
            "{} (after {} retries)",
            last_error, self.max_retries
        )))
    }
}

impl PatchService for HttpPatchService {
    fn request<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ServiceError>> + Send + 'a>> {
        Box::pin(self.request_with_retries(prompt))
    }
}

/// One find/replace edit in a JSON edits payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Edit {
    pub path: String,
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Deserialize)]
struct EditsPayload {
    edits: Vec<Edit>,
}

/// Requests patches and normalizes them into dry-run-clean candidates.
pub struct PatchRequester<S: PatchService> {
    service: S,
    repo_root: PathBuf,
    max_attempts: usize,
}

impl<S: PatchService> PatchRequester<S> {
    pub fn new(service: S, repo_root: impl AsRef<Path>, max_attempts: usize) -> Self {
        Self {
            service,
            repo_root: repo_root.as_ref().to_path_buf(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Obtain a candidate that dry-run-applies to the current tree, retrying
    /// with the rejection reason appended, then fail with `GenerationError`.
    pub async fn request_patch(
        &self,
        base_prompt: &str,
        patcher: &Patcher,
    ) -> Result<PatchCandidate, GenerationError> {
        let mut feedback: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            let prompt = match &feedback {
                None => base_prompt.to_string(),
                Some(reason) => format!(
                    "{}\n\nYour previous patch was rejected: {}\n\
                     Respond with a corrected unified diff that applies cleanly \
                     to the current sources.",
                    base_prompt, reason
                ),
            };

            let raw = match self.service.request(&prompt).await {
                Ok(raw) => raw,
                Err(err) => {
                    // The service already exhausted its own retry budget.
                    return Err(GenerationError {
                        message: err.to_string(),
                        attempts: attempt,
                    });
                }
            };

            let candidate = match normalize_response(&self.repo_root, &raw) {
                Ok(candidate) => candidate,
                Err(reason) => {
                    tracing::info!(attempt, %reason, "response did not normalize to a diff");
                    feedback = Some(reason);
                    continue;
                }
            };

            match patcher.check(&candidate.diff) {
                Ok(()) => return Ok(candidate),
                Err(err) => {
                    tracing::info!(attempt, error = %err, "candidate failed dry run");
                    feedback = Some(err.to_string());
                }
            }
        }

        Err(GenerationError {
            message: feedback.unwrap_or_else(|| "no usable patch produced".to_string()),
            attempts: self.max_attempts,
        })
    }
}

/// Normalize a raw service response into a candidate diff.
///
/// Accepted shapes: a unified diff (possibly inside a fenced block), or a
/// JSON edits payload compiled into one.
pub fn normalize_response(repo_root: &Path, raw: &str) -> Result<PatchCandidate, String> {
    if let Some(diff) = extract_diff(raw) {
        return Ok(PatchCandidate {
            diff,
            provenance: Provenance::DirectDiff,
        });
    }

    if let Some(edits) = parse_edits(raw) {
        let diff = compile_edits(repo_root, &edits).map_err(|e| e.to_string())?;
        return Ok(PatchCandidate {
            diff,
            provenance: Provenance::CompiledFromEdits,
        });
    }

    Err("response contains neither a unified diff nor an edits payload".to_string())
}

fn looks_like_diff(text: &str) -> bool {
    let has_old = text.lines().any(|l| l.starts_with("--- "));
    let has_new = text.lines().any(|l| l.starts_with("+++ "));
    let has_hunk = text.lines().any(|l| l.starts_with("@@"));
    has_old && has_new && has_hunk
}

/// Pull a unified diff out of the response, preferring fenced blocks.
fn extract_diff(raw: &str) -> Option<String> {
    let mut in_fence = false;
    let mut block = String::new();
    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            if in_fence {
                if looks_like_diff(&block) {
                    return Some(block);
                }
                block.clear();
            }
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            block.push_str(line);
            block.push('\n');
        }
    }

    let trimmed = raw.trim();
    if looks_like_diff(trimmed) {
        let mut diff = trimmed.to_string();
        diff.push('\n');
        return Some(diff);
    }
    None
}

/// Try to read the response as a JSON `{edits: [...]}` document.
fn parse_edits(raw: &str) -> Option<Vec<Edit>> {
    let trimmed = strip_fences(raw);
    let fragment = extract_json_object(trimmed)?;
    let payload: EditsPayload = serde_json::from_str(fragment).ok()?;
    (!payload.edits.is_empty()).then_some(payload.edits)
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start <= end).then(|| &text[start..=end])
}

/// Compile find/replace edits into a unified diff against the current tree.
///
/// Deterministic: `find` is located verbatim (first occurrence) in the
/// current contents of `path`, and the original vs. replaced text is diffed
/// per file. Paths are confined to the repo root.
pub fn compile_edits(repo_root: &Path, edits: &[Edit]) -> anyhow::Result<String> {
    // Group edits per file so multiple edits to one file produce one diff.
    let mut order: Vec<String> = Vec::new();
    for edit in edits {
        if !order.contains(&edit.path) {
            order.push(edit.path.clone());
        }
    }

    let mut diff = String::new();
    for path in &order {
        let resolved = resolve_repo_relative(repo_root, Path::new(path)).map_err(|reason| {
            EditPathError {
                path: path.clone(),
                reason,
            }
        })?;
        let original = fs::read_to_string(&resolved).map_err(|_| EditNotFoundError {
            path: path.clone(),
            find: "(file not readable)".to_string(),
        })?;

        let mut updated = original.clone();
        for edit in edits.iter().filter(|e| &e.path == path) {
            if !updated.contains(&edit.find) {
                return Err(EditNotFoundError {
                    path: path.clone(),
                    find: edit.find.clone(),
                }
                .into());
            }
            updated = updated.replacen(&edit.find, &edit.replace, 1);
        }

        let file_diff = similar::TextDiff::from_lines(&original, &updated)
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{}", path), &format!("b/{}", path))
            .to_string();
        diff.push_str(&file_diff);
    }

    Ok(diff)
}

/// Build the improvement prompt from the current quality picture and the
/// constraints a patch must respect.
pub fn build_prompt(baseline: &MetricsSummary, policy: &GuardPolicy) -> String {
    format!(
        r#"You are optimizing a browser game for runtime quality. Your ONLY output must be either a unified diff patch or a JSON document {{"edits": [{{"path", "find", "replace"}}]}}.

Current measurements (median of repeated runs):
- load time: {:.0} ms
- frames per second: {:.1}
- console errors: {:.1}
- bundle size: {:.1} kb

Goal: improve FPS, load time, or bundle size without introducing console errors.

Constraints:
1. Only modify files under `{}`
2. Change at most {} files and {} lines total
3. Never touch: {}
4. A unified diff must start with --- a/path and +++ b/path, include @@ hunk headers, and apply cleanly with `git apply`
5. Do NOT include explanations or any text outside the patch"#,
        baseline.load_ms,
        baseline.fps,
        baseline.console_error_count,
        baseline.bundle_kb,
        policy.allowed_path_prefix,
        policy.max_changed_files,
        policy.max_changed_lines,
        policy.forbidden_paths.join(", "),
    )
}
