//! Loop configuration.
//!
//! Defaults cover a Vite-style web game checkout; an optional
//! `hillclimb.json` in the target repo overrides them, and CLI flags win
//! over both.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::decide::DecisionConfig;
use crate::error::ConfigError;
use crate::guard::GuardPolicy;
use crate::metrics::MeasureConfig;

pub const CONFIG_FILE_NAME: &str = "hillclimb.json";

fn default_iterations() -> usize {
    1
}
fn default_repeats() -> usize {
    3
}
fn default_screenshot_every() -> usize {
    5
}
fn default_port() -> u16 {
    4173
}
fn default_dist_dir() -> PathBuf {
    PathBuf::from("dist")
}
fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".hillclimb")
}
fn default_build_command() -> String {
    "npm run build".to_string()
}
fn default_serve_command() -> String {
    "npx vite preview --port {port} --strictPort".to_string()
}
fn default_build_timeout_secs() -> u64 {
    600
}
fn default_ready_timeout_secs() -> u64 {
    30
}
fn default_nav_timeout_secs() -> u64 {
    30
}
fn default_render_wait_secs() -> u64 {
    15
}
fn default_fps_window_ms() -> u64 {
    2000
}
fn default_service_timeout_secs() -> u64 {
    120
}
fn default_service_retries() -> usize {
    3
}
fn default_generation_attempts() -> usize {
    3
}

/// Full configuration for one loop invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Repository whose working tree the loop mutates.
    #[serde(skip)]
    pub repo_root: PathBuf,

    /// URL to measure. Defaults to the local preview server.
    pub url: Option<String>,
    pub port: u16,
    pub iterations: usize,
    /// Samples per measurement phase.
    pub repeats: usize,
    /// Capture a diagnostic screenshot every K iterations (0 disables).
    pub screenshot_every: usize,
    /// Build output directory, relative to the repo root.
    pub dist_dir: PathBuf,
    /// Where records and screenshots land, relative to the repo root.
    pub artifacts_dir: PathBuf,

    pub build_command: String,
    pub serve_command: String,
    pub build_timeout_secs: u64,
    pub ready_timeout_secs: u64,

    pub nav_timeout_secs: u64,
    pub render_wait_secs: u64,
    pub fps_window_ms: u64,

    /// Patch-generation endpoint. Falls back to HILLCLIMB_SERVICE_URL.
    pub service_endpoint: Option<String>,
    pub service_timeout_secs: u64,
    /// Retries inside one service call.
    pub service_retries: usize,
    /// Normalize-and-dry-run attempts per iteration.
    pub generation_attempts: usize,

    pub policy: GuardPolicy,
    pub decision: DecisionConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            url: None,
            port: default_port(),
            iterations: default_iterations(),
            repeats: default_repeats(),
            screenshot_every: default_screenshot_every(),
            dist_dir: default_dist_dir(),
            artifacts_dir: default_artifacts_dir(),
            build_command: default_build_command(),
            serve_command: default_serve_command(),
            build_timeout_secs: default_build_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            nav_timeout_secs: default_nav_timeout_secs(),
            render_wait_secs: default_render_wait_secs(),
            fps_window_ms: default_fps_window_ms(),
            service_endpoint: None,
            service_timeout_secs: default_service_timeout_secs(),
            service_retries: default_service_retries(),
            generation_attempts: default_generation_attempts(),
            policy: GuardPolicy::default(),
            decision: DecisionConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Load from `hillclimb.json` in the repo if present, else defaults.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| ConfigError::new(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str(&content)
                .map_err(|e| ConfigError::new(format!("invalid {}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.repo_root = repo_root.to_path_buf();
        Ok(config)
    }

    /// The URL the collector measures.
    pub fn target_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}/", self.port))
    }

    /// Patch-service endpoint, config first, environment second.
    pub fn service_endpoint(&self) -> Result<String, ConfigError> {
        self.service_endpoint
            .clone()
            .or_else(|| std::env::var("HILLCLIMB_SERVICE_URL").ok())
            .ok_or_else(|| {
                ConfigError::new(
                    "no patch service endpoint configured \
                     (set service_endpoint or HILLCLIMB_SERVICE_URL)",
                )
            })
    }

    pub fn dist_path(&self) -> PathBuf {
        self.repo_root.join(&self.dist_dir)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.repo_root.join(&self.artifacts_dir)
    }

    /// Measurement knobs for one phase.
    pub fn measure_config(&self, iteration: usize, label: &str) -> MeasureConfig {
        let cadence_hit =
            self.screenshot_every != 0 && iteration % self.screenshot_every == 0;
        MeasureConfig {
            dist_dir: self.dist_path(),
            nav_timeout: Duration::from_secs(self.nav_timeout_secs),
            render_wait: Duration::from_secs(self.render_wait_secs),
            fps_window_ms: self.fps_window_ms,
            screenshot_dir: self.artifacts_path().join("screenshots"),
            screenshot_requested: cadence_hit,
            iteration,
            label: label.to_string(),
        }
    }

    /// Sanity-check the whole surface before the loop starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::new("iterations must be at least 1"));
        }
        if self.repeats == 0 {
            return Err(ConfigError::new("repeats must be at least 1"));
        }
        if self.port == 0 {
            return Err(ConfigError::new("port must be nonzero"));
        }
        if let Some(url) = &self.url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::new(format!("invalid target url {}: {}", url, e)))?;
        }
        if self.policy.allowed_path_prefix.is_empty() {
            return Err(ConfigError::new("allowed_path_prefix must not be empty"));
        }
        for pattern in self
            .policy
            .forbidden_file_patterns
            .iter()
            .chain(self.policy.critical_markers.iter())
        {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::new(format!("invalid policy pattern {:?}: {}", pattern, e))
            })?;
        }
        Ok(())
    }
}
