//! Metrics collection via headless-browser instrumentation.
//!
//! One `measure` call drives a fresh Chromium instance through: navigate,
//! best-effort start-button click, wait for a render surface, synthetic
//! pointer input, and a requestAnimationFrame FPS sample. Bundle size is
//! summed from the static assets in the build output directory.
//!
//! `measure` is total: any setup or navigation failure becomes a sample with
//! `success = false` and an error string, never a propagated exception.

use chrono::{DateTime, Utc};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Log::LogEntryLevel;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::util::truncate;

/// How many console error messages to keep verbatim on a sample.
const ERROR_SAMPLE_LIMIT: usize = 5;
const ERROR_SAMPLE_MAX_CHARS: usize = 200;

/// One browser run's worth of quality measurements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub success: bool,
    pub load_ms: f64,
    pub fps: f64,
    pub console_error_count: usize,
    pub console_error_samples: Vec<String>,
    pub bundle_kb: f64,
    pub screenshot_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl MetricsSample {
    fn failed(error: String, bundle_kb: f64, screenshot_path: Option<PathBuf>) -> Self {
        Self {
            success: false,
            load_ms: 0.0,
            fps: 0.0,
            console_error_count: 0,
            console_error_samples: Vec::new(),
            bundle_kb,
            screenshot_path,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }
}

/// Per-field median of repeated samples.
///
/// Only meaningful when at least one underlying sample succeeded; otherwise
/// `success` is false and the numeric fields carry no information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub success: bool,
    pub all_successful: bool,
    pub samples: usize,
    pub load_ms: f64,
    pub fps: f64,
    pub console_error_count: f64,
    pub bundle_kb: f64,
}

impl MetricsSummary {
    pub fn failed() -> Self {
        Self {
            success: false,
            all_successful: false,
            samples: 0,
            load_ms: 0.0,
            fps: 0.0,
            console_error_count: 0.0,
            bundle_kb: 0.0,
        }
    }
}

/// Knobs for a single measurement phase.
#[derive(Debug, Clone)]
pub struct MeasureConfig {
    /// Build output directory whose static assets make up the bundle size.
    pub dist_dir: PathBuf,
    /// Navigation deadline.
    pub nav_timeout: Duration,
    /// How long to wait for a render surface (canvas) to appear.
    pub render_wait: Duration,
    /// Length of the requestAnimationFrame sampling window.
    pub fps_window_ms: u64,
    /// Where diagnostic screenshots land.
    pub screenshot_dir: PathBuf,
    /// Capture a screenshot even on success (cadence diagnostics).
    pub screenshot_requested: bool,
    /// Iteration index, used to name screenshot files.
    pub iteration: usize,
    /// Label distinguishing baseline from candidate screenshots.
    pub label: String,
}

/// Click anything that looks like a start/continue affordance. Returning
/// null (nothing found) is not an error.
const START_CLICK_JS: &str = r#"
(() => {
  const words = ['start', 'play', 'continue', 'begin', 'ok'];
  const nodes = Array.from(document.querySelectorAll('button, [role="button"], .btn, a.button'));
  for (const n of nodes) {
    const t = (n.textContent || '').trim().toLowerCase();
    if (words.some((w) => t.includes(w))) {
      n.click();
      return t;
    }
  }
  return null;
})()
"#;

/// A small fixed set of synthetic pointer interactions over the render surface.
const POINTER_INTERACTION_JS: &str = r#"
(() => {
  const target = document.querySelector('canvas') || document.body;
  const r = target.getBoundingClientRect();
  const points = [[0.5, 0.5], [0.3, 0.4], [0.7, 0.6], [0.5, 0.25]];
  for (const [fx, fy] of points) {
    const x = r.left + r.width * fx;
    const y = r.top + r.height * fy;
    for (const type of ['pointerdown', 'pointermove', 'pointerup']) {
      target.dispatchEvent(new PointerEvent(type, { clientX: x, clientY: y, bubbles: true }));
    }
  }
  return points.length;
})()
"#;

fn fps_sample_js(window_ms: u64) -> String {
    format!(
        r#"
new Promise((resolve) => {{
  const windowMs = {window_ms};
  let frames = 0;
  let start = null;
  function tick(ts) {{
    if (start === null) start = ts;
    frames += 1;
    if (ts - start < windowMs) {{
      requestAnimationFrame(tick);
    }} else {{
      resolve((frames * 1000) / (ts - start));
    }}
  }}
  requestAnimationFrame(tick);
}})
"#
    )
}

struct BrowserRun {
    load_ms: f64,
    fps: f64,
    console_errors: Vec<String>,
    screenshot_path: Option<PathBuf>,
}

/// Measure one sample. Never returns an error; failures are encoded in the
/// sample itself so one bad run can't take down a measurement phase.
pub fn measure(url: &str, config: &MeasureConfig) -> MetricsSample {
    let bundle_kb = bundle_size_kb(&config.dist_dir);

    match browser_run(url, config) {
        Ok(run) => MetricsSample {
            success: true,
            load_ms: run.load_ms,
            fps: run.fps,
            console_error_count: run.console_errors.len(),
            console_error_samples: run
                .console_errors
                .iter()
                .take(ERROR_SAMPLE_LIMIT)
                .map(|s| truncate(s, ERROR_SAMPLE_MAX_CHARS))
                .collect(),
            bundle_kb,
            screenshot_path: run.screenshot_path,
            timestamp: Utc::now(),
            error: None,
        },
        Err(err) => {
            tracing::warn!(error = %err, url, "browser run failed");
            MetricsSample::failed(err.to_string(), bundle_kb, None)
        }
    }
}

fn browser_run(url: &str, config: &MeasureConfig) -> anyhow::Result<BrowserRun> {
    let options = LaunchOptions::default_builder()
        .headless(true)
        .sandbox(false)
        .window_size(Some((1280, 800)))
        .idle_browser_timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to configure browser launch: {}", e))?;

    // A fresh browser per sample: no cookies, caches, or listener state can
    // leak between runs.
    let browser = Browser::new(options)?;
    let tab = browser.new_tab()?;
    tab.set_default_timeout(config.nav_timeout);

    // Listeners must be attached before navigation or early errors are lost.
    let console_errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&console_errors);
    tab.enable_log()?;
    tab.enable_runtime()?;
    tab.add_event_listener(Arc::new(move |event: &Event| match event {
        Event::LogEntryAdded(e) => {
            if e.params.entry.level == LogEntryLevel::Error {
                if let Ok(mut errors) = sink.lock() {
                    errors.push(e.params.entry.text.clone());
                }
            }
        }
        Event::RuntimeExceptionThrown(e) => {
            let details = &e.params.exception_details;
            let description = details
                .exception
                .as_ref()
                .and_then(|obj| obj.description.clone())
                .unwrap_or_else(|| details.text.clone());
            if let Ok(mut errors) = sink.lock() {
                errors.push(description);
            }
        }
        _ => {}
    }))?;

    // Any failure past this point has a live tab, so navigation and
    // instrumentation failures alike leave a diagnostic image behind.
    let (load_ms, fps) = match navigate_and_instrument(&tab, url, config) {
        Ok(result) => result,
        Err(err) => {
            let _ = save_screenshot(&tab, config, "failure");
            return Err(err);
        }
    };

    let screenshot_path = if config.screenshot_requested {
        save_screenshot(&tab, config, &config.label).ok()
    } else {
        None
    };

    Ok(BrowserRun {
        load_ms,
        fps,
        console_errors: console_errors.lock().map(|e| e.clone()).unwrap_or_default(),
        screenshot_path,
    })
}

fn navigate_and_instrument(
    tab: &headless_chrome::Tab,
    url: &str,
    config: &MeasureConfig,
) -> anyhow::Result<(f64, f64)> {
    let nav_start = Instant::now();
    tab.navigate_to(url)?;
    tab.wait_until_navigated()?;
    let load_ms = nav_start.elapsed().as_secs_f64() * 1000.0;

    // Best-effort: a start screen may or may not exist.
    let _ = tab.evaluate(START_CLICK_JS, false);

    let fps = instrument(tab, config)?;
    Ok((load_ms, fps))
}

/// Wait for the render surface, poke it, and sample FPS.
fn instrument(tab: &headless_chrome::Tab, config: &MeasureConfig) -> anyhow::Result<f64> {
    tab.wait_for_element_with_custom_timeout("canvas", config.render_wait)
        .map_err(|e| anyhow::anyhow!("render surface (canvas) never appeared: {}", e))?;

    let _ = tab.evaluate(POINTER_INTERACTION_JS, false);

    let fps_result = tab.evaluate(&fps_sample_js(config.fps_window_ms), true)?;
    Ok(fps_result
        .value
        .as_ref()
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0))
}

fn screenshot_file_name(iteration: usize, label: &str) -> String {
    format!("iter-{:04}-{}.png", iteration, label)
}

fn save_screenshot(
    tab: &headless_chrome::Tab,
    config: &MeasureConfig,
    label: &str,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(&config.screenshot_dir)?;
    let path = config
        .screenshot_dir
        .join(screenshot_file_name(config.iteration, label));
    let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
    fs::write(&path, png)?;
    Ok(path)
}

/// Run `measure` sequentially `repeats` times, each in a fresh browser, and
/// reduce to a per-field median summary.
pub fn measure_repeated(url: &str, config: &MeasureConfig, repeats: usize) -> MetricsSummary {
    let mut samples = Vec::with_capacity(repeats);
    for i in 0..repeats {
        tracing::debug!(run = i + 1, of = repeats, url, "measuring");
        samples.push(measure(url, config));
    }
    summarize(&samples)
}

/// Median-aggregate samples. Zero successful samples yields `success = false`;
/// such a summary must never be read as evidence of anything.
pub fn summarize(samples: &[MetricsSample]) -> MetricsSummary {
    let successful: Vec<&MetricsSample> = samples.iter().filter(|s| s.success).collect();
    if successful.is_empty() {
        return MetricsSummary::failed();
    }

    MetricsSummary {
        success: true,
        all_successful: successful.len() == samples.len(),
        samples: successful.len(),
        load_ms: median(successful.iter().map(|s| s.load_ms).collect()),
        fps: median(successful.iter().map(|s| s.fps).collect()),
        console_error_count: median(
            successful
                .iter()
                .map(|s| s.console_error_count as f64)
                .collect(),
        ),
        bundle_kb: median(successful.iter().map(|s| s.bundle_kb).collect()),
    }
}

/// Median of a non-empty list. Browser timings are heavy-tailed (GC pauses,
/// cold caches); the median drops a single outlier entirely, where a mean
/// would smear it across the result.
pub fn median(mut values: Vec<f64>) -> f64 {
    debug_assert!(!values.is_empty());
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Sum the static JS/CSS/WASM asset bytes under the build output directory.
/// Source maps are dev artifacts and are excluded.
pub fn bundle_size_kb(dist_dir: &Path) -> f64 {
    let mut bytes = 0u64;
    for entry in WalkDir::new(dist_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(".map") {
            continue;
        }
        let counted = Path::new(name.as_ref())
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| matches!(ext, "js" | "css" | "wasm"));
        if counted {
            if let Ok(meta) = entry.metadata() {
                bytes += meta.len();
            }
        }
    }
    bytes as f64 / 1024.0
}
