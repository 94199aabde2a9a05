//! Preview-server lifecycle.
//!
//! The server subprocess is a scoped resource on a fixed port: started at the
//! top of a measurement phase and guaranteed dead before the next phase, even
//! on error paths. A leaked process would deterministically break the next
//! phase's bind, so the kill also happens in `Drop`.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::util::split_command;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A running preview server bound to one port.
pub struct PreviewServer {
    child: Child,
    port: u16,
}

impl PreviewServer {
    /// Spawn the serve command and wait until `GET /` answers 200.
    ///
    /// `{port}` and `{dist}` placeholders in the command are substituted.
    /// On readiness timeout the child is killed before returning.
    pub async fn start(
        serve_command: &str,
        repo_root: &Path,
        dist_dir: &Path,
        port: u16,
        ready_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let rendered = serve_command
            .replace("{port}", &port.to_string())
            .replace("{dist}", &dist_dir.display().to_string());
        let (program, args) = split_command(&rendered).map_err(|e| anyhow::anyhow!(e))?;

        tracing::debug!(command = %rendered, port, "starting preview server");
        let child = Command::new(&program)
            .args(&args)
            .current_dir(repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start preview server ({}): {}", program, e))?;

        let mut server = Self { child, port };

        match server.wait_ready(ready_timeout).await {
            Ok(()) => Ok(server),
            Err(err) => {
                server.kill();
                Err(err)
            }
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    async fn wait_ready(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        let url = self.url();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                anyhow::bail!("preview server exited early with {}", status);
            }
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    tracing::trace!(status = %response.status(), "server not ready");
                }
                Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "preview server never became ready on port {} within {:?}",
                    self.port,
                    timeout
                );
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    /// Stop the server, releasing the port.
    pub fn stop(mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for PreviewServer {
    fn drop(&mut self) {
        self.kill();
    }
}
