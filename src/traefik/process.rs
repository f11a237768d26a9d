/*-
 * ========================LICENSE_START=================================
 * Routier Traefik Controller
 * %%
 * Copyright (C) 2020 - 2024 aixigo AG
 * %%
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 * =========================LICENSE_END==================================
 */

use crate::traefik::TraefikError;
use log::{debug, info, warn};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Supervises an embedded Traefik child process: spawn with the rendered
/// static configuration, forward its output into the controller's log, and
/// stop it with grace before resorting to SIGKILL.
pub struct TraefikProcess {
    child: Child,
}

impl TraefikProcess {
    pub fn spawn(binary: &Path, static_config_file: &Path) -> Result<Self, TraefikError> {
        let mut child = Command::new(binary)
            .arg("--configfile")
            .arg(static_config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TraefikError::Spawn {
                err: format!("{}: {err}", binary.display()),
            })?;

        if let Some(stdout) = child.stdout.take() {
            Self::forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            Self::forward_output(stderr, "stderr");
        }

        info!(
            "Spawned traefik (pid {}) with static configuration {}",
            child.id().unwrap_or_default(),
            static_config_file.display()
        );

        Ok(Self { child })
    }

    fn forward_output<R>(reader: R, stream: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "traefik", "[{stream}] {line}");
            }
        });
    }

    /// Asks the child to terminate and escalates to SIGKILL when the grace
    /// period elapses.
    pub async fn stop(mut self, grace_period: Duration) {
        self.terminate();

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("traefik exited with {status}");
            }
            Ok(Err(err)) => {
                warn!("Cannot await traefik's exit: {err}");
            }
            Err(_) => {
                warn!("traefik did not exit within {grace_period:?}, killing it");
                if let Err(err) = self.child.kill().await {
                    warn!("Cannot kill traefik: {err}");
                }
            }
        }
    }

    /// Terminates the child without grace, used when startup fails.
    pub async fn kill(mut self) {
        if let Err(err) = self.child.kill().await {
            warn!("Cannot kill traefik: {err}");
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Cannot send SIGTERM to traefik: {err}");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!("Cannot terminate traefik: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_missing_binary_as_spawn_error() {
        let result = TraefikProcess::spawn(
            Path::new("/does/not/exist/traefik"),
            Path::new("traefik.toml"),
        );

        assert!(matches!(result, Err(TraefikError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_completes_when_the_child_already_exited() {
        let process = TraefikProcess::spawn(Path::new("echo"), Path::new("traefik.toml")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), process.stop(Duration::from_secs(2)))
            .await
            .expect("stop() should finish well before the timeout");
    }
}
