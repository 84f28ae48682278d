//! Server stage - spawning, readiness and process-group teardown

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::poll::poll_until;
use crate::scope::Scoped;
use crate::stage::log::LogSink;

/// Handle to a running static server and every process it forked.
#[derive(Debug)]
pub struct ServerStage {
    child: Option<Child>,
    group: Pid,
    port: u16,
    stop_grace: Duration,
}

impl ServerStage {
    /// Spawn the server in its own process group, serving `directory` on `port`.
    ///
    /// Waits the configured settling interval, then (if enabled) polls the
    /// port until it accepts connections. The server exiting during startup
    /// fails with [`HarnessError::ServerStart`].
    pub async fn start(
        config: &ServerConfig,
        project_root: &Path,
        directory: &Path,
        port: u16,
        log: &LogSink,
    ) -> HarnessResult<Self> {
        info!(port, directory = %directory.display(), "spawning server");
        log.note(&format!(
            "$ {} {} --dir {} --port {}",
            config.program,
            config.args.join(" "),
            directory.display(),
            port
        ))?;

        let child = Command::new(&config.program)
            .args(&config.args)
            .arg("--dir")
            .arg(directory)
            .arg("--port")
            .arg(port.to_string())
            .current_dir(project_root)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .spawn()
            .map_err(|e| {
                HarnessError::ServerStart(format!("failed to spawn {}: {}", config.program, e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| HarnessError::ServerStart("server exited before it could be tracked".into()))?;
        let pid = i32::try_from(pid)
            .map_err(|_| HarnessError::ServerStart(format!("pid {pid} out of range")))?;

        let mut stage = Self {
            child: Some(child),
            group: Pid::from_raw(pid),
            port,
            stop_grace: config.stop_grace(),
        };

        sleep(config.settle()).await;

        if config.readiness_probe {
            if let Err(e) = stage.wait_until_listening(config).await {
                stage.stop().await?;
                return Err(e);
            }
        }

        info!(port, pid, "server started");
        Ok(stage)
    }

    async fn wait_until_listening(&mut self, config: &ServerConfig) -> HarnessResult<()> {
        let port = self.port;
        let what = format!("server on port {port}");
        let Some(child) = self.child.as_mut() else {
            return Err(HarnessError::ServerStart("server is not running".into()));
        };

        tokio::select! {
            ready = poll_until(&what, config.readiness(), move || accepts_connections(port)) => ready,
            status = child.wait() => {
                let status = status?;
                Err(HarnessError::ServerStart(format!("server exited during startup with {status}")))
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Process group id, equal to the server's pid
    pub fn group(&self) -> Pid {
        self.group
    }

    /// Interrupt the whole process group and reap the server.
    ///
    /// A group that is already gone, or one we may no longer signal, is not an
    /// error. If the server outlives the grace period the group is killed.
    /// Idempotent.
    pub async fn stop(&mut self) -> HarnessResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        info!(port = self.port, group = %self.group, "stopping server");
        signal_group(self.group, Signal::SIGINT);

        let status = match timeout(self.stop_grace, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(group = %self.group, grace = ?self.stop_grace, "server ignored SIGINT, killing group");
                signal_group(self.group, Signal::SIGKILL);
                child.wait().await?
            }
        };

        debug!(port = self.port, status = %describe(status), "server reaped");
        Ok(())
    }
}

#[async_trait]
impl Scoped for ServerStage {
    async fn release(&mut self) -> HarnessResult<()> {
        self.stop().await
    }
}

impl Drop for ServerStage {
    fn drop(&mut self) {
        if self.child.take().is_some() {
            signal_group(self.group, Signal::SIGKILL);
        }
    }
}

fn signal_group(group: Pid, signal: Signal) {
    match killpg(group, signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {
            debug!(%group, ?signal, "process group already gone");
        }
        Err(e) => warn!(%group, ?signal, error = %e, "failed to signal process group"),
    }
}

async fn accepts_connections(port: u16) -> HarnessResult<bool> {
    Ok(TcpStream::connect(("127.0.0.1", port)).await.is_ok())
}

fn describe(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        _ => status.to_string(),
    }
}
