//! Supervision of one probe-host subprocess: spawn, port handshake,
//! bootstrap, output draining and teardown.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Child;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::app::App;
use crate::connection::WorkerConnection;
use crate::error::EngineError;
use crate::wire::{Command, Response};

/// How long the subprocess gets to announce its listen port.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for each bootstrap command round-trip.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for the `quit` round-trip and the subsequent exit wait.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for `wakeup` liveness probes.
const WAKEUP_TIMEOUT: Duration = Duration::from_secs(2);

/// First stdout line of a healthy probe host, announcing its TCP port.
static PORT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^INFO: .*?(?P<port>\d+)$").expect("static regex"));

/// A single probe-host subprocess. Single-use: once startup fails or the
/// process exits, the supervisor must be discarded.
pub struct WorkerSupervisor {
    id: String,
    app: App,
    script: PathBuf,
    profile: Option<PathBuf>,
    prefs: Option<Vec<String>>,
    port: Option<u16>,
    child: Option<Child>,
}

impl WorkerSupervisor {
    pub fn new(
        app: &App,
        script: impl Into<PathBuf>,
        profile: Option<PathBuf>,
        prefs: Option<Vec<String>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app: app.clone(),
            script: script.into(),
            profile,
            prefs,
            port: None,
            child: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn startup_err(&mut self, reason: impl Into<String>) -> EngineError {
        self.terminate();
        EngineError::Startup {
            worker_id: self.id.clone(),
            reason: reason.into(),
        }
    }

    /// Spawn the subprocess, wait for its port announcement, drain its
    /// output for the process lifetime and run the bootstrap sequence.
    /// Any failure is fatal to this supervisor.
    pub async fn spawn(&mut self, port: u16) -> Result<u16, EngineError> {
        if self.child.is_some() {
            tracing::warn!(worker = self.id, "re-spawning a worker that was already running");
            self.terminate();
        }

        // Both output streams land in one pipe; the worker tags its log
        // lines, so stderr carries no separate framing.
        let (output, stdout, stderr) = merged_output_pipe()
            .map_err(|err| self.startup_err(format!("can't create output pipe: {err}")))?;
        let mut cmd = self.app.probe_command(&self.script, port);
        cmd.stdout(stdout).stderr(stderr);
        tracing::debug!(worker = self.id, ?cmd, "spawning probe host");
        let child = cmd
            .spawn()
            .map_err(|err| self.startup_err(format!("spawn failed: {err}")))?;
        self.child = Some(child);

        // One reader thread per worker, life-tied to the subprocess: it
        // hands back the first status line, then forwards the rest to
        // the host logger until EOF.
        let (status_tx, status_rx) = oneshot::channel();
        let worker_id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            drain_output(worker_id, BufReader::new(output), status_tx);
        });

        // The first line reports startup status and the listen port.
        let status = match tokio::time::timeout(STARTUP_TIMEOUT, status_rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                return Err(self.startup_err("probe host closed its output before startup"));
            }
            Err(_) => return Err(self.startup_err("no startup status within timeout")),
        };
        tracing::debug!(worker = self.id, status, "startup status");

        let listen_port = PORT_LINE
            .captures(&status)
            .and_then(|caps| caps.name("port"))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .ok_or_else(|| self.startup_err(format!("can't get socket on requested port {port}")))?;
        self.port = Some(listen_port);

        let mut conn = WorkerConnection::new(listen_port).with_timeout(BOOTSTRAP_TIMEOUT);
        let result = self.bootstrap(&mut conn).await;
        conn.close().await;
        result?;

        tracing::debug!(worker = self.id, port = listen_port, "worker is up");
        Ok(listen_port)
    }

    async fn bootstrap(&mut self, conn: &mut WorkerConnection) -> Result<(), EngineError> {
        tracing::debug!(worker = self.id, "syncing worker id");
        let set_id = Command::set_id(&self.id);
        self.bootstrap_command(conn, set_id).await?;

        if let Some(profile) = self.profile.clone() {
            tracing::debug!(worker = self.id, profile = %profile.display(), "switching worker profile");
            self.bootstrap_command(conn, Command::use_profile(&profile))
                .await?;
        }

        if let Some(prefs) = self.prefs.clone() {
            tracing::debug!(worker = self.id, ?prefs, "setting worker prefs");
            self.bootstrap_command(conn, Command::set_prefs(&prefs))
                .await?;
        }
        Ok(())
    }

    /// A bootstrap command must be ACKed and then answered successfully;
    /// anything else, transport failures included, terminates the
    /// subprocess.
    async fn bootstrap_command(
        &mut self,
        conn: &mut WorkerConnection,
        cmd: Command,
    ) -> Result<(), EngineError> {
        let mode = cmd.mode.as_str();
        if let Err(err) = conn.send(&cmd, true, None).await {
            return Err(self.startup_err(format!("`{mode}` send failed: {err}")));
        }

        let ack = match conn.receive(None).await {
            Ok(reply) => reply,
            Err(err) => {
                return Err(self.startup_err(format!("`{mode}` receive failed: {err}")));
            }
        };
        let acked = matches!(&ack, Some(reply) if reply.is_ack()
            && reply.command_id() == Some(cmd.id.to_string().as_str()));
        if !acked {
            return Err(self.startup_err(format!("`{mode}` was not acknowledged")));
        }

        let reply = match conn.receive(None).await {
            Ok(reply) => reply,
            Err(err) => {
                return Err(self.startup_err(format!("`{mode}` receive failed: {err}")));
            }
        };
        let succeeded = matches!(&reply, Some(Response::Final(fin)) if fin.is_success()
            && fin.command_id == cmd.id.to_string());
        if !succeeded {
            return Err(self.startup_err(format!("`{mode}` failed during bootstrap")));
        }
        Ok(())
    }

    /// Whether the subprocess is alive and responsive: it must have no
    /// exit status and answer a `wakeup` probe with an ACK.
    pub async fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return false;
        }
        let Some(port) = self.port else {
            return false;
        };
        let mut conn = WorkerConnection::new(port).with_timeout(WAKEUP_TIMEOUT);
        let reply = conn.ask(&Command::wakeup(), false, false, None).await;
        conn.close().await;
        matches!(reply, Ok(Some(response)) if response.is_ack())
    }

    /// Ask the worker to quit and wait briefly for it; escalates to
    /// SIGTERM and SIGKILL when it doesn't comply.
    pub async fn quit(&mut self) {
        if let Some(port) = self.port {
            let mut conn = WorkerConnection::new(port).with_timeout(QUIT_TIMEOUT);
            if let Err(err) = conn.ask(&Command::quit(), false, false, None).await {
                tracing::debug!(worker = self.id, %err, "quit command failed");
            }
            conn.close().await;
        }

        let Some(child) = self.child.as_mut() else {
            return;
        };
        match tokio::time::timeout(QUIT_TIMEOUT, child.wait()).await {
            Ok(_) => {
                self.child = None;
            }
            Err(_) => {
                tracing::warn!(worker = self.id, "worker ignored quit, terminating");
                self.terminate();
                self.kill().await;
            }
        }
    }

    /// Send SIGTERM to the subprocess.
    pub fn terminate(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Some(pid) = child.id() {
                // Child::kill sends SIGKILL; a plain terminate goes
                // through the signal directly.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }

    /// SIGKILL the subprocess and reap it.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill().await {
                tracing::debug!(worker = self.id, %err, "kill failed");
            }
            self.child = None;
        }
    }
}

/// A pipe carrying the subprocess's merged stdout and stderr, plus the
/// two write handles to wire into the child.
fn merged_output_pipe() -> std::io::Result<(File, Stdio, Stdio)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let read = unsafe { File::from_raw_fd(fds[0]) };
    let write = unsafe { File::from_raw_fd(fds[1]) };
    let stdout = Stdio::from(write.try_clone()?);
    let stderr = Stdio::from(write);
    Ok((read, stdout, stderr))
}

/// The per-worker reader thread: reports the startup status line, then
/// forwards every further line to the host logger, classified by the
/// worker's line tags. Ends when the subprocess closes its output.
fn drain_output(worker_id: String, mut reader: BufReader<File>, status_tx: oneshot::Sender<String>) {
    tracing::debug!(worker = worker_id, "output reader started");

    let mut status = String::new();
    match reader.read_line(&mut status) {
        Ok(n) if n > 0 => {
            let _ = status_tx.send(status.trim().to_string());
        }
        _ => {
            drop(status_tx);
            tracing::debug!(worker = worker_id, "output reader finished");
            return;
        }
    }

    for line in reader.lines() {
        match line {
            Ok(line) => log_worker_line(&worker_id, line.trim()),
            Err(_) => break,
        }
    }
    tracing::debug!(worker = worker_id, "output reader finished");
}

fn log_worker_line(worker_id: &str, line: &str) {
    if line.is_empty() {
        return;
    }
    if let Some(msg) = line.strip_prefix("DEBUG:") {
        tracing::debug!(worker = worker_id, "{}", msg.trim());
    } else if let Some(msg) = line.strip_prefix("INFO:") {
        tracing::info!(worker = worker_id, "{}", msg.trim());
    } else if let Some(msg) = line.strip_prefix("WARNING:") {
        tracing::warn!(worker = worker_id, "{}", msg.trim());
    } else if let Some(msg) = line.strip_prefix("ERROR:") {
        tracing::error!(worker = worker_id, "{}", msg.trim());
    } else if let Some(msg) = line.strip_prefix("CRITICAL:") {
        tracing::error!(worker = worker_id, critical = true, "{}", msg.trim());
    } else if line.starts_with("JavaScript error:") {
        tracing::error!(worker = worker_id, "{line}");
    } else if line.starts_with("JavaScript warning:") {
        tracing::warn!(worker = worker_id, "{line}");
    } else {
        tracing::error!(worker = worker_id, "unexpected worker output: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_line_parsing() {
        let caps = PORT_LINE.captures("INFO: worker is listening on port 49152");
        assert_eq!(
            caps.and_then(|c| c.name("port")).map(|m| m.as_str()),
            Some("49152")
        );
        assert!(PORT_LINE.captures("ERROR: no socket").is_none());
        assert!(PORT_LINE.captures("INFO: no port here").is_none());
    }
}
