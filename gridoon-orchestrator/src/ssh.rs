// Remote command execution over SSH.
//
// `OpenSshConnector` drives the local OpenSSH client: `connect` starts a
// control master, every command rides on it as `bash -s` with the script on
// stdin, and closing the session stops the master.

use async_trait::async_trait;
use gridoon_common::{poll_until, PollSettings, PollStep};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// OpenSSH reserves this exit code for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub private_key: PathBuf,
    pub port: u16,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            private_key: private_key.into(),
            port: 22,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// Refused, timed out, or dropped during key exchange. Worth retrying.
    #[error("cannot reach {destination}: {detail}")]
    Connect { destination: String, detail: String },
    #[error("authentication rejected by {destination}: {detail}")]
    Auth { destination: String, detail: String },
    #[error("no SSH session to {destination} after {attempts} attempts: {last}")]
    RetriesExhausted {
        destination: String,
        attempts: u32,
        #[source]
        last: Box<SshError>,
    },
    #[error("SSH session to {destination} failed: {detail}")]
    Session { destination: String, detail: String },
    #[error("cannot run local ssh client: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SshError::Connect { .. })
    }
}

/// Map a failed `ssh` invocation to an error kind from its exit code and stderr.
pub fn classify_failure(destination: &str, exit_code: Option<i32>, stderr: &str) -> SshError {
    let detail = last_line(stderr).unwrap_or("ssh exited without diagnostics").to_string();
    let destination = destination.to_string();
    if stderr.contains("Permission denied") || stderr.contains("Too many authentication failures") {
        return SshError::Auth { destination, detail };
    }
    match exit_code {
        Some(SSH_TRANSPORT_EXIT) | None => SshError::Connect { destination, detail },
        Some(code) => SshError::Session {
            destination,
            detail: format!("exit={} {}", code, detail),
        },
    }
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

fn tail_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An authenticated connection able to run shell scripts.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn destination(&self) -> String;

    /// Run `script` in a remote shell and wait for it to exit.
    async fn exec(&self, script: &str) -> Result<CommandOutput, SshError>;

    /// Release the connection. Calling it twice is harmless.
    async fn close(&mut self);
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError>;
}

// --- OpenSSH ---

#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    pub connect_timeout_s: u64,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self { connect_timeout_s: 10 }
    }
}

fn base_options(cmd: &mut Command, control_path: &Path, target: &SshTarget) {
    cmd.arg("-o")
        .arg(format!("ControlPath={}", control_path.display()))
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("LogLevel=ERROR")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-p")
        .arg(target.port.to_string());
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError> {
        let control_dir = tempfile::Builder::new().prefix("gridoon-ssh").tempdir()?;
        let control_path = control_dir.path().join("master.sock");
        let log_path = control_dir.path().join("master.log");

        let mut cmd = Command::new("ssh");
        cmd.args(["-M", "-f", "-N"])
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_s))
            .arg("-o")
            .arg("IdentitiesOnly=yes")
            .arg("-i")
            .arg(&target.private_key)
            .arg("-E")
            .arg(&log_path);
        base_options(&mut cmd, &control_path, target);
        // The backgrounded master inherits stdio; pipes would never reach EOF.
        let status = cmd
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
            return Err(classify_failure(&target.destination(), status.code(), &log));
        }
        tracing::debug!("[ssh] Control master up for {}", target.destination());
        Ok(Box::new(OpenSshSession {
            target: target.clone(),
            control_path,
            _control_dir: control_dir,
            closed: false,
        }))
    }
}

struct OpenSshSession {
    target: SshTarget,
    control_path: PathBuf,
    _control_dir: tempfile::TempDir,
    closed: bool,
}

impl OpenSshSession {
    fn exit_master_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new("ssh");
        cmd.arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn destination(&self) -> String {
        self.target.destination()
    }

    async fn exec(&self, script: &str) -> Result<CommandOutput, SshError> {
        if self.closed {
            return Err(SshError::Session {
                destination: self.destination(),
                detail: "session already closed".into(),
            });
        }
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("ControlMaster=no");
        base_options(&mut cmd, &self.control_path, &self.target);
        let mut child = cmd
            .arg(self.target.destination())
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            // Dropping stdin sends EOF so `bash -s` can finish.
        }
        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.code() == Some(SSH_TRANSPORT_EXIT) || output.status.code().is_none() {
            return Err(classify_failure(&self.destination(), output.status.code(), &stderr));
        }
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut cmd = Command::from(self.exit_master_command());
        match cmd.status().await {
            Ok(status) if status.success() => {
                tracing::debug!("[ssh] Control master for {} stopped", self.destination())
            }
            Ok(status) => tracing::warn!(
                "⚠️ [ssh] Stopping control master for {} exited with {}",
                self.destination(),
                status
            ),
            Err(e) => tracing::warn!("⚠️ [ssh] Cannot stop control master for {}: {}", self.destination(), e),
        }
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.exit_master_command().spawn();
        }
    }
}

// --- Executor ---

#[derive(Debug, Clone, Copy)]
pub struct ConnectRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(7),
        }
    }
}

/// A read-only probe polled until its trimmed output equals `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub name: String,
    pub probe: String,
    pub expected: String,
    pub poll: PollSettings,
}

impl ReadinessCheck {
    pub fn container(name: &str, status: &str, poll: PollSettings) -> Self {
        Self {
            name: name.to_string(),
            probe: format!("docker inspect --format='{{{{.State.Status}}}}' {}", name),
            expected: status.to_string(),
            poll,
        }
    }

    pub fn cloud_init(poll: PollSettings) -> Self {
        Self {
            name: "cloud-init".to_string(),
            probe: "cloud-init status 2>/dev/null | sed -n 's/^status: //p'".to_string(),
            expected: "done".to_string(),
            poll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ReadinessOutcome {
    pub check: String,
    pub expected: String,
    pub ready: bool,
}

#[derive(Clone)]
pub struct RemoteExecutor {
    connector: Arc<dyn SshConnector>,
    retry: ConnectRetry,
}

impl RemoteExecutor {
    pub fn new(connector: Arc<dyn SshConnector>) -> Self {
        Self {
            connector,
            retry: ConnectRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ConnectRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Open a session, retrying transport failures. Authentication failures
    /// are returned at once.
    pub async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.open(target).await {
                Ok(session) => {
                    tracing::info!("🔌 [ssh] Connected to {} (attempt {}/{})", target.destination(), attempt, attempts);
                    return Ok(session);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!("❌ [ssh] {}", e);
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    tracing::error!("❌ [ssh] Giving up on {} after {} attempts: {}", target.destination(), attempts, e);
                    return Err(SshError::RetriesExhausted {
                        destination: target.destination(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "⏳ [ssh] Attempt {}/{} to {} failed: {}. Retrying in {}s",
                        attempt,
                        attempts,
                        target.destination(),
                        e,
                        self.retry.delay.as_secs()
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
            }
        }
    }

    /// Run one script and return its stdout. A non-zero exit is logged, not raised.
    pub async fn run_command(&self, session: &dyn RemoteSession, script: &str) -> Result<String, SshError> {
        let output = session.exec(script).await?;
        if !output.success() {
            tracing::warn!(
                "⚠️ [ssh] Command on {} exited with {:?}: {}",
                session.destination(),
                output.exit_code,
                tail_str(output.stderr.trim(), 2000)
            );
        }
        Ok(output.stdout)
    }

    /// `true` once `probe` prints `expected`; `false` on timeout or when the
    /// session breaks while probing.
    pub async fn poll_remote_state(
        &self,
        session: &dyn RemoteSession,
        probe: &str,
        expected: &str,
        poll: PollSettings,
    ) -> bool {
        poll_until(poll, || async move {
            match session.exec(probe).await {
                Ok(output) if output.stdout.trim() == expected => PollStep::Ready,
                Ok(output) => {
                    tracing::debug!("[ssh] Waiting for {:?}, got {:?}", expected, output.stdout.trim());
                    PollStep::Pending
                }
                Err(e) => {
                    tracing::warn!("⚠️ [ssh] Probe on {} failed: {}", session.destination(), e);
                    PollStep::Abort
                }
            }
        })
        .await
    }

    /// Connect, run `script`, then poll each check in order. The session is
    /// closed on every path.
    pub async fn send_and_await(
        &self,
        target: &SshTarget,
        script: &str,
        checks: &[ReadinessCheck],
    ) -> Result<Vec<ReadinessOutcome>, SshError> {
        let mut session = self.connect(target).await?;
        let result = self.run_and_check(session.as_ref(), script, checks).await;
        session.close().await;
        result
    }

    async fn run_and_check(
        &self,
        session: &dyn RemoteSession,
        script: &str,
        checks: &[ReadinessCheck],
    ) -> Result<Vec<ReadinessOutcome>, SshError> {
        if !script.trim().is_empty() {
            let stdout = self.run_command(session, script).await?;
            tracing::debug!("[ssh] Output from {}: {}", session.destination(), tail_str(stdout.trim(), 4000));
        }
        let mut outcomes = Vec::with_capacity(checks.len());
        for check in checks {
            tracing::info!("⏳ [ssh] Waiting for {} to report {}", check.name, check.expected);
            let ready = self
                .poll_remote_state(session, &check.probe, &check.expected, check.poll)
                .await;
            if ready {
                tracing::info!("✅ [ssh] {} reports {}", check.name, check.expected);
            } else {
                tracing::warn!("⚠️ [ssh] {} did not report {} in time", check.name, check.expected);
            }
            outcomes.push(ReadinessOutcome {
                check: check.name.clone(),
                expected: check.expected.clone(),
                ready,
            });
        }
        Ok(outcomes)
    }
}
