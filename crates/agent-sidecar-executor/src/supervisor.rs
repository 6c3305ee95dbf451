//! Supervision of agent processes.
//!
//! Each execution spawns the agent binary in its own process group, writes
//! one JSON document to its stdin, and turns stdout/stderr lines into events
//! as the consumer pulls them. Whatever ends the execution (exit, timeout,
//! abandoned stream, shutdown) goes through one cleanup path that kills the
//! process tree if needed and unregisters the session.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_sidecar_core::{
    ActiveSessions, Event, EventParser, EventStream, ExecuteError, ExecuteRequest, Executor,
    SessionId, StreamTag,
};
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
    task::JoinSet,
    time::Instant,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    command::{self, CommandBuildError, CommandBuilder},
    config::SupervisorConfig,
    process_tree::{self, KillTreeConfig, ProcessTree, UnixProcessTree},
};

/// How long to wait for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);
/// Lines buffered between the pipe readers and the parser.
const LINE_BUFFER: usize = 64;
/// Longest output line kept; the remainder of a longer line is dropped.
const MAX_LINE_LEN: usize = 1024 * 1024;

/// Errors raised while constructing a [`Supervisor`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Command(#[from] CommandBuildError),
    #[error("Agent binary could not be started: {0}")]
    NotRunnable(#[source] std::io::Error),
    #[error("Agent version check failed: {0}")]
    VersionCheck(String),
    #[error("Team configuration not found: {}", .0.display())]
    ConfigMissing(PathBuf),
}

/// Failures while an execution is being driven.
#[derive(Debug, Error)]
enum DriveError {
    #[error("agent {0} pipe unavailable")]
    MissingPipe(&'static str),
    #[error("failed to encode input: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to send input to agent: {0}")]
    StdinWrite(#[source] std::io::Error),
    #[error("failed to wait for agent: {0}")]
    Wait(#[source] std::io::Error),
    #[error("event stream dropped by consumer")]
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Spawning,
    Draining,
    Completed,
    TimedOut,
    Failed,
    Cleaned,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut(Duration),
    Abandoned,
    Failed(DriveError),
    Interrupted,
}

fn interrupted() -> Event {
    Event::error_with_code("Execution interrupted by shutdown", "shutdown")
}

/// Removes a session from the active registry when dropped.
struct Registration {
    active: ActiveSessions,
    id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active.remove(self.id);
    }
}

/// Runs agent executions as supervised child processes.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    program: PathBuf,
    base_args: Vec<String>,
    version: String,
    parser: EventParser,
    tree: Arc<dyn ProcessTree>,
    kill_config: KillTreeConfig,
    active: ActiveSessions,
    shutting_down: AtomicBool,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("program", &self.inner.program)
            .field("version", &self.inner.version)
            .field("active", &self.inner.active.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Verify the agent binary and team configuration, then build a
    /// supervisor around them.
    ///
    /// # Errors
    /// Returns error if the binary is missing or fails its version check, or
    /// if the team configuration does not exist.
    pub async fn new(config: SupervisorConfig) -> Result<Self, InitError> {
        Self::with_process_tree(config, Arc::new(UnixProcessTree::new())).await
    }

    /// Like [`Supervisor::new`] with a custom process tree implementation.
    ///
    /// # Errors
    /// See [`Supervisor::new`].
    pub async fn with_process_tree(
        config: SupervisorConfig,
        tree: Arc<dyn ProcessTree>,
    ) -> Result<Self, InitError> {
        let (program, base_args) = CommandBuilder::new(&config.binary)
            .build()?
            .into_resolved()
            .await?;

        let version = probe_version(&program, &base_args, config.version_timeout).await?;

        if !config.team_config.is_file() {
            return Err(InitError::ConfigMissing(config.team_config.clone()));
        }

        tracing::info!(
            program = %program.display(),
            version = %version,
            team_config = %config.team_config.display(),
            "agent runtime ready"
        );

        let kill_config = KillTreeConfig {
            grace_period: config.kill_grace,
            ..KillTreeConfig::default()
        };

        Ok(Self {
            inner: Arc::new(Inner {
                parser: EventParser::new(config.structured_output),
                config,
                program,
                base_args,
                version,
                tree,
                kill_config,
                active: ActiveSessions::new(),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Version string reported by the agent binary.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Start an execution.
    ///
    /// The session is registered as active before this returns; the
    /// process itself is spawned by a background task.
    ///
    /// # Errors
    /// Returns [`ExecuteError::ShuttingDown`] once shutdown has begun, or
    /// [`ExecuteError::Unavailable`] outside a tokio runtime.
    pub fn execute(&self, request: ExecuteRequest) -> Result<EventStream, ExecuteError> {
        if self.is_shutting_down() {
            return Err(ExecuteError::ShuttingDown);
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ExecuteError::Unavailable(e.to_string()))?;

        let session_id = Uuid::new_v4();
        self.inner.active.insert(session_id, request.agent_id.clone());
        let registration = Registration {
            active: self.inner.active.clone(),
            id: session_id,
        };

        let (tx, stream) = EventStream::channel(session_id);
        let span = tracing::info_span!("session", %session_id, agent_id = %request.agent_id);
        let inner = Arc::clone(&self.inner);
        handle.spawn(inner.run(registration, request, tx).instrument(span));

        Ok(stream)
    }

    /// Stop accepting work and kill every running process tree.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown already in progress");
            return;
        }
        tracing::info!(active = self.inner.active.len(), "shutting down agent runtime");

        let mut kills = JoinSet::new();
        for (session_id, entry) in self.inner.active.snapshot() {
            let Some(pid) = entry.pid else { continue };
            tracing::info!(%session_id, pid, "terminating session");
            let inner = Arc::clone(&self.inner);
            kills.spawn(async move { inner.kill_tree(pid).await });
        }
        while kills.join_next().await.is_some() {}

        tracing::info!("agent runtime shut down");
    }
}

#[async_trait]
impl Executor for Supervisor {
    fn execute(&self, request: ExecuteRequest) -> Result<EventStream, ExecuteError> {
        Self::execute(self, request)
    }

    fn active_sessions(&self) -> ActiveSessions {
        self.inner.active.clone()
    }

    async fn shutdown(&self) {
        Self::shutdown(self).await;
    }
}

async fn probe_version(
    program: &Path,
    base_args: &[String],
    limit: Duration,
) -> Result<String, InitError> {
    let output = Command::new(program)
        .args(base_args)
        .args(command::VERSION_ARGS)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(limit, output)
        .await
        .map_err(|_| InitError::VersionCheck(format!("timed out after {}s", limit.as_secs_f64())))?
        .map_err(InitError::NotRunnable)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InitError::VersionCheck(format!(
            "{}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

impl Inner {
    fn transition(phase: Phase) {
        tracing::debug!(%phase, "session phase");
    }

    fn spawn(&self, request: &ExecuteRequest) -> std::io::Result<AsyncGroupChild> {
        Command::new(&self.program)
            .args(&self.base_args)
            .args(command::exec_args(&self.config.team_config, &request.agent_id))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .group_spawn()
    }

    async fn run(
        self: Arc<Self>,
        registration: Registration,
        request: ExecuteRequest,
        events: mpsc::Sender<Event>,
    ) {
        let deadline = Instant::now() + request.timeout;

        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::info!("shutdown in progress, agent not started");
            drop(registration);
            let _ = events.send(interrupted()).await;
            return;
        }

        Self::transition(Phase::Spawning);
        let mut child = match self.spawn(&request) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn agent");
                drop(registration);
                let _ = events
                    .send(Event::error_with_code(format!("Failed to start agent: {e}"), "spawn_failed"))
                    .await;
                return;
            }
        };
        // The id is gone once the leader has been reaped, but the group
        // keeps it as its pgid while any member is alive.
        let pid = child.id();
        if let Some(pid) = pid {
            self.active.set_pid(registration.id, pid);
        }

        // A shutdown that snapshotted the registry before the pid was set
        // could not see this process.
        let outcome = if self.shutting_down.load(Ordering::SeqCst) {
            Outcome::Interrupted
        } else {
            Self::transition(Phase::Draining);
            tokio::select! {
                biased;
                () = events.closed() => Outcome::Abandoned,
                res = tokio::time::timeout_at(deadline, self.drive(&mut child, &request, &events)) => {
                    match res {
                        Ok(Ok(status)) => Outcome::Exited(status),
                        Ok(Err(DriveError::Abandoned)) => Outcome::Abandoned,
                        Ok(Err(e)) => Outcome::Failed(e),
                        Err(_) => Outcome::TimedOut(request.timeout),
                    }
                }
            }
        };
        let sweep = !matches!(outcome, Outcome::Exited(_));

        let terminal = match outcome {
            Outcome::Exited(status) => {
                Self::transition(Phase::Completed);
                if status.success() {
                    None
                } else if self.shutting_down.load(Ordering::SeqCst) {
                    Some(interrupted())
                } else {
                    tracing::warn!(code = ?status.code(), "agent exited with non-zero status");
                    None
                }
            }
            Outcome::TimedOut(limit) => {
                Self::transition(Phase::TimedOut);
                tracing::warn!(timeout_secs = limit.as_secs_f64(), "execution timed out");
                Some(Event::error_with_code(
                    format!("Execution timeout after {}s", limit.as_secs_f64()),
                    "timeout",
                ))
            }
            Outcome::Abandoned => {
                tracing::info!("event stream dropped, terminating agent");
                None
            }
            Outcome::Failed(e) => {
                Self::transition(Phase::Failed);
                tracing::error!(error = %e, "execution failed");
                Some(Event::error_with_code(format!("Execution error: {e}"), "execution_failed"))
            }
            Outcome::Interrupted => {
                tracing::info!("shutdown began while spawning, terminating agent");
                Some(interrupted())
            }
        };

        self.reap(&mut child, pid, sweep).await;
        drop(registration);
        Self::transition(Phase::Cleaned);

        if let Some(event) = terminal {
            let _ = events.send(event).await;
        }
    }

    /// Feed stdin and forward parsed output until both pipes close.
    async fn drive(
        &self,
        child: &mut AsyncGroupChild,
        request: &ExecuteRequest,
        events: &mpsc::Sender<Event>,
    ) -> Result<ExitStatus, DriveError> {
        let process = child.inner();
        let mut stdin = process.stdin.take().ok_or(DriveError::MissingPipe("stdin"))?;
        let stdout = process.stdout.take().ok_or(DriveError::MissingPipe("stdout"))?;
        let stderr = process.stderr.take().ok_or(DriveError::MissingPipe("stderr"))?;

        let payload = serde_json::to_vec(&request.stdin_payload())?;
        stdin.write_all(&payload).await.map_err(DriveError::StdinWrite)?;
        stdin.shutdown().await.map_err(DriveError::StdinWrite)?;
        drop(stdin);

        let (line_tx, mut line_rx) = mpsc::channel(LINE_BUFFER);
        let mut readers = JoinSet::new();
        readers.spawn(read_lines(stdout, StreamTag::Stdout, line_tx.clone(), MAX_LINE_LEN));
        readers.spawn(read_lines(stderr, StreamTag::Stderr, line_tx, MAX_LINE_LEN));

        while let Some((tag, line)) = line_rx.recv().await {
            if let Some(event) = self.parser.parse_tagged(tag, &line) {
                events.send(event).await.map_err(|_| DriveError::Abandoned)?;
            }
        }
        while readers.join_next().await.is_some() {}

        child.wait().await.map_err(DriveError::Wait)
    }

    /// Kill the tree, then collect the leader.
    ///
    /// With `sweep` unset a leader that already exited is left alone. With
    /// it set the tree is killed regardless, which reaches descendants that
    /// outlived the leader through its process group.
    async fn reap(&self, child: &mut AsyncGroupChild, pid: Option<u32>, sweep: bool) {
        if !sweep && matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Some(pid) = pid {
            self.kill_tree(pid).await;
        }
        if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
            tracing::warn!("agent process was not reaped in time");
        }
    }

    async fn kill_tree(&self, pid: u32) {
        let tree = Arc::clone(&self.tree);
        let config = self.kill_config.clone();
        let result =
            tokio::task::spawn_blocking(move || process_tree::kill_tree(tree.as_ref(), pid, &config))
                .await;
        match result {
            Ok(Ok(report)) if report.is_empty() => {}
            Ok(Ok(report)) => tracing::debug!(
                pid,
                terminated = report.terminated.len(),
                force_killed = report.force_killed.len(),
                "process tree terminated"
            ),
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to terminate process tree"),
            Err(e) => tracing::error!(pid, error = %e, "process tree task panicked"),
        }
    }
}

async fn read_lines<R>(
    reader: R,
    tag: StreamTag,
    tx: mpsc::Sender<(StreamTag, String)>,
    max_len: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader).take(limit).read_until(b'\n', &mut buf).await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') && buf.len() >= max_len {
                    tracing::warn!(stream = ?tag, max_len, "output line too long, truncating");
                    if let Err(e) = skip_line(&mut reader).await {
                        tracing::warn!(stream = ?tag, error = %e, "failed to read agent output");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_owned();
                if tx.send((tag, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(stream = ?tag, error = %e, "failed to read agent output");
                break;
            }
        }
    }
}

/// Drop input up to and including the next newline.
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};

    use agent_sidecar_core::EventKind;
    use futures::StreamExt;
    use tempfile::TempDir;

    use super::*;

    /// Write a fake agent binary that answers `version` and runs `body`
    /// for `exec`.
    fn fake_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cagent");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"version\" ]; then echo 'cagent 0.0.1-test'; exit 0; fi\n{body}\n"
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn supervisor(body: &str) -> (TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), body);
        let team = dir.path().join("team.yaml");
        fs::write(&team, "agents: {}\n").unwrap();
        let config = SupervisorConfig::new(bin.to_string_lossy(), team)
            .with_kill_grace(Duration::from_millis(500));
        let sup = tokio_test::assert_ok!(Supervisor::new(config).await);
        (dir, sup)
    }

    fn request(timeout: Duration) -> ExecuteRequest {
        ExecuteRequest::new("root", "What is the answer?").with_timeout(timeout)
    }

    async fn wait_until_dead(pid: u32) {
        let tree = UnixProcessTree::new();
        for _ in 0..100 {
            if !tree.is_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {pid} survived teardown");
    }

    fn read_pid(path: &Path) -> u32 {
        fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    async fn wait_until_idle(active: &ActiveSessions) {
        for _ in 0..100 {
            if active.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("sessions still active: {:?}", active.snapshot());
    }

    #[tokio::test]
    async fn reports_version() {
        let (_dir, sup) = supervisor("cat >/dev/null").await;
        assert_eq!(sup.version(), "cagent 0.0.1-test");
    }

    #[tokio::test]
    async fn output_line_becomes_result() {
        let (_dir, sup) = supervisor("cat >/dev/null\necho '[OUTPUT] The answer is 42'").await;
        let stream = tokio_test::assert_ok!(sup.execute(request(Duration::from_secs(10))));
        let events: Vec<Event> = stream.collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Result);
        assert_eq!(events[0].get("result").and_then(|v| v.as_str()), Some("The answer is 42"));
        assert!(sup.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn stdin_carries_input_and_context() {
        let (_dir, sup) = supervisor("cat").await;
        let req = request(Duration::from_secs(10)).with_context(
            serde_json::json!({"k": 1}).as_object().cloned().unwrap(),
        );
        let events: Vec<Event> = sup.execute(req).unwrap().collect().await;

        // The echoed payload is a JSON object without result/error keys.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Info);
        assert_eq!(
            events[0].get("input").and_then(|v| v.as_str()),
            Some("What is the answer?")
        );
        assert_eq!(events[0].get("context"), Some(&serde_json::json!({"k": 1})));
    }

    #[tokio::test]
    async fn stderr_is_error_and_exit_code_is_silent() {
        let (_dir, sup) = supervisor("cat >/dev/null\necho '[THINKING] hmm'\necho 'boom' >&2\nexit 3").await;
        let events: Vec<Event> = sup.execute(request(Duration::from_secs(10))).unwrap().collect().await;

        let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
        assert!(kinds.contains(&EventKind::Thinking));
        let errors: Vec<&Event> = events.iter().filter(|e| e.kind() == EventKind::Error).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].get("error").and_then(|v| v.as_str()), Some("boom"));
    }

    #[tokio::test]
    async fn timeout_emits_single_error_and_kills_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("child.pid");
        let body = format!(
            "sleep 30 &\necho $! > '{}'\ncat >/dev/null\nwait",
            pidfile.display()
        );
        let (_bin_dir, sup) = supervisor(&body).await;

        let events: Vec<Event> = sup
            .execute(request(Duration::from_millis(500)))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Error);
        let message = events[0].get("error").and_then(|v| v.as_str()).unwrap();
        assert!(message.contains("timeout"), "{message}");
        assert!(sup.active_sessions().is_empty());

        wait_until_dead(read_pid(&pidfile)).await;
    }

    #[tokio::test]
    async fn timeout_kills_helper_that_outlived_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("helper.pid");
        // The agent exits at once, but its helper inherits stdout.
        let body = format!(
            "cat >/dev/null\nsleep 30 &\necho $! > '{}'\nexit 0",
            pidfile.display()
        );
        let (_bin_dir, sup) = supervisor(&body).await;

        let events: Vec<Event> = sup
            .execute(request(Duration::from_millis(500)))
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("error_code").and_then(|v| v.as_str()), Some("timeout"));
        assert!(sup.active_sessions().is_empty());

        wait_until_dead(read_pid(&pidfile)).await;
    }

    #[tokio::test]
    async fn spawn_failure_is_single_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "cat >/dev/null");
        let team = dir.path().join("team.yaml");
        fs::write(&team, "").unwrap();
        let sup = Supervisor::new(SupervisorConfig::new(bin.to_string_lossy(), team))
            .await
            .unwrap();
        fs::remove_file(&bin).unwrap();

        let events: Vec<Event> = sup.execute(request(Duration::from_secs(5))).unwrap().collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Error);
        assert_eq!(events[0].get("error_code").and_then(|v| v.as_str()), Some("spawn_failed"));
        assert!(sup.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn stdin_write_failure_is_single_error() {
        // Exits without reading, so a payload larger than the pipe buffer
        // cannot be delivered.
        let (_dir, sup) = supervisor("exit 0").await;
        let req = ExecuteRequest::new("root", "x".repeat(1024 * 1024))
            .with_timeout(Duration::from_secs(10));

        let events: Vec<Event> = sup.execute(req).unwrap().collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Error);
        assert_eq!(
            events[0].get("error_code").and_then(|v| v.as_str()),
            Some("execution_failed")
        );
        assert!(sup.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn long_lines_are_truncated() {
        let io = tokio_test::io::Builder::new()
            .read(b"abcdefgh")
            .read(b"ij\nok\n")
            .build();
        let (tx, mut rx) = mpsc::channel(8);
        read_lines(io, StreamTag::Stdout, tx, 4).await;

        assert_eq!(rx.recv().await, Some((StreamTag::Stdout, "abcd".to_owned())));
        assert_eq!(rx.recv().await, Some((StreamTag::Stdout, "ok".to_owned())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_stream_tears_down() {
        let (_dir, sup) = supervisor("cat >/dev/null\nexec sleep 30").await;
        let active = sup.active_sessions();
        let stream = sup.execute(request(Duration::from_secs(30))).unwrap();
        assert!(active.contains(stream.session_id()));

        drop(stream);
        wait_until_idle(&active).await;
    }

    #[tokio::test]
    async fn shutdown_right_after_execute_stops_the_session() {
        let (_dir, sup) = supervisor("cat >/dev/null\nexec sleep 30").await;
        let active = sup.active_sessions();
        let mut stream = sup.execute(request(Duration::from_secs(30))).unwrap();

        // The pid is not registered yet, so shutdown cannot kill anything.
        sup.shutdown().await;

        let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind(), EventKind::Error);
        assert_eq!(first.get("error_code").and_then(|v| v.as_str()), Some("shutdown"));
        assert!(stream.recv().await.is_none());
        wait_until_idle(&active).await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_and_rejects() {
        let (_dir, sup) = supervisor("cat >/dev/null\nexec sleep 30").await;
        let active = sup.active_sessions();
        let mut stream = sup.execute(request(Duration::from_secs(30))).unwrap();

        let id = stream.session_id();
        for _ in 0..100 {
            if active.get(id).and_then(|e| e.pid).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        sup.shutdown().await;
        sup.shutdown().await;

        let last = stream.recv().await.unwrap();
        assert_eq!(last.kind(), EventKind::Error);
        assert!(stream.recv().await.is_none());
        wait_until_idle(&active).await;

        assert!(matches!(
            sup.execute(request(Duration::from_secs(1))),
            Err(ExecuteError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn missing_binary_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let team = dir.path().join("team.yaml");
        fs::write(&team, "").unwrap();
        let err = Supervisor::new(SupervisorConfig::new("/nonexistent/cagent", team))
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::Command(CommandBuildError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_config_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_agent(dir.path(), "true");
        let err = Supervisor::new(SupervisorConfig::new(
            bin.to_string_lossy(),
            dir.path().join("absent.yaml"),
        ))
        .await
        .unwrap_err();
        assert!(matches!(err, InitError::ConfigMissing(_)));
    }

    #[tokio::test]
    async fn failing_version_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("broken");
        fs::write(&bin, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        let team = dir.path().join("team.yaml");
        fs::write(&team, "").unwrap();

        let err = Supervisor::new(SupervisorConfig::new(bin.to_string_lossy(), team))
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::VersionCheck(_)));
    }
}
