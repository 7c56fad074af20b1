//! Subprocess plumbing shared by the coordinators.
//!
//! A [`ProcessSlot`] owns at most one live child. [`ProcessSlot::replace`]
//! terminates and reaps the current occupant before spawning its successor,
//! so two processes for the same job never overlap.

use crate::error::{PressError, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long to keep draining stderr after the child has exited.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Build a command whose environment holds only `PATH` (plus `SystemRoot` on
/// Windows, without which nothing starts). Callers add job-specific
/// variables with `.env(..)`.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }
    if cfg!(windows) {
        if let Some(root) = std::env::var_os("SystemRoot") {
            cmd.env("SystemRoot", root);
        }
    }
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    cmd
}

/// Like [`command`], with a working directory.
pub fn command_in(program: impl AsRef<OsStr>, cwd: &Path) -> Command {
    let mut cmd = command(program);
    cmd.current_dir(cwd);
    cmd
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`PressError::CommandFailed`].
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(PressError::CommandFailed {
                program: program.to_string(),
                status: self.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `cmd` to completion, capturing both streams.
pub async fn run_to_completion(mut cmd: Command) -> Result<CommandOutput> {
    let program = program_name(&cmd);
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| PressError::Spawn { program, source })?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ---------------------------------------------------------------------------
// ProcessSlot
// ---------------------------------------------------------------------------

/// How a slot's occupant ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own.
    Exited { code: Option<i32>, stderr: String },
    /// The slot terminated it (replacement, `clear`, or shutdown).
    Killed,
    /// Waiting on the process failed.
    Failed(String),
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited { code: Some(0), .. })
    }
}

struct Running {
    kill_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Holder for the single live subprocess of one job role.
pub struct ProcessSlot {
    role: String,
    running: tokio::sync::Mutex<Option<Running>>,
    spawned: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl ProcessSlot {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            running: tokio::sync::Mutex::new(None),
            spawned: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Terminate and reap the current occupant (if any), then spawn `cmd`.
    ///
    /// `on_line` is called for every stdout line. `on_exit` is called exactly
    /// once when the new process ends, including when it is killed by a later
    /// `replace` or [`ProcessSlot::clear`]. If the spawn fails the slot is
    /// left empty and `on_exit` is never called.
    pub async fn replace<L, E>(&self, mut cmd: Command, mut on_line: L, on_exit: E) -> Result<()>
    where
        L: FnMut(&str) + Send + 'static,
        E: FnOnce(ExitOutcome) + Send + 'static,
    {
        let mut guard = self.running.lock().await;
        if let Some(old) = guard.take() {
            terminate(old).await;
        }

        let program = program_name(&cmd);
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PressError::Spawn {
                program: program.clone(),
                source,
            })?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("[{}] spawned {program} (pid {:?})", self.role, child.id());

        let stdout = child.stdout.take();
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let buf = Arc::clone(&stderr_buf);
            let role = self.role.clone();
            tokio::spawn(async move {
                for_each_line(stderr, |line| {
                    tracing::debug!("[{role}] {line}");
                    if let Ok(mut b) = buf.lock() {
                        b.push_str(line);
                        b.push('\n');
                    }
                })
                .await;
            })
        });

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let live = Arc::clone(&self.live);
        let role = self.role.clone();

        let task = tokio::spawn(async move {
            let finished = tokio::select! {
                status = pump(&mut child, stdout, &mut on_line) => Some(status),
                _ = &mut kill_rx => None,
            };

            let outcome = match finished {
                None => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!("[{role}] kill failed: {e}");
                    }
                    if let Some(t) = stderr_task {
                        t.abort();
                    }
                    ExitOutcome::Killed
                }
                Some(Ok(status)) => {
                    if let Some(t) = stderr_task {
                        let _ = tokio::time::timeout(STDERR_DRAIN, t).await;
                    }
                    let stderr = stderr_buf.lock().map(|b| b.clone()).unwrap_or_default();
                    ExitOutcome::Exited {
                        code: status.code(),
                        stderr,
                    }
                }
                Some(Err(e)) => {
                    if let Some(t) = stderr_task {
                        t.abort();
                    }
                    ExitOutcome::Failed(e.to_string())
                }
            };

            live.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("[{role}] process ended: {outcome:?}");
            on_exit(outcome);
        });

        *guard = Some(Running { kill_tx, task });
        Ok(())
    }

    /// Terminate and reap the occupant without replacing it.
    /// Returns true if a process was stopped.
    pub async fn clear(&self) -> bool {
        let old = self.running.lock().await.take();
        match old {
            Some(running) => {
                let was_live = !running.task.is_finished();
                terminate(running).await;
                was_live
            }
            None => false,
        }
    }

    /// Whether a process spawned by this slot is still alive.
    pub fn is_running(&self) -> bool {
        self.live.load(Ordering::SeqCst) > 0
    }

    /// Processes currently alive for this slot. Never exceeds one.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total processes ever spawned into this slot.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }
}

async fn pump<L: FnMut(&str)>(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    on_line: &mut L,
) -> std::io::Result<ExitStatus> {
    if let Some(out) = stdout {
        for_each_line(out, on_line).await;
    }
    child.wait().await
}

/// Feed every line of `reader` to `f` until EOF or a read error. Bytes that
/// are not UTF-8 are replaced rather than ending the stream.
async fn for_each_line<R, F>(reader: R, mut f: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches(['\n', '\r']));
            }
        }
    }
}

async fn terminate(running: Running) {
    // The receiver is gone once the process has exited on its own.
    let _ = running.kill_tx.send(());
    if let Err(e) = running.task.await {
        tracing::warn!("process supervisor task failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> Command {
        let mut cmd = command("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ExitOutcome>) -> ExitOutcome {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for exit")
            .expect("exit channel closed")
    }

    #[tokio::test]
    async fn replace_kills_previous_occupant_first() {
        let slot = ProcessSlot::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let tx = tx.clone();
            slot.replace(sh("exec sleep 30"), |_| {}, move |o| {
                let _ = tx.send(o);
            })
            .await
            .unwrap();
            assert_eq!(slot.live_count(), 1, "iteration {i}");
        }

        for _ in 0..4 {
            assert_eq!(recv(&mut rx).await, ExitOutcome::Killed);
        }
        assert_eq!(slot.spawn_count(), 5);
        assert!(slot.is_running());

        assert!(slot.clear().await);
        assert_eq!(recv(&mut rx).await, ExitOutcome::Killed);
        assert_eq!(slot.live_count(), 0);
        assert!(!slot.clear().await);
    }

    #[tokio::test]
    async fn stdout_lines_and_exit_are_reported() {
        let slot = ProcessSlot::new("test");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines2 = Arc::clone(&lines);
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot.replace(
            sh("echo one; echo two"),
            move |l| lines2.lock().unwrap().push(l.to_string()),
            move |o| {
                let _ = tx.send(o);
            },
        )
        .await
        .unwrap();

        let outcome = recv(&mut rx).await;
        assert!(outcome.success(), "{outcome:?}");
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
        assert!(!slot.is_running());
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_stream() {
        let slot = ProcessSlot::new("test");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines2 = Arc::clone(&lines);
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot.replace(
            sh("printf 'caf\\351\\n'; printf 'bad\\377\\n' >&2; echo 'Waiting...'; exit 0"),
            move |l| lines2.lock().unwrap().push(l.to_string()),
            move |o| {
                let _ = tx.send(o);
            },
        )
        .await
        .unwrap();

        let outcome = recv(&mut rx).await;
        match &outcome {
            ExitOutcome::Exited { code, stderr } => {
                assert_eq!(*code, Some(0));
                assert!(stderr.starts_with("bad"), "{stderr:?}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2, "{lines:?}");
        assert!(lines[0].starts_with("caf"));
        assert_eq!(lines[1], "Waiting...");
    }

    #[tokio::test]
    async fn failed_exit_captures_stderr() {
        let slot = ProcessSlot::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.replace(sh("echo 'ERR! missing' >&2; exit 3"), |_| {}, move |o| {
            let _ = tx.send(o);
        })
        .await
        .unwrap();

        match recv(&mut rx).await {
            ExitOutcome::Exited { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("ERR! missing"), "{stderr}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_leaves_slot_empty() {
        let slot = ProcessSlot::new("test");
        let err = slot
            .replace(command("__pressdev_missing_binary__"), |_| {}, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PressError::Spawn { .. }));
        assert_eq!(slot.spawn_count(), 0);
        assert!(!slot.is_running());
    }

    #[tokio::test]
    async fn environment_is_cleared() {
        let out = run_to_completion(sh("echo \"${HOME:-unset}\""))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "unset");
    }

    #[tokio::test]
    async fn check_maps_nonzero_exit() {
        let out = run_to_completion(sh("echo nope >&2; exit 1")).await.unwrap();
        match out.check("sh") {
            Err(PressError::CommandFailed { status, stderr, .. }) => {
                assert_eq!(status, "1");
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
