//! External command execution with line-by-line log forwarding.
//!
//! [`CommandRunner`] is the seam the install pipeline runs its external
//! commands through. [`ProcessRunner`] spawns real processes; tests swap in
//! a recording runner. The helpers here are shared with the supervisor,
//! which forwards long-running worker output the same way.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use kiln_events::LogSink;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_directory: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Errors from running a single external command.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed while waiting: {0}")]
    Wait(#[source] std::io::Error),

    #[error("exited with code {0}")]
    Exit(i32),

    #[error("cancelled")]
    Cancelled,
}

/// Runs external commands to completion on behalf of a worker.
pub trait CommandRunner: Send + Sync {
    /// Run `spec`, forwarding its output to the log sink under `worker`.
    ///
    /// Resolves once the process exits. Non-zero exit is an error.
    fn run(
        &self,
        worker: &str,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), RunError>> + Send;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Clone)]
pub struct ProcessRunner {
    logs: Arc<LogSink>,
}

impl ProcessRunner {
    pub fn new(logs: Arc<LogSink>) -> Self {
        Self { logs }
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        worker: &str,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }
        hide_console(&mut cmd);

        let mut child = cmd.spawn().map_err(RunError::Spawn)?;
        let forwarders = forward_output(&mut child, &self.logs, worker);

        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };

        let result = match outcome {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(RunError::Exit(status.code().unwrap_or(-1))),
            Some(Err(e)) => Err(RunError::Wait(e)),
            None => {
                terminate(&mut child).await;
                for task in &forwarders {
                    task.abort();
                }
                return Err(RunError::Cancelled);
            }
        };

        // Drain remaining output so the last lines land before we report.
        for task in forwarders {
            let _ = task.await;
        }
        result
    }
}

/// Kill `child` together with its process group, then reap it.
///
/// Workers and installers spawn helper processes of their own; signalling
/// the group keeps those from outliving the parent and holding its pipes.
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg has no memory-safety preconditions; the group id is
        // the child's pid because it was spawned with `process_group(0)`.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

/// Take the child's stdout and stderr and forward each line to the sink.
///
/// Each stream keeps its own order; the two streams are not ordered
/// relative to each other.
pub(crate) fn forward_output(
    child: &mut Child,
    logs: &Arc<LogSink>,
    worker: &str,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        tasks.push(spawn_line_forwarder(stdout, Arc::clone(logs), worker));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(spawn_line_forwarder(stderr, Arc::clone(logs), worker));
    }
    tasks
}

fn spawn_line_forwarder<R>(stream: R, logs: Arc<LogSink>, worker: &str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let worker = worker.to_string();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Keep draining on invalid UTF-8 so the child never sees a closed pipe.
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        logs.append(&worker, line);
                    }
                }
                Err(e) => {
                    tracing::debug!(worker = %worker, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    })
}

/// Keep child processes from opening a console window and detach them
/// from the terminal's process group.
pub(crate) fn hide_console(cmd: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn forwards_both_streams_to_the_sink() {
        let logs = Arc::new(LogSink::new(100));
        let runner = ProcessRunner::new(Arc::clone(&logs));
        runner
            .run(
                "w",
                &sh("echo out-line; echo err-line 1>&2"),
                &CancellationToken::new(),
            )
            .await
            .expect("command should succeed");

        let messages: Vec<_> = logs.read(Some("w")).into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"out-line".to_string()));
        assert!(messages.contains(&"err-line".to_string()));
    }

    #[tokio::test]
    async fn invalid_utf8_output_keeps_the_pipe_drained() {
        let logs = Arc::new(LogSink::new(5000));
        let runner = ProcessRunner::new(Arc::clone(&logs));
        let script = "printf 'caf\\351\\n'; sleep 0.3; \
                      i=1; while [ $i -le 2000 ]; do echo after-$i; i=$((i+1)); done; exit 0";
        let result = runner.run("w", &sh(script), &CancellationToken::new()).await;
        assert_matches!(result, Ok(()));

        let messages: Vec<_> = logs.read(Some("w")).into_iter().map(|e| e.message).collect();
        assert_eq!(messages.first().map(String::as_str), Some("caf\u{FFFD}"));
        assert_eq!(messages.last().map(String::as_str), Some("after-2000"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let runner = ProcessRunner::new(Arc::new(LogSink::new(10)));
        let result = runner
            .run("w", &sh("exit 3"), &CancellationToken::new())
            .await;
        assert_matches!(result, Err(RunError::Exit(3)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let runner = ProcessRunner::new(Arc::new(LogSink::new(10)));
        let result = runner
            .run(
                "w",
                &CommandSpec::new("/definitely/not/a/program"),
                &CancellationToken::new(),
            )
            .await;
        assert_matches!(result, Err(RunError::Spawn(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_command() {
        let runner = ProcessRunner::new(Arc::new(LogSink::new(10)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = runner.run("w", &sh("sleep 30"), &cancel).await;
        assert_matches!(result, Err(RunError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogSink::new(10));
        let runner = ProcessRunner::new(Arc::clone(&logs));
        runner
            .run(
                "w",
                &sh("pwd").current_dir(dir.path()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let printed = logs.read(None).pop().unwrap().message;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(&printed).canonicalize().unwrap(),
            expected
        );
    }

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("git").args(["clone", "--depth", "1"]);
        assert_eq!(spec.to_string(), "git clone --depth 1");
    }
}
