//! Plan execution
//!
//! Runs the steps of a plan strictly in order, one external process per
//! step, and streams their output to an observer:
//! - stdout/stderr are read line by line on separate tasks
//! - lines travel through a bounded broadcast queue; a slow observer loses
//!   the oldest lines and is told how many, the child is never blocked
//! - cancellation is checked before every step and, while a step runs,
//!   terminates the step's process group (SIGTERM, then SIGKILL after a
//!   grace period)
//! - once the child is reaped, pipes still held open by leftover
//!   descendants are read for at most the grace period

use crate::config::ExecutionConfig;
use crate::observer::Observer;
use crate::types::{CommandStep, ExecutionResult, Outcome, OutputLine, OutputStream, Plan};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of each stream kept in an [`ExecutionResult`]
const CAPTURE_LINES: usize = 200;

/// Stderr lines quoted in a failure detail
const DETAIL_LINES: usize = 5;

/// Exit code reported when the program could not be started
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Exit code reported when the child was terminated by a signal
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// Where child processes read their input from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    /// Share the terminal (interactive prompts work)
    Inherit,
    /// No input; used when the terminal belongs to the TUI. Each step
    /// also gets its own process group so cancellation reaches every
    /// descendant.
    Null,
}

impl StdinMode {
    fn stdio(self) -> Stdio {
        match self {
            StdinMode::Inherit => Stdio::inherit(),
            StdinMode::Null => Stdio::null(),
        }
    }

    /// A step sharing the terminal must stay in the foreground process
    /// group: sudo reads its password from the tty and would be stopped
    /// with SIGTTIN from a background group. Ctrl-C reaches the whole
    /// foreground group there.
    fn own_process_group(self) -> bool {
        self == StdinMode::Null
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Front-end prepended to privileged steps, e.g. `["sudo"]`
    pub elevation: Vec<String>,
    pub output_buffer: usize,
    pub terminate_grace: Duration,
    pub stdin: StdinMode,
    pub dry_run: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default(), StdinMode::Inherit, false)
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &ExecutionConfig, stdin: StdinMode, dry_run: bool) -> Self {
        Self {
            elevation: config.elevation.clone(),
            output_buffer: config.output_buffer,
            terminate_grace: config.terminate_grace(),
            stdin,
            dry_run,
        }
    }
}

/// Per-step results plus the terminal outcome of a plan
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub results: Vec<ExecutionResult>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct Executor {
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Program and arguments actually spawned for a step
    ///
    /// Privileged steps go through the elevation front-end; credentials are
    /// never handled here.
    pub fn command_line(&self, step: &CommandStep) -> (String, Vec<String>) {
        if step.requires_privilege {
            if let Some((program, front_args)) = self.options.elevation.split_first() {
                let mut args = front_args.to_vec();
                args.push(step.program.clone());
                args.extend(step.args.iter().cloned());
                return (program.clone(), args);
            }
        }
        (step.program.clone(), step.args.clone())
    }

    /// Full command line as a display string
    pub fn render(&self, step: &CommandStep) -> String {
        let (program, args) = self.command_line(step);
        std::iter::once(program).chain(args).collect::<Vec<_>>().join(" ")
    }

    /// Run a plan to completion, failure or cancellation
    pub async fn run(
        &self,
        plan: &Plan,
        observer: &Arc<dyn Observer>,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let mut results = Vec::with_capacity(plan.len());

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(step = index, "plan cancelled before step started");
                return ExecutionReport {
                    results,
                    outcome: Outcome::Cancelled,
                };
            }

            observer.on_step_started(index, step);
            let result = self.run_step(index, step, observer, cancel).await;
            observer.on_step_finished(&result);

            if result.cancelled {
                results.push(result);
                return ExecutionReport {
                    results,
                    outcome: Outcome::Cancelled,
                };
            }

            if !result.succeeded() {
                if step.allow_failure {
                    warn!(step = index, exit_code = result.exit_code, "informational step failed");
                    observer.on_status(&format!(
                        "{} failed with exit code {}, continuing",
                        step.display(),
                        result.exit_code
                    ));
                } else {
                    let detail = failure_detail(&self.render(step), &result);
                    error!(step = index, exit_code = result.exit_code, "step failed");
                    results.push(result);
                    return ExecutionReport {
                        results,
                        outcome: Outcome::Failure(detail),
                    };
                }
            }

            results.push(result);
        }

        ExecutionReport {
            results,
            outcome: Outcome::Success,
        }
    }

    async fn run_step(
        &self,
        index: usize,
        step: &CommandStep,
        observer: &Arc<dyn Observer>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let (program, args) = self.command_line(step);
        let rendered = self.render(step);

        if self.options.dry_run {
            observer.on_output(&OutputLine {
                step: index,
                stream: OutputStream::Stdout,
                text: format!("Dry run: would execute {}", rendered),
            });
            return ExecutionResult {
                step_index: index,
                ..Default::default()
            };
        }

        info!(step = index, command = %rendered, "starting step");

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(self.options.stdin.stdio())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        if self.options.stdin.own_process_group() {
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(step = index, error = %e, "failed to spawn {}", program);
                let message = format!("failed to start {}: {}", program, e);
                observer.on_output(&OutputLine {
                    step: index,
                    stream: OutputStream::Stderr,
                    text: message.clone(),
                });
                return ExecutionResult {
                    step_index: index,
                    exit_code: SPAWN_FAILURE_CODE,
                    stderr: vec![message],
                    ..Default::default()
                };
            }
        };

        let (tx, rx) = broadcast::channel(self.options.output_buffer.max(1));
        let stop_reading = CancellationToken::new();
        let stdout_task = tokio::spawn(pump(
            child.stdout.take(),
            index,
            OutputStream::Stdout,
            tx.clone(),
            stop_reading.clone(),
        ));
        let stderr_task = tokio::spawn(pump(
            child.stderr.take(),
            index,
            OutputStream::Stderr,
            tx,
            stop_reading.clone(),
        ));
        let drain_task = tokio::spawn(drain(rx, Arc::clone(observer)));

        let waited = tokio::select! {
            status = child.wait() => status.map(|s| (s, false)),
            _ = cancel.cancelled() => {
                warn!(step = index, "cancellation requested, terminating {}", program);
                self.terminate(&mut child).await.map(|s| (s, true))
            }
        };

        // Readers finish once the pipes close; a descendant that outlives
        // the child may hold them open, so give up after the grace period
        let deadline = tokio::spawn({
            let stop = stop_reading.clone();
            let grace = self.options.terminate_grace;
            async move {
                tokio::time::sleep(grace).await;
                stop.cancel();
            }
        });
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        deadline.abort();
        if stop_reading.is_cancelled() {
            warn!(step = index, "output pipes still open after {} exited, stopped reading", program);
        }
        let dropped_lines = drain_task.await.unwrap_or_default();

        let (exit_code, cancelled) = match waited {
            Ok((status, cancelled)) => (status.code().unwrap_or(SIGNAL_EXIT_CODE), cancelled),
            Err(e) => {
                error!(step = index, error = %e, "failed to wait for {}", program);
                (SIGNAL_EXIT_CODE, cancel.is_cancelled())
            }
        };

        debug!(step = index, exit_code, cancelled, dropped_lines, "step finished");

        ExecutionResult {
            step_index: index,
            exit_code,
            stdout,
            stderr,
            cancelled,
            dropped_lines,
        }
    }

    /// Ask the step to exit, escalating to SIGKILL after the grace period
    ///
    /// With its own process group the whole group is signalled, and a final
    /// SIGKILL sweeps descendants that survived the child.
    #[cfg(unix)]
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let group = self.options.stdin.own_process_group();
        let Some(pid) = child.id() else {
            // Already reaped
            return child.wait().await;
        };
        let pid = pid as libc::pid_t;
        // The child leads its group, so the group id is its pid
        let target = if group { -pid } else { pid };

        send_signal(target, libc::SIGTERM);

        let status = match tokio::time::timeout(self.options.terminate_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("child still running after {:?}, killing", self.options.terminate_grace);
                send_signal(target, libc::SIGKILL);
                child.kill().await?;
                child.wait().await
            }
        };

        if group {
            send_signal(target, libc::SIGKILL);
        }
        status
    }

    #[cfg(not(unix))]
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        child.start_kill()?;
        match tokio::time::timeout(self.options.terminate_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

/// kill(2); a negative target addresses a process group
#[cfg(unix)]
fn send_signal(pid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: kill(2) takes plain integers; pid is our child or its group.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        let error = std::io::Error::last_os_error();
        // ESRCH: everything already exited
        if error.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signal, error = %error, "kill failed");
        }
    }
}

/// Read one pipe line by line, forwarding to the queue and keeping a tail
async fn pump<R>(
    reader: Option<R>,
    step: usize,
    stream: OutputStream,
    tx: broadcast::Sender<OutputLine>,
    stop: CancellationToken,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut captured = VecDeque::with_capacity(CAPTURE_LINES);
    let Some(reader) = reader else {
        return Vec::new();
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => read,
            _ = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if captured.len() == CAPTURE_LINES {
                    captured.pop_front();
                }
                captured.push_back(text.clone());
                // Err only means no receiver is left
                let _ = tx.send(OutputLine { step, stream, text });
            }
            Err(e) => {
                debug!(error = %e, "stopped reading {}", stream.tag());
                break;
            }
        }
    }

    Vec::from(captured)
}

/// Forward queued lines to the observer; returns how many were dropped
async fn drain(mut rx: broadcast::Receiver<OutputLine>, observer: Arc<dyn Observer>) -> u64 {
    let mut dropped = 0u64;
    loop {
        match rx.recv().await {
            Ok(line) => observer.on_output(&line),
            Err(RecvError::Lagged(missed)) => {
                dropped += missed;
                observer.on_status(&format!("{} output lines dropped", missed));
            }
            Err(RecvError::Closed) => break,
        }
    }
    dropped
}

fn failure_detail(command: &str, result: &ExecutionResult) -> String {
    let skip = result.stderr.len().saturating_sub(DETAIL_LINES);
    let tail = result.stderr[skip..].join("\n");
    if tail.is_empty() {
        format!("\"{}\" exited with code {}", command, result.exit_code)
    } else {
        format!("\"{}\" exited with code {}: {}", command, result.exit_code, tail)
    }
}
