//! Process execution for a single slot.
//!
//! A `ProcessRunner` owns at most one child process. It spawns the slot's command
//! through a shell, forwards both output streams line by line to the shared event
//! channel, and terminates the whole process tree when stopped. Child processes are
//! placed in their own process group (Unix) or console process group (Windows) so
//! the tree can be killed as a unit.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::events::{Event, EventSender, StopReason};
use crate::output::{sanitize_text, SharedLog, StreamKind};
use crate::process::{ProcessStatus, SlotId};

/// Upper bound on how long `stop` waits for the process tree to go away.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);
/// Default number of output lines kept per slot.
pub const DEFAULT_MAX_LINES: usize = 10_000;

/// Errors reported by a runner. All of them are local to one slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Validation(String),
    #[error("a process is still running (pid {pid}); stop it first")]
    AlreadyRunning { pid: u32 },
    #[error("failed to start `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("failed to terminate process {pid}: {reason}")]
    Termination { pid: u32, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub kill_timeout: Duration,
    pub max_lines: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            max_lines: DEFAULT_MAX_LINES,
        }
    }
}

/// Manages the lifecycle and I/O of one slot's child process.
pub struct ProcessRunner {
    id: SlotId,
    child: Option<Child>,
    pid: Option<u32>,
    status: ProcessStatus,
    log: SharedLog,
    event_tx: EventSender,
    options: RunnerOptions,
    #[cfg(test)]
    seam: TestSeam,
}

/// Lets tests reach the spawn and termination failure paths.
#[cfg(test)]
#[derive(Debug, Default)]
struct TestSeam {
    shell: Option<&'static str>,
    refuse_kill: bool,
}

impl ProcessRunner {
    pub fn new(id: SlotId, event_tx: EventSender, options: RunnerOptions) -> Self {
        Self {
            id,
            child: None,
            pid: None,
            status: ProcessStatus::Idle,
            log: SharedLog::new(options.max_lines),
            event_tx,
            options,
            #[cfg(test)]
            seam: TestSeam::default(),
        }
    }

    /// Pid of the tracked process, `None` when nothing is tracked.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> &ProcessStatus {
        &self.status
    }

    /// Everything the current and previous runs printed since the last clear.
    pub fn output_text(&self) -> String {
        self.log.text()
    }

    pub fn output_len(&self) -> usize {
        self.log.len()
    }

    /// Spawns `command` through the platform shell in `working_directory`.
    ///
    /// Returns as soon as the process is spawned; output and the exit are
    /// delivered through the event channel. Every failure is also reported as an
    /// `Event::ProcessFailed` so it shows up inline in the slot's output. A
    /// failed request never changes the status of a process that is still running.
    pub async fn start(&mut self, command: &str, working_directory: &str) -> Result<u32, RunnerError> {
        let result = self.spawn(command, working_directory).await;
        if let Err(err) = &result {
            if self.child.is_none() {
                self.status = ProcessStatus::Failed {
                    error: err.to_string(),
                };
            }
            self.emit(Event::ProcessFailed {
                id: self.id,
                error: err.to_string(),
            });
        }
        result
    }

    async fn spawn(&mut self, command: &str, working_directory: &str) -> Result<u32, RunnerError> {
        if self.is_running().await {
            return Err(RunnerError::AlreadyRunning {
                pid: self.pid.unwrap_or(0),
            });
        }
        validate(command, working_directory)?;

        let mut cmd = self.shell_command(command);
        cmd.current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|err| RunnerError::Spawn {
            command: command.to_string(),
            reason: err.to_string(),
        })?;
        let Some(pid) = child.id() else {
            return Err(RunnerError::Spawn {
                command: command.to_string(),
                reason: "process exited before its id could be read".to_string(),
            });
        };
        info!(slot = %self.id, pid, command, dir = working_directory, "spawned process");

        self.pid = Some(pid);
        self.status = ProcessStatus::Running { pid };
        self.emit(Event::ProcessStarted {
            id: self.id,
            pid,
            command: command.to_string(),
            directory: working_directory.to_string(),
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(
                self.id,
                StreamKind::Stdout,
                stdout,
                self.log.clone(),
                self.event_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(
                self.id,
                StreamKind::Stderr,
                stderr,
                self.log.clone(),
                self.event_tx.clone(),
            ));
        }
        self.child = Some(child);
        Ok(pid)
    }

    #[cfg(not(test))]
    fn shell_command(&self, command: &str) -> Command {
        shell_command(command)
    }

    #[cfg(test)]
    fn shell_command(&self, command: &str) -> Command {
        match self.seam.shell {
            Some(program) => {
                let mut cmd = Command::new(program);
                cmd.arg("-c").arg(command);
                cmd
            }
            None => shell_command(command),
        }
    }

    /// Refreshes the exit status and reports whether the process is still alive.
    pub async fn is_running(&mut self) -> bool {
        self.poll_exit().await;
        self.child.is_some()
    }

    /// Detects a process that ended on its own and emits `Event::ProcessExited`.
    pub async fn poll_exit(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code();
                debug!(slot = %self.id, ?code, "process exited");
                self.child = None;
                self.pid = None;
                self.status = ProcessStatus::Exited { code };
                self.emit(Event::ProcessExited { id: self.id, code });
            }
            Ok(None) => {}
            Err(err) => {
                warn!(slot = %self.id, error = %err, "failed to query process status");
            }
        }
    }

    /// Terminates the tracked process and all of its descendants.
    ///
    /// Does nothing when no process is running. On failure the pid stays tracked
    /// so the stop can be retried.
    pub async fn stop(&mut self, reason: StopReason) -> Result<(), RunnerError> {
        if !self.is_running().await {
            return Ok(());
        }
        let result = self.terminate().await;
        match &result {
            Ok(()) => {
                info!(slot = %self.id, ?reason, "process stopped");
                self.child = None;
                self.pid = None;
                self.status = ProcessStatus::Stopped { reason };
                self.emit(Event::ProcessStopped { id: self.id, reason });
            }
            Err(err) => {
                self.emit(Event::ProcessFailed {
                    id: self.id,
                    error: err.to_string(),
                });
            }
        }
        result
    }

    async fn terminate(&mut self) -> Result<(), RunnerError> {
        let timeout = self.options.kill_timeout;
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            // Already reaped by tokio; nothing left to kill.
            return Ok(());
        };

        #[cfg(test)]
        if self.seam.refuse_kill {
            return Err(RunnerError::Termination {
                pid,
                reason: "kill refused".to_string(),
            });
        }

        #[cfg(unix)]
        let killed = kill_tree(pid);
        #[cfg(windows)]
        let killed = kill_tree(pid, timeout).await;
        let tree_error = match killed {
            Ok(()) => match wait_for_exit(child, timeout).await {
                Some(_) => return Ok(()),
                None => "process tree still alive after kill".to_string(),
            },
            Err(err) => err.to_string(),
        };

        warn!(pid, error = %tree_error, "tree kill failed, killing process directly");
        if let Err(err) = child.start_kill() {
            return Err(RunnerError::Termination {
                pid,
                reason: format!("{}; direct kill: {}", tree_error, err),
            });
        }
        match wait_for_exit(child, timeout).await {
            Some(_) => Ok(()),
            None => Err(RunnerError::Termination {
                pid,
                reason: format!("{}; process did not exit after direct kill", tree_error),
            }),
        }
    }

    /// Clears the accumulated output. A running process is not affected.
    pub fn clear_output(&mut self) {
        self.log.clear();
        self.emit(Event::OutputCleared { id: self.id });
    }

    // Lifecycle events are sent from the task that drains the channel, so they
    // must not wait for room in it.
    fn emit(&self, event: Event) {
        self.event_tx.send(event);
    }
}

fn validate(command: &str, working_directory: &str) -> Result<(), RunnerError> {
    if command.trim().is_empty() {
        return Err(RunnerError::Validation("no command specified".to_string()));
    }
    if working_directory.trim().is_empty() || !Path::new(working_directory).is_dir() {
        return Err(RunnerError::Validation(format!(
            "invalid working directory: {:?}",
            working_directory
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("powershell.exe");
    cmd.args(["-NoProfile", "-Command", command]);
    cmd
}

// The child is its own process group leader, so signalling the negated pid reaches
// every descendant that did not move itself into a new session. The signal is
// delivered synchronously; the caller bounds the wait for the exit.
#[cfg(unix)]
fn kill_tree(pid: u32) -> std::io::Result<()> {
    let pgid = pid as libc::pid_t;
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
async fn kill_tree(pid: u32, timeout: Duration) -> std::io::Result<()> {
    let mut taskkill = Command::new("taskkill");
    taskkill
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = taskkill.spawn()?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        )),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "taskkill did not finish in time",
        )),
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(error = %err, "failed to wait for process");
            None
        }
        Err(_) => None,
    }
}

async fn read_stream<R>(
    id: SlotId,
    stream: StreamKind,
    reader: R,
    log: SharedLog,
    tx: EventSender,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                // Tools may print invalid UTF-8; keep the line rather than ending the stream.
                let line = sanitize_text(&String::from_utf8_lossy(&buf), false);
                log.push(&line, stream);
                // Keep draining the pipe after the receiver is gone so the child never blocks.
                tx.send_output(Event::ProcessOutput { id, line, stream }).await;
            }
            Err(err) => {
                debug!(slot = %id, error = %err, "output stream closed");
                break;
            }
        }
    }
}
