//! Identity and status types shared by runners and the orchestrator.

use std::fmt;

use crate::events::StopReason;

/// Stable identifier for a slot.
///
/// Ids are never reused within an orchestrator, so output still in flight from a
/// removed slot cannot be attributed to whichever slot moved into its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which of a slot's two stored commands to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Run,
    Build,
}

impl CommandKind {
    pub fn label(self) -> &'static str {
        match self {
            CommandKind::Run => "run",
            CommandKind::Build => "build",
        }
    }
}

/// The current lifecycle status of a slot's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Nothing has been started yet (initial state).
    Idle,
    /// Process is actively running.
    Running { pid: u32 },
    /// Process exited on its own.
    Exited { code: Option<i32> },
    /// Process tree was terminated by the runner.
    Stopped { reason: StopReason },
    /// The last start or stop attempt failed.
    Failed { error: String },
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running { .. })
    }

    pub fn label(&self) -> String {
        match self {
            ProcessStatus::Idle => "idle".to_string(),
            ProcessStatus::Running { pid } => format!("running (pid {})", pid),
            ProcessStatus::Exited { code: Some(code) } => format!("exited ({})", code),
            ProcessStatus::Exited { code: None } => "exited".to_string(),
            ProcessStatus::Stopped { .. } => "stopped".to_string(),
            ProcessStatus::Failed { error } => format!("failed: {}", error),
        }
    }
}
