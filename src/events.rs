//! Event definitions for the runner event channel.
//!
//! Every `ProcessRunner` publishes into one shared channel of `Event`s. The
//! channel is the single serialization point for output coming from many
//! processes and both of their streams, so a consumer never sees interleaved
//! partial writes.
//!
//! The channel has two lanes. Output lines go through a bounded lane so a noisy
//! process waits for the consumer. Lifecycle events go through an unbounded lane:
//! they are sent from the same task that drains the channel, which must never
//! wait for room in it.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::output::StreamKind;
use crate::process::SlotId;

/// Why a runner stopped its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user asked for the process to be stopped.
    UserRequested,
    /// The process was stopped so the slot could be started again.
    PreRestart,
}

impl StopReason {
    pub fn describe(self) -> &'static str {
        match self {
            StopReason::UserRequested => "terminated by user",
            StopReason::PreRestart => "terminated before starting new command",
        }
    }
}

/// Represents an event emitted by a slot's runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A process has been spawned.
    ProcessStarted {
        id: SlotId,
        pid: u32,
        command: String,
        directory: String,
    },
    /// A line of output (stdout or stderr) was received from a process.
    ProcessOutput {
        id: SlotId,
        line: String,
        stream: StreamKind,
    },
    /// A process exited on its own (None usually implies signal termination).
    ProcessExited { id: SlotId, code: Option<i32> },
    /// A process tree was terminated by the runner.
    ProcessStopped { id: SlotId, reason: StopReason },
    /// A start or stop request failed; the message is meant for the slot's output.
    ProcessFailed { id: SlotId, error: String },
    /// The slot's accumulated output was cleared.
    OutputCleared { id: SlotId },
}

impl Event {
    /// The slot this event belongs to.
    pub fn slot(&self) -> SlotId {
        match self {
            Event::ProcessStarted { id, .. }
            | Event::ProcessOutput { id, .. }
            | Event::ProcessExited { id, .. }
            | Event::ProcessStopped { id, .. }
            | Event::ProcessFailed { id, .. }
            | Event::OutputCleared { id } => *id,
        }
    }
}

/// Creates an event channel whose output lane holds `capacity` lines.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::channel(capacity);
    (
        EventSender {
            control: control_tx,
            output: output_tx,
        },
        EventReceiver {
            control: control_rx,
            output: output_rx,
        },
    )
}

#[derive(Debug, Clone)]
pub struct EventSender {
    control: mpsc::UnboundedSender<Event>,
    output: mpsc::Sender<Event>,
}

impl EventSender {
    /// Sends a lifecycle event. Never waits.
    pub fn send(&self, event: Event) {
        let _ = self.control.send(event);
    }

    /// Sends an output line, waiting while the output lane is full.
    pub async fn send_output(&self, event: Event) {
        let _ = self.output.send(event).await;
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    control: mpsc::UnboundedReceiver<Event>,
    output: mpsc::Receiver<Event>,
}

impl EventReceiver {
    /// Next event, lifecycle events first. `None` once every sender is gone.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            Some(event) = self.control.recv() => Some(event),
            Some(event) = self.output.recv() => Some(event),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        match self.control.try_recv() {
            Ok(event) => Ok(event),
            Err(_) => self.output.try_recv(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(line: &str) -> Event {
        Event::ProcessOutput {
            id: SlotId(0),
            line: line.into(),
            stream: StreamKind::Stdout,
        }
    }

    #[tokio::test]
    async fn lifecycle_events_skip_a_full_output_lane() {
        let (tx, mut rx) = channel(1);
        tx.send_output(output("a")).await;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tx.send_output(output("b")),
        )
        .await;
        assert!(blocked.is_err());

        tx.send(Event::OutputCleared { id: SlotId(0) });
        assert_eq!(rx.recv().await, Some(Event::OutputCleared { id: SlotId(0) }));
        assert_eq!(rx.recv().await, Some(output("a")));
        assert!(rx.try_recv().is_err());

        drop(tx);
        assert_eq!(rx.recv().await, None);
    }
}
