//! Batch operations over an ordered arena of slots.
//!
//! The `Orchestrator` owns one `ProcessRunner` per slot, in display order, and
//! implements stop-all (concurrent, best-effort) and run-all (sequential, with a
//! settle delay before the first start and a fixed delay between starts).
//!
//! Run-all can be driven two ways: `run_all` awaits the whole sequence, while
//! `begin_run_all` / `poll_run_all` let an event loop step it between other work,
//! sleeping until `run_all_deadline`. While a sequence is in flight the slot list
//! is frozen and a second run-all is refused.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventSender, StopReason};
use crate::process::{CommandKind, SlotId};
use crate::runner::{ProcessRunner, RunnerError, RunnerOptions};
use crate::settings::{Profile, TerminalConfig};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_INTER_START_DELAY: Duration = Duration::from_secs(4);

/// Run-all pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause after stopping every slot, before the first start.
    pub settle_delay: Duration,
    /// Pause between consecutive starts. Not applied after the last slot.
    pub inter_start_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            inter_start_delay: DEFAULT_INTER_START_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("run-all is in progress")]
    Busy,
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("cannot remove the last slot")]
    LastSlot,
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// A configured slot and its runner.
pub struct Slot {
    pub id: SlotId,
    pub config: TerminalConfig,
    pub runner: ProcessRunner,
}

impl Slot {
    fn command(&self, kind: CommandKind) -> &str {
        match kind {
            CommandKind::Run => &self.config.run_command,
            CommandKind::Build => &self.config.build_command,
        }
    }
}

/// Outcome of a stop-all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopAllReport {
    pub failed: Vec<(SlotId, RunnerError)>,
}

impl StopAllReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a run-all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunAllReport {
    /// Slots started, in start order, with their pids.
    pub started: Vec<(SlotId, u32)>,
    /// Slots whose start failed. The sequence continued past each of them.
    pub failed: Vec<(SlotId, RunnerError)>,
    /// Slots whose initial stop failed.
    pub stop_failed: Vec<(SlotId, RunnerError)>,
    /// Time from the request to the last start.
    pub elapsed: Duration,
}

struct RunAllSequence {
    pending: VecDeque<SlotId>,
    deadline: Instant,
    began_at: Instant,
    report: RunAllReport,
}

pub struct Orchestrator {
    slots: Vec<Slot>,
    next_id: usize,
    event_tx: EventSender,
    timing: Timing,
    runner_options: RunnerOptions,
    run_all: Option<RunAllSequence>,
}

impl Orchestrator {
    pub fn new(event_tx: EventSender, timing: Timing, runner_options: RunnerOptions) -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
            event_tx,
            timing,
            runner_options,
            run_all: None,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    /// Slot id at a display position.
    pub fn slot_at(&self, index: usize) -> Option<SlotId> {
        self.slots.get(index).map(|slot| slot.id)
    }

    pub fn position(&self, id: SlotId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    /// Slot configurations in display order, for writing back to a profile.
    pub fn configs(&self) -> Vec<TerminalConfig> {
        self.slots.iter().map(|slot| slot.config.clone()).collect()
    }

    pub fn is_running_all(&self) -> bool {
        self.run_all.is_some()
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut Slot, OrchestratorError> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(OrchestratorError::UnknownSlot(id))
    }

    fn ensure_idle(&self) -> Result<(), OrchestratorError> {
        if self.run_all.is_some() {
            return Err(OrchestratorError::Busy);
        }
        Ok(())
    }

    pub fn add_slot(&mut self, config: TerminalConfig) -> Result<SlotId, OrchestratorError> {
        self.ensure_idle()?;
        let id = SlotId(self.next_id);
        self.next_id += 1;
        let runner = ProcessRunner::new(id, self.event_tx.clone(), self.runner_options);
        self.slots.push(Slot { id, config, runner });
        Ok(id)
    }

    /// Stops the slot's process and removes it. The last slot cannot be removed.
    pub async fn remove_slot(&mut self, id: SlotId) -> Result<TerminalConfig, OrchestratorError> {
        self.ensure_idle()?;
        let index = self.position(id).ok_or(OrchestratorError::UnknownSlot(id))?;
        if self.slots.len() <= 1 {
            return Err(OrchestratorError::LastSlot);
        }
        let mut slot = self.slots.remove(index);
        if let Err(err) = slot.runner.stop(StopReason::UserRequested).await {
            // The runner kills its child on drop as a last resort.
            warn!(slot = %id, error = %err, "failed to stop removed slot");
        }
        Ok(slot.config)
    }

    pub fn move_slot_up(&mut self, id: SlotId) -> Result<bool, OrchestratorError> {
        self.ensure_idle()?;
        let index = self.position(id).ok_or(OrchestratorError::UnknownSlot(id))?;
        if index == 0 {
            return Ok(false);
        }
        self.slots.swap(index - 1, index);
        Ok(true)
    }

    pub fn move_slot_down(&mut self, id: SlotId) -> Result<bool, OrchestratorError> {
        self.ensure_idle()?;
        let index = self.position(id).ok_or(OrchestratorError::UnknownSlot(id))?;
        if index + 1 >= self.slots.len() {
            return Ok(false);
        }
        self.slots.swap(index, index + 1);
        Ok(true)
    }

    pub fn update_slot(
        &mut self,
        id: SlotId,
        edit: impl FnOnce(&mut TerminalConfig),
    ) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;
        edit(&mut self.slot_mut(id)?.config);
        Ok(())
    }

    /// Stops every slot and replaces the arena with the profile's terminals.
    pub async fn load_profile(&mut self, profile: &Profile) -> Result<StopAllReport, OrchestratorError> {
        self.ensure_idle()?;
        let report = self.stop_all().await;
        self.slots.clear();
        for terminal in &profile.terminals {
            self.add_slot(terminal.clone())?;
        }
        info!(profile = %profile.name, slots = self.slots.len(), "loaded profile");
        Ok(report)
    }

    /// Starts one of the slot's stored commands. Fails if the slot is already running.
    pub async fn start_slot(&mut self, id: SlotId, kind: CommandKind) -> Result<u32, OrchestratorError> {
        let slot = self.slot_mut(id)?;
        let command = slot.command(kind).to_string();
        let directory = slot.config.directory.clone();
        Ok(slot.runner.start(&command, &directory).await?)
    }

    /// Clears the slot, stops whatever it runs, waits the settle delay if something
    /// was stopped, then starts the requested command.
    pub async fn restart_slot(&mut self, id: SlotId, kind: CommandKind) -> Result<u32, OrchestratorError> {
        let settle = self.timing.settle_delay;
        let slot = self.slot_mut(id)?;
        slot.runner.clear_output();
        if slot.runner.is_running().await {
            slot.runner.stop(StopReason::PreRestart).await?;
            tokio::time::sleep(settle).await;
        }
        self.start_slot(id, kind).await
    }

    pub async fn stop_slot(&mut self, id: SlotId) -> Result<(), OrchestratorError> {
        self.slot_mut(id)?
            .runner
            .stop(StopReason::UserRequested)
            .await?;
        Ok(())
    }

    pub fn clear_slot(&mut self, id: SlotId) -> Result<(), OrchestratorError> {
        self.slot_mut(id)?.runner.clear_output();
        Ok(())
    }

    /// Checks every runner for a process that exited on its own.
    pub async fn poll_exits(&mut self) {
        for slot in &mut self.slots {
            slot.runner.poll_exit().await;
        }
    }

    /// Stops every slot concurrently. A failure on one slot does not keep the
    /// others from being stopped.
    pub async fn stop_all(&mut self) -> StopAllReport {
        let results = join_all(self.slots.iter_mut().map(|slot| async move {
            (slot.id, slot.runner.stop(StopReason::UserRequested).await)
        }))
        .await;
        let failed: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|err| (id, err)))
            .collect();
        for (id, err) in &failed {
            warn!(slot = %id, error = %err, "stop-all could not stop slot");
        }
        StopAllReport { failed }
    }

    /// Clears and stops every slot, then schedules the first start after the settle delay.
    pub async fn begin_run_all(&mut self) -> Result<(), OrchestratorError> {
        self.ensure_idle()?;
        let began_at = Instant::now();
        let mut report = RunAllReport::default();
        for slot in &mut self.slots {
            slot.runner.clear_output();
            if let Err(err) = slot.runner.stop(StopReason::PreRestart).await {
                report.stop_failed.push((slot.id, err));
            }
        }
        let pending: VecDeque<SlotId> = self.slots.iter().map(|slot| slot.id).collect();
        info!(slots = pending.len(), "run-all started");
        self.run_all = Some(RunAllSequence {
            pending,
            deadline: Instant::now() + self.timing.settle_delay,
            began_at,
            report,
        });
        Ok(())
    }

    /// When the next run-all step is due.
    pub fn run_all_deadline(&self) -> Option<Instant> {
        self.run_all.as_ref().map(|sequence| sequence.deadline)
    }

    /// Performs the next due run-all step. Returns the report once the last slot
    /// has been started.
    pub async fn poll_run_all(&mut self) -> Option<RunAllReport> {
        let mut sequence = self.run_all.take()?;
        if Instant::now() < sequence.deadline {
            self.run_all = Some(sequence);
            return None;
        }

        while let Some(id) = sequence.pending.pop_front() {
            let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == id) else {
                continue;
            };
            let command = slot.config.run_command.clone();
            let directory = slot.config.directory.clone();
            debug!(slot = %id, command = %command, "run-all starting slot");
            match slot.runner.start(&command, &directory).await {
                Ok(pid) => sequence.report.started.push((id, pid)),
                Err(err) => sequence.report.failed.push((id, err)),
            }
            if !sequence.pending.is_empty() {
                sequence.deadline = Instant::now() + self.timing.inter_start_delay;
                self.run_all = Some(sequence);
                return None;
            }
            break;
        }

        let mut report = sequence.report;
        report.elapsed = sequence.began_at.elapsed();
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run-all finished"
        );
        Some(report)
    }

    /// Runs the whole run-all sequence to completion.
    pub async fn run_all(&mut self) -> Result<RunAllReport, OrchestratorError> {
        self.begin_run_all().await?;
        loop {
            if let Some(deadline) = self.run_all_deadline() {
                tokio::time::sleep_until(deadline).await;
            }
            if let Some(report) = self.poll_run_all().await {
                return Ok(report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, Event, EventReceiver};
    use std::sync::{Arc, Mutex};

    fn fast_timing() -> Timing {
        Timing {
            settle_delay: Duration::from_millis(20),
            inter_start_delay: Duration::from_millis(150),
        }
    }

    fn orchestrator(timing: Timing) -> (Orchestrator, EventReceiver) {
        let (tx, rx) = events::channel(1024);
        (Orchestrator::new(tx, timing, RunnerOptions::default()), rx)
    }

    fn slot(title: &str, dir: &str, run: &str) -> TerminalConfig {
        TerminalConfig {
            title: title.into(),
            directory: dir.into(),
            run_command: run.into(),
            build_command: "echo built".into(),
            ..TerminalConfig::default()
        }
    }

    // Records when each start event arrives.
    fn collect_starts(mut rx: EventReceiver) -> Arc<Mutex<Vec<(std::time::Instant, SlotId)>>> {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let sink = starts.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Event::ProcessStarted { id, .. } = event {
                    sink.lock().unwrap().push((std::time::Instant::now(), id));
                }
            }
        });
        starts
    }

    #[tokio::test]
    async fn slot_edits_respect_order_and_last_slot() {
        let (mut orch, _rx) = orchestrator(fast_timing());
        let a = orch.add_slot(slot("a", "", "")).unwrap();
        let b = orch.add_slot(slot("b", "", "")).unwrap();
        assert_eq!(orch.move_slot_up(b), Ok(true));
        assert_eq!(orch.slot_at(0), Some(b));
        assert_eq!(orch.move_slot_up(b), Ok(false));
        assert_eq!(orch.move_slot_down(a), Ok(false));
        orch.update_slot(a, |config| config.title = "renamed".into()).unwrap();
        assert_eq!(orch.slot(a).unwrap().config.title, "renamed");
        orch.remove_slot(b).await.unwrap();
        assert_eq!(orch.remove_slot(a).await, Err(OrchestratorError::LastSlot));
        assert_eq!(
            orch.remove_slot(b).await,
            Err(OrchestratorError::UnknownSlot(b))
        );
        assert_eq!(orch.configs().len(), 1);
    }

    #[tokio::test]
    async fn load_profile_assigns_fresh_ids() {
        let (mut orch, _rx) = orchestrator(fast_timing());
        let first = orch.add_slot(slot("old", "", "")).unwrap();
        let profile = Profile::new("P", vec![slot("x", "", ""), slot("y", "", "")]);
        let report = orch.load_profile(&profile).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(orch.slots().len(), 2);
        assert!(orch.slot(first).is_none());
        assert_eq!(orch.configs(), profile.terminals);
    }

    #[tokio::test]
    async fn stop_all_on_idle_slots_is_clean() {
        let (mut orch, mut rx) = orchestrator(fast_timing());
        orch.add_slot(slot("a", "", "")).unwrap();
        orch.add_slot(slot("b", "", "")).unwrap();
        assert!(orch.stop_all().await.is_clean());
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_all_starts_slots_in_order_with_spacing() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap().to_string();
        let timing = fast_timing();
        let (mut orch, rx) = orchestrator(timing);
        let ids: Vec<_> = ["db", "api", "web"]
            .iter()
            .map(|name| orch.add_slot(slot(name, &dir, "sleep 30")).unwrap())
            .collect();
        let starts = collect_starts(rx);

        let report = orch.run_all().await.unwrap();
        assert!(!orch.is_running_all());
        let started: Vec<_> = report.started.iter().map(|(id, _)| *id).collect();
        assert_eq!(started, ids);
        assert!(report.failed.is_empty());
        assert!(report.elapsed >= timing.settle_delay + timing.inter_start_delay * 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let starts = starts.lock().unwrap().clone();
        let order: Vec<_> = starts.iter().map(|(_, id)| *id).collect();
        assert_eq!(order, ids);
        for pair in starts.windows(2) {
            let gap = pair[1].0.duration_since(pair[0].0);
            assert!(gap >= Duration::from_millis(100), "starts overlapped: {:?}", gap);
        }

        assert!(orch.stop_all().await.is_clean());
        for slot in orch.slots() {
            assert_eq!(slot.runner.pid(), None);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_all_continues_past_failed_start() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap().to_string();
        let (mut orch, _rx) = orchestrator(Timing {
            settle_delay: Duration::from_millis(5),
            inter_start_delay: Duration::from_millis(5),
        });
        let a = orch.add_slot(slot("a", &dir, "sleep 30")).unwrap();
        let b = orch.add_slot(slot("b", &dir, "  ")).unwrap();
        let c = orch.add_slot(slot("c", "/no/such/dir", "sleep 30")).unwrap();
        let d = orch.add_slot(slot("d", &dir, "sleep 30")).unwrap();

        let report = orch.run_all().await.unwrap();
        let started: Vec<_> = report.started.iter().map(|(id, _)| *id).collect();
        assert_eq!(started, vec![a, d]);
        let failed: Vec<_> = report.failed.iter().map(|(id, _)| *id).collect();
        assert_eq!(failed, vec![b, c]);
        orch.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_all_restarts_running_slots_and_refuses_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap().to_string();
        let (mut orch, mut rx) = orchestrator(fast_timing());
        let a = orch.add_slot(slot("a", &dir, "sleep 30")).unwrap();
        let first_pid = orch.start_slot(a, CommandKind::Run).await.unwrap();

        orch.begin_run_all().await.unwrap();
        assert_eq!(orch.begin_run_all().await, Err(OrchestratorError::Busy));
        assert_eq!(orch.add_slot(slot("b", "", "")), Err(OrchestratorError::Busy));
        assert_eq!(orch.slot(a).unwrap().runner.pid(), None);
        assert!(orch.poll_run_all().await.is_none());

        let report = loop {
            let deadline = orch.run_all_deadline().unwrap();
            tokio::time::sleep_until(deadline).await;
            if let Some(report) = orch.poll_run_all().await {
                break report;
            }
        };
        assert_eq!(report.started.len(), 1);
        assert_ne!(report.started[0].1, first_pid);

        let mut saw_pre_restart = false;
        while let Ok(event) = rx.try_recv() {
            if event
                == (Event::ProcessStopped {
                    id: a,
                    reason: StopReason::PreRestart,
                })
            {
                saw_pre_restart = true;
            }
        }
        assert!(saw_pre_restart);
        orch.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_all_and_stop_all_finish_behind_a_noisy_slot() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap().to_string();
        let (tx, _rx) = events::channel(8);
        let mut orch = Orchestrator::new(
            tx,
            Timing {
                settle_delay: Duration::from_millis(5),
                inter_start_delay: Duration::from_millis(200),
            },
            RunnerOptions::default(),
        );
        orch.add_slot(slot("noisy", &dir, "yes")).unwrap();
        orch.add_slot(slot("quiet", &dir, "sleep 30")).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), orch.run_all())
            .await
            .expect("run-all blocked on the event channel")
            .unwrap();
        assert_eq!(report.started.len(), 2);
        let stopped = tokio::time::timeout(Duration::from_secs(10), orch.stop_all())
            .await
            .expect("stop-all blocked on the event channel");
        assert!(stopped.is_clean());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_slot_replaces_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path().to_str().unwrap().to_string();
        let (mut orch, _rx) = orchestrator(fast_timing());
        let a = orch.add_slot(slot("a", &dir, "sleep 30")).unwrap();
        let first = orch.start_slot(a, CommandKind::Run).await.unwrap();
        assert!(matches!(
            orch.start_slot(a, CommandKind::Run).await,
            Err(OrchestratorError::Runner(RunnerError::AlreadyRunning { .. }))
        ));
        let second = orch.restart_slot(a, CommandKind::Build).await.unwrap();
        assert_ne!(first, second);
        orch.stop_slot(a).await.unwrap();
        orch.stop_slot(a).await.unwrap();
    }
}
