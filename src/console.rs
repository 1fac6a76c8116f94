//! Line-oriented console over an `Orchestrator`.
//!
//! One `tokio::select!` loop multiplexes runner events, typed commands from a
//! stdin thread, Ctrl-C, run-all deadlines and a tick that polls exits and
//! expires confirm gates. Output lines are printed with a per-slot prefix.

use std::collections::HashMap;
use std::io::BufRead;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::clipboard;
use crate::config::RunSettings;
use crate::events::{Event, EventReceiver, EventSender};
use crate::gate::{ConfirmGate, Trigger};
use crate::orchestrator::{Orchestrator, RunAllReport, StopAllReport};
use crate::output::StreamKind;
use crate::process::{CommandKind, SlotId};
use crate::settings::{canonical_scheme, scheme_color, ConfigError, Profile, Settings, TerminalConfig};
use crate::store::ConfigStore;

const TICK_RATE: Duration = Duration::from_millis(150);

const HELP: &str = "\
commands:
  list                     show slots of the current profile
  run N | build N          restart slot N with its run or build command (type twice)
  stop N                   stop slot N
  clear N                  clear slot N's output
  copy N                   copy slot N's output to the clipboard
  run-all                  restart every slot in order (type twice)
  stop-all                 stop every slot (type twice)
  add TITLE                add an empty slot
  remove N                 stop and remove slot N
  up N | down N            move slot N
  set N FIELD VALUE        edit a slot; FIELD is title, dir, run, build or color
  profiles                 list profiles
  profile NAME             switch profile
  profile new NAME         create a profile with one blank slot and switch to it
  profile save-as NAME     copy the current slots into a new profile
  profile rename NAME      rename the current profile
  profile delete           delete the current profile and switch to the first one left
  help                     show this text
  quit                     stop every slot and exit";

/// Editable slot field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Title,
    Directory,
    Run,
    Build,
    Color,
}

impl Field {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "title" => Ok(Field::Title),
            "dir" | "directory" => Ok(Field::Directory),
            "run" => Ok(Field::Run),
            "build" => Ok(Field::Build),
            "color" | "colour" => Ok(Field::Color),
            _ => Err(anyhow!(
                "unknown field {}, expected title, dir, run, build or color",
                value
            )),
        }
    }

    pub fn apply(self, config: &mut TerminalConfig, value: &str) -> Result<()> {
        match self {
            Field::Title => config.title = value.to_string(),
            Field::Directory => config.directory = value.to_string(),
            Field::Run => config.run_command = value.to_string(),
            Field::Build => config.build_command = value.to_string(),
            Field::Color => {
                let scheme = canonical_scheme(value)
                    .ok_or_else(|| anyhow!("unknown color scheme {}", value))?;
                config.color_scheme_id = scheme.to_string();
            }
        }
        Ok(())
    }
}

/// A parsed console command. Slot numbers are 1-based display positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Run(usize),
    Build(usize),
    Stop(usize),
    Clear(usize),
    Copy(usize),
    RunAll,
    StopAll,
    Add(String),
    Remove(usize),
    Up(usize),
    Down(usize),
    Set {
        slot: usize,
        field: Field,
        value: String,
    },
    Profile(ProfileCommand),
    Help,
    Quit,
}

/// Profile management from the console. Names are trimmed by `Settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileCommand {
    List,
    Switch(String),
    New(String),
    SaveAs(String),
    Rename(String),
    Delete,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let words = shell_words::split(line).context("failed to parse command")?;
    let Some((head, rest)) = words.split_first() else {
        return Ok(None);
    };
    let command = match (head.to_lowercase().as_str(), rest) {
        ("list" | "ls", []) => Command::List,
        ("run", [n]) => Command::Run(parse_slot_number(n)?),
        ("build", [n]) => Command::Build(parse_slot_number(n)?),
        ("stop", [n]) => Command::Stop(parse_slot_number(n)?),
        ("clear", [n]) => Command::Clear(parse_slot_number(n)?),
        ("copy", [n]) => Command::Copy(parse_slot_number(n)?),
        ("run-all", []) => Command::RunAll,
        ("stop-all", []) => Command::StopAll,
        ("add", title) if !title.is_empty() => Command::Add(title.join(" ")),
        ("remove" | "rm", [n]) => Command::Remove(parse_slot_number(n)?),
        ("up", [n]) => Command::Up(parse_slot_number(n)?),
        ("down", [n]) => Command::Down(parse_slot_number(n)?),
        ("set", [n, field, value @ ..]) if !value.is_empty() => Command::Set {
            slot: parse_slot_number(n)?,
            field: Field::parse(field)?,
            value: value.join(" "),
        },
        ("profiles", []) => Command::Profile(ProfileCommand::List),
        ("profile", [action, name @ ..]) if action == "new" && !name.is_empty() => {
            Command::Profile(ProfileCommand::New(name.join(" ")))
        }
        ("profile", [action, name @ ..]) if action == "save-as" && !name.is_empty() => {
            Command::Profile(ProfileCommand::SaveAs(name.join(" ")))
        }
        ("profile", [action, name @ ..]) if action == "rename" && !name.is_empty() => {
            Command::Profile(ProfileCommand::Rename(name.join(" ")))
        }
        ("profile", [action]) if action == "delete" => Command::Profile(ProfileCommand::Delete),
        ("profile", name) if !name.is_empty() => Command::Profile(ProfileCommand::Switch(name.join(" "))),
        ("help" | "?", []) => Command::Help,
        ("quit" | "exit" | "q", []) => Command::Quit,
        _ => bail!("unrecognized command `{}` (type `help`)", line.trim()),
    };
    Ok(Some(command))
}

pub fn parse_slot_number(value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(anyhow!("invalid slot number {}", value)),
    }
}

/// What a printed line is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLabel {
    pub title: String,
    /// 1-based display position; 0 when the slot is gone.
    pub index: usize,
    pub scheme: String,
}

/// Prefixing, coloring and timestamps for printed lines.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    prefix: Option<String>,
    prefix_colors: bool,
    timestamp: bool,
    start: std::time::Instant,
}

impl OutputFormat {
    pub fn new(settings: &RunSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            prefix_colors: settings.prefix_colors,
            timestamp: settings.timestamp,
            start: std::time::Instant::now(),
        }
    }

    pub fn format_line(&self, label: &SlotLabel, line: &str, stream: StreamKind) -> String {
        let cleaned = strip_existing_prefix(&label.title, line);
        let mut prefix = self.format_prefix(&label.title, label.index);
        if self.prefix_colors {
            prefix = apply_color(&prefix, &label.scheme);
        }
        let marker = match stream {
            StreamKind::Stdout => "",
            StreamKind::Stderr => "! ",
        };
        format!("{}{}{}", prefix, marker, cleaned)
    }

    pub fn format_notice(&self, label: &SlotLabel, text: &str) -> String {
        self.format_line(label, &format_tool_message(text), StreamKind::Stdout)
    }

    fn format_prefix(&self, title: &str, index: usize) -> String {
        let mut prefix = if let Some(template) = self.prefix.as_deref() {
            let has_time = template.contains("{time}");
            let rendered = render_template(template, title, index, &self.elapsed());
            if self.timestamp && !has_time {
                format!("{} {}", self.elapsed(), rendered)
            } else {
                rendered
            }
        } else if self.timestamp {
            format!("{} [{}]", self.elapsed(), title)
        } else {
            format!("[{}]", title)
        };
        if !prefix.is_empty() {
            prefix.push(' ');
        }
        prefix
    }

    fn elapsed(&self) -> String {
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

fn render_template(template: &str, name: &str, index: usize, time: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{index}", &index.to_string())
        .replace("{time}", time)
}

fn apply_color(prefix: &str, scheme: &str) -> String {
    match scheme_color(scheme) {
        Some((r, g, b)) => format!("\u{1b}[38;2;{};{};{}m{}\u{1b}[0m", r, g, b, prefix),
        None => prefix.to_string(),
    }
}

// Tools that already prefix their own lines with the slot title would print it twice.
fn strip_existing_prefix(name: &str, text: &str) -> String {
    let candidates = [
        format!("[{}] ", name),
        format!("[{}]", name),
        format!("{}: ", name),
    ];
    for candidate in candidates {
        if let Some(rest) = text.strip_prefix(&candidate) {
            return rest.trim_start().to_string();
        }
    }
    text.to_string()
}

fn format_tool_message(text: &str) -> String {
    format!("◆ devrunner: {}", text)
}

/// Human text for lifecycle events. Output lines yield `None`.
pub fn describe_event(event: &Event) -> Option<String> {
    let text = match event {
        Event::ProcessStarted {
            pid,
            command,
            directory,
            ..
        } => format!("executing `{}` in {} (pid {})", command, directory, pid),
        Event::ProcessOutput { .. } => return None,
        Event::ProcessExited { code: Some(0), .. } => "process ended successfully".to_string(),
        Event::ProcessExited { code: Some(code), .. } => format!("process ended with code {}", code),
        Event::ProcessExited { code: None, .. } => "process ended".to_string(),
        Event::ProcessStopped { reason, .. } => format!("process {}", reason.describe()),
        Event::ProcessFailed { error, .. } => format!("error: {}", error),
        Event::OutputCleared { .. } => "output cleared".to_string(),
    };
    Some(text)
}

/// How the loop starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read commands from stdin.
    Interactive,
    /// Start a run-all immediately and stream output until Ctrl-C.
    RunAll,
}

#[derive(Debug)]
enum Input {
    Line(String),
    Eof,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    orchestrator: Orchestrator,
    settings: Settings,
    store: ConfigStore,
    format: OutputFormat,
    confirm_window: Duration,
    run_gates: HashMap<SlotId, ConfirmGate>,
    build_gates: HashMap<SlotId, ConfirmGate>,
    run_all_gate: ConfirmGate,
    stop_all_gate: ConfirmGate,
}

impl Console {
    /// Builds the slot arena from the current profile.
    pub async fn new(
        settings: Settings,
        store: ConfigStore,
        run_settings: &RunSettings,
        event_tx: EventSender,
    ) -> Result<Self> {
        let profile = settings
            .current_profile()
            .cloned()
            .ok_or_else(|| ConfigError::ProfileNotFound(settings.current_profile_name.clone()))?;
        let mut orchestrator = Orchestrator::new(event_tx, run_settings.timing, run_settings.runner);
        orchestrator.load_profile(&profile).await?;
        let window = run_settings.confirm_window;
        Ok(Self {
            orchestrator,
            settings,
            store,
            format: OutputFormat::new(run_settings),
            confirm_window: window,
            run_gates: HashMap::new(),
            build_gates: HashMap::new(),
            run_all_gate: ConfirmGate::new(window),
            stop_all_gate: ConfirmGate::new(window),
        })
    }

    pub async fn run(mut self, mut event_rx: EventReceiver, mode: Mode) -> Result<()> {
        let (input_tx, mut input_rx) = mpsc::channel(64);
        match mode {
            Mode::Interactive => {
                println!("{}", HELP);
                self.list();
                spawn_stdin_listener(input_tx.clone());
            }
            Mode::RunAll => {
                self.notice("run-all started, press Ctrl-C to stop every slot");
                self.orchestrator.begin_run_all().await?;
            }
        }
        spawn_signal_listener(input_tx);

        let mut ticker = tokio::time::interval(TICK_RATE);
        loop {
            let run_all_deadline = self.orchestrator.run_all_deadline();
            tokio::select! {
                Some(event) = event_rx.recv() => self.show_event(event),
                Some(input) = input_rx.recv() => {
                    let flow = match input {
                        Input::Line(line) => self.handle_line(&line).await,
                        Input::Eof => {
                            debug!("stdin closed");
                            Flow::Quit
                        }
                        Input::Shutdown => Flow::Quit,
                    };
                    if flow == Flow::Quit {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(run_all_deadline.unwrap_or_else(Instant::now)),
                    if run_all_deadline.is_some() =>
                {
                    if let Some(report) = self.orchestrator.poll_run_all().await {
                        self.show_run_all_report(&report);
                    }
                }
                _ = ticker.tick() => {
                    self.orchestrator.poll_exits().await;
                    self.expire_gates();
                }
            }
        }

        self.notice("stopping every slot");
        let report = self.orchestrator.stop_all().await;
        while let Ok(event) = event_rx.try_recv() {
            self.show_event(event);
        }
        self.show_stop_all_report(&report);
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        match parse_command(line) {
            Ok(None) => Flow::Continue,
            Ok(Some(Command::Quit)) => Flow::Quit,
            Ok(Some(command)) => {
                if let Err(err) = self.execute(command).await {
                    self.notice(&format!("error: {:#}", err));
                }
                Flow::Continue
            }
            Err(err) => {
                self.notice(&format!("{:#}", err));
                Flow::Continue
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::List => self.list(),
            Command::Help => println!("{}", HELP),
            Command::Run(n) => self.confirm_start(n, CommandKind::Run).await?,
            Command::Build(n) => self.confirm_start(n, CommandKind::Build).await?,
            Command::Stop(n) => {
                let id = self.resolve(n)?;
                self.orchestrator.stop_slot(id).await?;
            }
            Command::Clear(n) => {
                let id = self.resolve(n)?;
                self.orchestrator.clear_slot(id)?;
            }
            Command::Copy(n) => self.copy_output(n)?,
            Command::RunAll => match self.run_all_gate.trigger() {
                Trigger::AwaitingConfirmation => self.notice(&format!(
                    "type `run-all` again within {} to restart every slot",
                    seconds(self.confirm_window)
                )),
                Trigger::Confirmed => self.orchestrator.begin_run_all().await?,
            },
            Command::StopAll => match self.stop_all_gate.trigger() {
                Trigger::AwaitingConfirmation => self.notice(&format!(
                    "type `stop-all` again within {} to stop every slot",
                    seconds(self.confirm_window)
                )),
                Trigger::Confirmed => {
                    let report = self.orchestrator.stop_all().await;
                    self.show_stop_all_report(&report);
                }
            },
            Command::Add(title) => {
                let config = TerminalConfig {
                    title,
                    ..TerminalConfig::default()
                };
                self.orchestrator.add_slot(config)?;
                self.save_profile();
                self.notice(&format!("added slot {}", self.orchestrator.slots().len()));
            }
            Command::Remove(n) => {
                let id = self.resolve(n)?;
                let removed = self.orchestrator.remove_slot(id).await?;
                self.run_gates.remove(&id);
                self.build_gates.remove(&id);
                self.save_profile();
                self.notice(&format!("removed {}", removed.title));
            }
            Command::Up(n) => {
                let id = self.resolve(n)?;
                if self.orchestrator.move_slot_up(id)? {
                    self.save_profile();
                    self.list();
                }
            }
            Command::Down(n) => {
                let id = self.resolve(n)?;
                if self.orchestrator.move_slot_down(id)? {
                    self.save_profile();
                    self.list();
                }
            }
            Command::Set { slot, field, value } => {
                let id = self.resolve(slot)?;
                let mut config = self
                    .orchestrator
                    .slot(id)
                    .map(|slot| slot.config.clone())
                    .ok_or_else(|| anyhow!("no slot {}", slot))?;
                field.apply(&mut config, &value)?;
                self.orchestrator.update_slot(id, |current| *current = config)?;
                self.save_profile();
            }
            Command::Profile(command) => self.profile_command(command).await?,
            Command::Quit => {}
        }
        Ok(())
    }

    async fn confirm_start(&mut self, n: usize, kind: CommandKind) -> Result<()> {
        let id = self.resolve(n)?;
        let window = self.confirm_window;
        let gates = match kind {
            CommandKind::Run => &mut self.run_gates,
            CommandKind::Build => &mut self.build_gates,
        };
        let gate = gates.entry(id).or_insert_with(|| ConfirmGate::new(window));
        match gate.trigger() {
            Trigger::AwaitingConfirmation => {
                let text = format!(
                    "type `{} {}` again within {} to confirm",
                    kind.label(),
                    n,
                    seconds(window)
                );
                self.slot_notice(id, &text);
            }
            Trigger::Confirmed => {
                self.orchestrator.restart_slot(id, kind).await?;
            }
        }
        Ok(())
    }

    fn copy_output(&self, n: usize) -> Result<()> {
        let id = self.resolve(n)?;
        let slot = self
            .orchestrator
            .slot(id)
            .ok_or_else(|| anyhow!("no slot {}", n))?;
        let text = slot.runner.output_text();
        if text.is_empty() {
            bail!("{} has no output to copy", slot.config.title);
        }
        clipboard::copy_text(&text)?;
        self.slot_notice(
            id,
            &format!("copied {} lines to clipboard", slot.runner.output_len()),
        );
        Ok(())
    }

    /// Applies a profile command to a fresh copy of the settings file. The slots
    /// are rebuilt only when the current profile's layout changes.
    async fn profile_command(&mut self, command: ProfileCommand) -> Result<()> {
        if command == ProfileCommand::List {
            self.refresh_settings();
            self.list_profiles();
            return Ok(());
        }
        let mut next = self.synced_settings();
        let current = next.current_profile_name.clone();
        let reload = match &command {
            ProfileCommand::List => false,
            ProfileCommand::Switch(name) => {
                next.select_profile(name.trim())?;
                true
            }
            ProfileCommand::New(name) => {
                next.create_profile(name)?;
                true
            }
            ProfileCommand::SaveAs(name) => {
                next.duplicate_profile(&current, name)?;
                false
            }
            ProfileCommand::Rename(name) => {
                next.rename_profile(&current, name)?;
                false
            }
            ProfileCommand::Delete => {
                next.delete_profile(&current)?;
                true
            }
        };
        if reload {
            let profile = next
                .current_profile()
                .cloned()
                .ok_or_else(|| ConfigError::ProfileNotFound(next.current_profile_name.clone()))?;
            let report = self.orchestrator.load_profile(&profile).await?;
            self.show_stop_all_report(&report);
            self.run_gates.clear();
            self.build_gates.clear();
        }
        self.settings = next;
        self.store.save(&self.settings);
        self.list();
        Ok(())
    }

    fn resolve(&self, n: usize) -> Result<SlotId> {
        n.checked_sub(1)
            .and_then(|index| self.orchestrator.slot_at(index))
            .ok_or_else(|| anyhow!("no slot {}", n))
    }

    // Writes the arena back into the current profile.
    fn save_profile(&mut self) {
        self.settings = self.synced_settings();
        self.store.save(&self.settings);
    }

    // Re-reads the settings file so profiles edited by another devrunner
    // invocation survive the next save. The console's current profile wins.
    fn refresh_settings(&mut self) {
        let current = self.settings.current_profile_name.clone();
        let mut latest = self.store.load();
        if latest.profile(&current).is_none() {
            latest
                .profiles
                .push(Profile::new(current.clone(), self.orchestrator.configs()));
        }
        latest.current_profile_name = current;
        self.settings = latest;
    }

    // Latest settings with the arena written into the current profile.
    fn synced_settings(&mut self) -> Settings {
        self.refresh_settings();
        let mut next = self.settings.clone();
        if let Some(profile) = next.current_profile_mut() {
            profile.terminals = self.orchestrator.configs();
        }
        next
    }

    fn expire_gates(&mut self) {
        let mut expired = Vec::new();
        for (kind, gates) in [
            (CommandKind::Run, &mut self.run_gates),
            (CommandKind::Build, &mut self.build_gates),
        ] {
            for (id, gate) in gates.iter_mut() {
                if gate.poll_expired() {
                    expired.push((*id, kind));
                }
            }
        }
        for (id, kind) in expired {
            self.slot_notice(id, &format!("{} not confirmed", kind.label()));
        }
        if self.run_all_gate.poll_expired() {
            self.notice("run-all not confirmed");
        }
        if self.stop_all_gate.poll_expired() {
            self.notice("stop-all not confirmed");
        }
    }

    fn label(&self, id: SlotId) -> SlotLabel {
        match (self.orchestrator.position(id), self.orchestrator.slot(id)) {
            (Some(index), Some(slot)) => SlotLabel {
                title: slot.config.title.clone(),
                index: index + 1,
                scheme: slot.config.color_scheme_id.clone(),
            },
            _ => SlotLabel {
                title: id.to_string(),
                index: 0,
                scheme: String::new(),
            },
        }
    }

    fn show_event(&self, event: Event) {
        let label = self.label(event.slot());
        let line = match event {
            Event::ProcessOutput { line, stream, .. } => self.format.format_line(&label, &line, stream),
            other => match describe_event(&other) {
                Some(text) => self.format.format_notice(&label, &text),
                None => return,
            },
        };
        println!("{}", line);
    }

    fn notice(&self, text: &str) {
        println!("{}", format_tool_message(text));
    }

    fn slot_notice(&self, id: SlotId, text: &str) {
        println!("{}", self.format.format_notice(&self.label(id), text));
    }

    fn list(&self) {
        let mut out = format!("profile {}", self.settings.current_profile_name);
        if self.orchestrator.is_running_all() {
            out.push_str(" (run-all in progress)");
        }
        for (index, slot) in self.orchestrator.slots().iter().enumerate() {
            let config = &slot.config;
            out.push_str(&format!(
                "\n  {}. {} [{}]\n     dir: {}\n     run: {}\n     build: {}\n     color: {}",
                index + 1,
                config.title,
                slot.runner.status().label(),
                or_dash(&config.directory),
                or_dash(&config.run_command),
                or_dash(&config.build_command),
                config.color_scheme_id,
            ));
        }
        println!("{}", out);
    }

    fn list_profiles(&self) {
        let mut out = String::from("profiles");
        for name in self.settings.profile_names() {
            let marker = if name == self.settings.current_profile_name {
                "*"
            } else {
                " "
            };
            out.push_str(&format!("\n {} {}", marker, name));
        }
        println!("{}", out);
    }

    fn show_run_all_report(&self, report: &RunAllReport) {
        self.notice(&format!(
            "run-all finished in {}: {} started, {} failed",
            seconds(report.elapsed),
            report.started.len(),
            report.failed.len() + report.stop_failed.len()
        ));
    }

    fn show_stop_all_report(&self, report: &StopAllReport) {
        if report.is_clean() {
            return;
        }
        for (id, err) in &report.failed {
            self.slot_notice(*id, &format!("could not stop: {}", err));
        }
    }
}

fn or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}

fn seconds(duration: Duration) -> String {
    format!("{}s", duration.as_millis() as f64 / 1000.0)
}

fn spawn_stdin_listener(tx: mpsc::Sender<Input>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(Input::Line(line)).is_err() {
                return;
            }
        }
        let _ = tx.blocking_send(Input::Eof);
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Input>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Input::Shutdown).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Overrides};
    use crate::events::{self, StopReason};
    use tempfile::TempDir;

    fn plain_format() -> OutputFormat {
        let settings = RunSettings::resolve(
            &Config::default(),
            &Overrides {
                no_prefix_colors: true,
                ..Overrides::default()
            },
        );
        OutputFormat::new(&settings)
    }

    fn label(title: &str, index: usize) -> SlotLabel {
        SlotLabel {
            title: title.into(),
            index,
            scheme: "Ocean Blue".into(),
        }
    }

    #[test]
    fn parses_slot_commands() {
        assert_eq!(parse_command("run 2").unwrap(), Some(Command::Run(2)));
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("STOP-ALL").unwrap(), Some(Command::StopAll));
        assert_eq!(
            parse_command("add API server").unwrap(),
            Some(Command::Add("API server".into()))
        );
        assert_eq!(
            parse_command("set 1 run npm run dev").unwrap(),
            Some(Command::Set {
                slot: 1,
                field: Field::Run,
                value: "npm run dev".into()
            })
        );
        assert_eq!(
            parse_command("set 3 dir '/srv/my app'").unwrap(),
            Some(Command::Set {
                slot: 3,
                field: Field::Directory,
                value: "/srv/my app".into()
            })
        );
    }

    #[test]
    fn parses_profile_commands() {
        let profile = |line: &str| match parse_command(line).unwrap() {
            Some(Command::Profile(command)) => command,
            other => panic!("not a profile command: {:?}", other),
        };
        assert_eq!(profile("profiles"), ProfileCommand::List);
        assert_eq!(profile("profile Work Stuff"), ProfileCommand::Switch("Work Stuff".into()));
        assert_eq!(profile("profile new Ops"), ProfileCommand::New("Ops".into()));
        assert_eq!(profile("profile save-as 'Ops 2'"), ProfileCommand::SaveAs("Ops 2".into()));
        assert_eq!(profile("profile rename Main"), ProfileCommand::Rename("Main".into()));
        assert_eq!(profile("profile delete"), ProfileCommand::Delete);
        assert!(parse_command("profile").is_err());
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command("run").is_err());
        assert!(parse_command("run 0").is_err());
        assert!(parse_command("stop two").is_err());
        assert!(parse_command("set 1 shell bash").is_err());
        assert!(parse_command("launch 1").is_err());
        assert!(parse_command("run 'unterminated").is_err());
    }

    #[test]
    fn color_field_requires_known_scheme() {
        let mut config = TerminalConfig::default();
        Field::Color.apply(&mut config, "ruby red").unwrap();
        assert_eq!(config.color_scheme_id, "Ruby Red");
        assert!(Field::Color.apply(&mut config, "Mauve").is_err());
        assert_eq!(config.color_scheme_id, "Ruby Red");
    }

    #[test]
    fn formats_lines_with_prefix_and_stderr_marker() {
        let format = plain_format();
        let api = label("api", 1);
        assert_eq!(format.format_line(&api, "listening", StreamKind::Stdout), "[api] listening");
        assert_eq!(format.format_line(&api, "[api] ready", StreamKind::Stdout), "[api] ready");
        assert_eq!(format.format_line(&api, "oops", StreamKind::Stderr), "[api] ! oops");
        assert_eq!(
            format.format_notice(&api, "output cleared"),
            "[api] ◆ devrunner: output cleared"
        );
    }

    #[test]
    fn renders_prefix_template() {
        let mut format = plain_format();
        format.prefix = Some("{index}|{name}".into());
        assert_eq!(
            format.format_line(&label("web", 2), "hi", StreamKind::Stdout),
            "2|web hi"
        );
    }

    #[test]
    fn colors_prefix_from_scheme() {
        let mut format = plain_format();
        format.prefix_colors = true;
        let line = format.format_line(&label("db", 1), "up", StreamKind::Stdout);
        assert_eq!(line, "\u{1b}[38;2;120;200;255m[db] \u{1b}[0mup");
        let unknown = SlotLabel {
            scheme: "Nope".into(),
            ..label("db", 1)
        };
        assert_eq!(format.format_line(&unknown, "up", StreamKind::Stdout), "[db] up");
    }

    #[test]
    fn describes_lifecycle_events() {
        let id = SlotId(0);
        assert_eq!(
            describe_event(&Event::ProcessStarted {
                id,
                pid: 42,
                command: "npm start".into(),
                directory: "/srv/web".into(),
            })
            .as_deref(),
            Some("executing `npm start` in /srv/web (pid 42)")
        );
        assert_eq!(
            describe_event(&Event::ProcessExited { id, code: Some(2) }).as_deref(),
            Some("process ended with code 2")
        );
        assert_eq!(
            describe_event(&Event::ProcessStopped {
                id,
                reason: StopReason::UserRequested
            })
            .as_deref(),
            Some("process terminated by user")
        );
        assert_eq!(
            describe_event(&Event::ProcessOutput {
                id,
                line: "x".into(),
                stream: StreamKind::Stdout
            }),
            None
        );
    }

    async fn console_with(dir: &TempDir, settings: Settings) -> (Console, ConfigStore) {
        let store = ConfigStore::new(dir.path().join("settings.json"));
        store.try_save(&settings).unwrap();
        let run = RunSettings::resolve(&Config::default(), &Overrides::default());
        let (tx, _rx) = events::channel(64);
        let console = Console::new(store.load(), store.clone(), &run, tx).await.unwrap();
        (console, store)
    }

    async fn console_in(dir: &TempDir) -> (Console, ConfigStore) {
        let mut settings = Settings::with_default_profile();
        settings.create_profile("Work").unwrap();
        settings.select_profile("Default").unwrap();
        console_with(dir, settings).await
    }

    fn switch(name: &str) -> Command {
        Command::Profile(ProfileCommand::Switch(name.into()))
    }

    #[tokio::test]
    async fn slot_edits_are_saved() {
        let dir = TempDir::new().unwrap();
        let (mut console, store) = console_in(&dir).await;
        console.execute(Command::Add("Worker".into())).await.unwrap();
        console
            .execute(Command::Set {
                slot: 3,
                field: Field::Run,
                value: "cargo run".into(),
            })
            .await
            .unwrap();
        console.execute(Command::Up(3)).await.unwrap();

        let saved = store.load();
        let titles: Vec<_> = saved
            .current_profile()
            .unwrap()
            .terminals
            .iter()
            .map(|t| t.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Front End", "Worker", "Back End"]);
        assert_eq!(saved.current_profile().unwrap().terminals[1].run_command, "cargo run");
    }

    #[tokio::test]
    async fn switching_profile_rebuilds_slots() {
        let dir = TempDir::new().unwrap();
        let (mut console, store) = console_in(&dir).await;
        console.execute(switch("Work")).await.unwrap();
        assert_eq!(console.orchestrator.slots().len(), 1);
        assert_eq!(store.load().current_profile_name, "Work");
        assert!(console.execute(Command::Remove(1)).await.is_err());
        assert!(console.execute(switch("Missing")).await.is_err());
        assert!(console.execute(Command::Stop(4)).await.is_err());
    }

    #[tokio::test]
    async fn last_profile_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let (mut console, store) = console_with(&dir, Settings::with_default_profile()).await;
        let err = console
            .execute(Command::Profile(ProfileCommand::Delete))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::LastProfile)
        ));
        assert_eq!(console.orchestrator.slots().len(), 2);
        assert_eq!(store.load().profile_names(), vec!["Default"]);
    }

    #[tokio::test]
    async fn profile_commands_manage_profiles() {
        let dir = TempDir::new().unwrap();
        let (mut console, store) = console_in(&dir).await;
        console.execute(Command::Add("Worker".into())).await.unwrap();

        console
            .execute(Command::Profile(ProfileCommand::SaveAs("Copy".into())))
            .await
            .unwrap();
        let saved = store.load();
        assert_eq!(saved.current_profile_name, "Copy");
        assert_eq!(saved.profile("Copy").unwrap().terminals.len(), 3);
        assert_eq!(console.orchestrator.slots().len(), 3);

        console
            .execute(Command::Profile(ProfileCommand::Rename("Main".into())))
            .await
            .unwrap();
        assert!(store.load().profile("Copy").is_none());
        assert_eq!(store.load().current_profile_name, "Main");

        console
            .execute(Command::Profile(ProfileCommand::New("Ops".into())))
            .await
            .unwrap();
        assert_eq!(console.orchestrator.slots().len(), 1);
        assert_eq!(store.load().current_profile_name, "Ops");

        console
            .execute(Command::Profile(ProfileCommand::Delete))
            .await
            .unwrap();
        let saved = store.load();
        assert_eq!(saved.profile_names(), vec!["Default", "Work", "Main"]);
        assert_eq!(saved.current_profile_name, "Default");
        assert_eq!(console.orchestrator.slots().len(), 3);
    }

    #[tokio::test]
    async fn saving_keeps_profiles_edited_elsewhere() {
        let dir = TempDir::new().unwrap();
        let (mut console, store) = console_in(&dir).await;

        let mut outside = store.load();
        outside.create_profile("Ops").unwrap();
        outside.delete_profile("Work").unwrap();
        outside.select_profile("Ops").unwrap();
        store.try_save(&outside).unwrap();

        console.execute(Command::Add("Worker".into())).await.unwrap();
        let saved = store.load();
        assert_eq!(saved.profile_names(), vec!["Default", "Ops"]);
        assert_eq!(saved.current_profile_name, "Default");
        assert_eq!(saved.profile("Default").unwrap().terminals.len(), 3);
    }
}
