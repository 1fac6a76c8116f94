//! devrunner: run, restart and stop a profile of development commands.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads the settings and runner options, and either runs the console loop or
//! applies a one-shot profile/slot edit.

mod clipboard;
mod config;
mod console;
mod events;
mod gate;
mod orchestrator;
mod output;
mod process;
mod runner;
mod settings;
mod store;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, Overrides, RunSettings};
use crate::console::{parse_slot_number, Console, Field, Mode};
use crate::settings::{ConfigError, Settings, TerminalConfig};
use crate::store::ConfigStore;

const LOG_ENV: &str = "DEVRUNNER_LOG";
/// Output lines buffered between the runners and the console.
const OUTPUT_CAPACITY: usize = 256;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrunner",
    version,
    about = "Run, restart and stop a profile of development commands",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to settings.json (profiles and slots).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Path to devrunner.toml runner options.
    #[arg(long, global = true)]
    options: Option<PathBuf>,
    /// Ignore any devrunner.toml.
    #[arg(long, global = true)]
    no_options: bool,
    /// Pause after stopping every slot, before run-all starts the first (ms).
    #[arg(long, global = true)]
    settle_delay_ms: Option<u64>,
    /// Pause between two run-all starts (ms).
    #[arg(long, global = true)]
    inter_start_delay_ms: Option<u64>,
    /// How long a confirmation stays armed (ms).
    #[arg(long, global = true)]
    confirm_window_ms: Option<u64>,
    /// Upper bound on waiting for a killed process tree (ms).
    #[arg(long, global = true)]
    kill_timeout_ms: Option<u64>,
    /// Max output lines kept per slot.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Prefix template (e.g. "[{index}:{name}]").
    #[arg(long, global = true)]
    prefix: Option<String>,
    /// Do not colorize prefixes.
    #[arg(long, global = true)]
    no_prefix_colors: bool,
    /// Prepend elapsed time to each line.
    #[arg(long, global = true)]
    timestamp: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Interactive console (default).
    Console,
    /// Restart every slot of a profile in order and stream output until Ctrl-C.
    RunAll {
        /// Profile to run instead of the current one.
        #[arg(long)]
        profile: Option<String>,
    },
    /// Manage profiles.
    Profiles {
        #[command(subcommand)]
        action: Option<ProfileAction>,
    },
    /// Edit the slots of the current profile.
    Slots {
        #[command(subcommand)]
        action: Option<SlotAction>,
    },
    /// Print the settings and options file locations.
    Path,
}

#[derive(Debug, Clone, Subcommand)]
enum ProfileAction {
    List,
    /// Create a profile with one empty slot and make it current.
    Create { name: String },
    Rename { old: String, new: String },
    /// Copy a profile's slots into a new profile and make it current.
    Duplicate { source: String, name: String },
    Delete { name: String },
    Select { name: String },
}

#[derive(Debug, Clone, Subcommand)]
enum SlotAction {
    List,
    Add { title: String },
    Remove { slot: String },
    Up { slot: String },
    Down { slot: String },
    /// Set a field: title, dir, run, build or color.
    Set {
        slot: String,
        field: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let store = settings_store(&cli)?;

    match cli.command.clone().unwrap_or(Commands::Console) {
        Commands::Console => run_console(&cli, store, None, Mode::Interactive).await,
        Commands::RunAll { profile } => run_console(&cli, store, profile, Mode::RunAll).await,
        Commands::Profiles { action } => {
            let mut settings = store.load();
            let action = action.unwrap_or(ProfileAction::List);
            let changed = apply_profile_action(&mut settings, &action)?;
            if changed {
                store.try_save(&settings)?;
            }
            print_profiles(&settings);
            Ok(())
        }
        Commands::Slots { action } => {
            let mut settings = store.load();
            let action = action.unwrap_or(SlotAction::List);
            let changed = apply_slot_action(&mut settings, &action)?;
            if changed {
                store.try_save(&settings)?;
            }
            print_slots(&settings);
            Ok(())
        }
        Commands::Path => {
            println!("settings: {}", store.path().display());
            match options_path(&cli) {
                Some(path) => println!("options:  {}", path.display()),
                None => println!("options:  (none)"),
            }
            Ok(())
        }
    }
}

/// Stderr diagnostics, `warn` unless `DEVRUNNER_LOG` says otherwise.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn settings_store(cli: &Cli) -> Result<ConfigStore> {
    let path = match &cli.settings {
        Some(path) => path.clone(),
        None => ConfigStore::default_path()
            .ok_or_else(|| anyhow!("no config directory on this platform, pass --settings"))?,
    };
    Ok(ConfigStore::new(path))
}

fn options_path(cli: &Cli) -> Option<PathBuf> {
    if cli.no_options {
        return None;
    }
    cli.options.clone().or_else(config::default_config_path)
}

fn load_run_settings(cli: &Cli) -> Result<RunSettings> {
    let config = match options_path(cli) {
        // An explicit path must exist; the default one is optional.
        Some(path) if cli.options.is_some() || path.exists() => config::load_config(&path)?,
        _ => Config::default(),
    };
    let overrides = Overrides {
        settle_delay_ms: cli.settle_delay_ms,
        inter_start_delay_ms: cli.inter_start_delay_ms,
        confirm_window_ms: cli.confirm_window_ms,
        kill_timeout_ms: cli.kill_timeout_ms,
        max_lines: cli.max_lines,
        prefix: cli.prefix.clone(),
        no_prefix_colors: cli.no_prefix_colors,
        timestamp: cli.timestamp,
    };
    Ok(RunSettings::resolve(&config, &overrides))
}

async fn run_console(
    cli: &Cli,
    store: ConfigStore,
    profile: Option<String>,
    mode: Mode,
) -> Result<()> {
    let run_settings = load_run_settings(cli)?;
    let mut settings = store.load();
    if let Some(name) = profile {
        settings.select_profile(name.trim())?;
    }
    debug!(settings = %store.path().display(), profile = %settings.current_profile_name, "starting console");
    let (event_tx, event_rx) = events::channel(OUTPUT_CAPACITY);
    let console = Console::new(settings, store, &run_settings, event_tx).await?;
    console.run(event_rx, mode).await
}

/// Applies a profile edit. Returns whether anything changed.
fn apply_profile_action(settings: &mut Settings, action: &ProfileAction) -> Result<bool> {
    match action {
        ProfileAction::List => return Ok(false),
        ProfileAction::Create { name } => settings.create_profile(name)?,
        ProfileAction::Rename { old, new } => settings.rename_profile(old, new)?,
        ProfileAction::Duplicate { source, name } => settings.duplicate_profile(source, name)?,
        ProfileAction::Delete { name } => {
            settings.delete_profile(name)?;
        }
        ProfileAction::Select { name } => settings.select_profile(name)?,
    }
    Ok(true)
}

/// Applies a slot edit to the current profile. Returns whether anything changed.
fn apply_slot_action(settings: &mut Settings, action: &SlotAction) -> Result<bool> {
    let current = settings.current_profile_name.clone();
    let profile = settings
        .current_profile_mut()
        .ok_or(ConfigError::ProfileNotFound(current))?;
    match action {
        SlotAction::List => return Ok(false),
        SlotAction::Add { title } => profile.add_terminal(TerminalConfig {
            title: title.clone(),
            ..TerminalConfig::default()
        }),
        SlotAction::Remove { slot } => {
            profile.remove_terminal(slot_index(slot)?)?;
        }
        SlotAction::Up { slot } => return Ok(profile.move_terminal_up(slot_index(slot)?)?),
        SlotAction::Down { slot } => return Ok(profile.move_terminal_down(slot_index(slot)?)?),
        SlotAction::Set { slot, field, value } => {
            let index = slot_index(slot)?;
            let terminal = profile
                .terminals
                .get_mut(index)
                .ok_or(ConfigError::TerminalNotFound(index))?;
            Field::parse(field)?.apply(terminal, value)?;
        }
    }
    Ok(true)
}

fn slot_index(value: &str) -> Result<usize> {
    Ok(parse_slot_number(value)? - 1)
}

fn print_profiles(settings: &Settings) {
    for name in settings.profile_names() {
        let marker = if name == settings.current_profile_name { "*" } else { " " };
        println!("{} {}", marker, name);
    }
}

fn print_slots(settings: &Settings) {
    let Some(profile) = settings.current_profile() else {
        return;
    };
    println!("profile {}", profile.name);
    for (index, terminal) in profile.terminals.iter().enumerate() {
        println!(
            "  {}. {} | dir: {} | run: {} | build: {} | {}",
            index + 1,
            terminal.title,
            terminal.directory,
            terminal.run_command,
            terminal.build_command,
            terminal.color_scheme_id
        );
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Cyan.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
}
