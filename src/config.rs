//! Runner options for devrunner.
//!
//! This module defines the structure of the optional `devrunner.toml` file, which
//! tunes timing and output formatting. Slots and profiles live in `settings.json`
//! (see `store`); this file only holds behaviour knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::gate::DEFAULT_CONFIRM_WINDOW;
use crate::orchestrator::Timing;
use crate::runner::{RunnerOptions, DEFAULT_KILL_TIMEOUT, DEFAULT_MAX_LINES};

const OPTIONS_FILE: &str = "devrunner.toml";

/// Top-level structure of `devrunner.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Pause after stopping every slot and before starting the first one.
    pub settle_delay_ms: Option<u64>,
    /// Pause between two consecutive slot starts during run-all.
    pub inter_start_delay_ms: Option<u64>,
    /// How long a confirm gate stays armed.
    pub confirm_window_ms: Option<u64>,
    /// Upper bound on waiting for a killed process tree.
    pub kill_timeout_ms: Option<u64>,
    /// Maximum number of lines kept per slot for copying.
    pub max_lines: Option<usize>,
    /// Template for line prefixes (e.g., "[{name}]").
    pub prefix: Option<String>,
    /// Whether to colorize prefixes with the slot's color scheme.
    pub prefix_colors: Option<bool>,
    /// Whether to prepend the elapsed time to each line.
    pub timestamp: Option<bool>,
}

/// Loads and parses the options from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read options file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse options file {}", path.display()))?;
    Ok(config)
}

/// `<config dir>/devrunner/devrunner.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("devrunner").join(OPTIONS_FILE))
}

/// Effective settings after merging CLI overrides, the options file and defaults.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub timing: Timing,
    pub runner: RunnerOptions,
    pub confirm_window: Duration,
    pub prefix: Option<String>,
    pub prefix_colors: bool,
    pub timestamp: bool,
}

/// CLI values that take precedence over the options file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub settle_delay_ms: Option<u64>,
    pub inter_start_delay_ms: Option<u64>,
    pub confirm_window_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub max_lines: Option<usize>,
    pub prefix: Option<String>,
    pub no_prefix_colors: bool,
    pub timestamp: bool,
}

impl RunSettings {
    pub fn resolve(config: &Config, cli: &Overrides) -> Self {
        let defaults = Timing::default();
        let millis = |flag: Option<u64>, file: Option<u64>, default: Duration| {
            flag.or(file).map(Duration::from_millis).unwrap_or(default)
        };
        Self {
            timing: Timing {
                settle_delay: millis(cli.settle_delay_ms, config.settle_delay_ms, defaults.settle_delay),
                inter_start_delay: millis(
                    cli.inter_start_delay_ms,
                    config.inter_start_delay_ms,
                    defaults.inter_start_delay,
                ),
            },
            runner: RunnerOptions {
                kill_timeout: millis(cli.kill_timeout_ms, config.kill_timeout_ms, DEFAULT_KILL_TIMEOUT),
                max_lines: cli.max_lines.or(config.max_lines).unwrap_or(DEFAULT_MAX_LINES),
            },
            confirm_window: millis(cli.confirm_window_ms, config.confirm_window_ms, DEFAULT_CONFIRM_WINDOW),
            prefix: cli.prefix.clone().or_else(|| config.prefix.clone()),
            prefix_colors: !cli.no_prefix_colors && config.prefix_colors.unwrap_or(true),
            timestamp: cli.timestamp || config.timestamp.unwrap_or(false),
        }
    }
}
