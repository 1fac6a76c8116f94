//! Persisted profile model.
//!
//! `Settings` is the aggregate written to `settings.json`: an ordered set of
//! profiles, the name of the current one, and the flat front-end/back-end fields
//! of the pre-profile layout. Key names follow the file format of earlier
//! releases so existing files keep loading.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PROFILE_NAME: &str = "Default";
pub const DEFAULT_COLOR_SCHEME: &str = "Matrix Green";

/// A slot template with static fields, used for built-in layouts.
#[derive(Debug, Clone, Copy)]
pub struct SlotTemplate {
    pub title: &'static str,
    pub directory: &'static str,
    pub run_command: &'static str,
    pub build_command: &'static str,
}

impl SlotTemplate {
    pub fn to_config(&self) -> TerminalConfig {
        TerminalConfig {
            title: self.title.to_string(),
            directory: self.directory.to_string(),
            run_command: self.run_command.to_string(),
            build_command: self.build_command.to_string(),
            color_scheme_id: DEFAULT_COLOR_SCHEME.to_string(),
        }
    }
}

/// The two example slots of a fresh install.
pub const DEFAULT_LAYOUT: [SlotTemplate; 2] = [
    SlotTemplate {
        title: "Front End",
        directory: "",
        run_command: "npm start",
        build_command: "npm run build",
    },
    SlotTemplate {
        title: "Back End",
        directory: "",
        run_command: "dotnet run",
        build_command: "dotnet build",
    },
];

pub fn default_terminals() -> Vec<TerminalConfig> {
    DEFAULT_LAYOUT.iter().map(SlotTemplate::to_config).collect()
}

/// Built-in colour schemes and their title colour.
pub const COLOR_SCHEMES: [(&str, (u8, u8, u8)); 8] = [
    ("Matrix Green", (100, 255, 150)),
    ("Ocean Blue", (120, 200, 255)),
    ("Amber Terminal", (255, 200, 100)),
    ("Purple Haze", (200, 150, 255)),
    ("Ruby Red", (255, 140, 140)),
    ("Cyberpunk Pink", (255, 100, 220)),
    ("Arctic Frost", (150, 230, 255)),
    ("Golden Sunset", (255, 215, 120)),
];

/// Looks up a scheme by name, ignoring case.
pub fn scheme_color(name: &str) -> Option<(u8, u8, u8)> {
    COLOR_SCHEMES
        .iter()
        .find(|(scheme, _)| scheme.eq_ignore_ascii_case(name.trim()))
        .map(|(_, rgb)| *rgb)
}

/// Canonical spelling of a scheme name.
pub fn canonical_scheme(name: &str) -> Option<&'static str> {
    COLOR_SCHEMES
        .iter()
        .find(|(scheme, _)| scheme.eq_ignore_ascii_case(name.trim()))
        .map(|(scheme, _)| *scheme)
}

/// Rejected profile or slot edits. Nothing is mutated when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("profile name cannot be empty")]
    EmptyName,
    #[error("a profile named '{0}' already exists")]
    DuplicateName(String),
    #[error("cannot delete the last profile")]
    LastProfile,
    #[error("no profile named '{0}'")]
    ProfileNotFound(String),
    #[error("cannot remove the last terminal")]
    LastTerminal,
    #[error("no terminal at position {0}")]
    TerminalNotFound(usize),
}

/// One slot: a working directory with its run and build commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TerminalConfig {
    pub title: String,
    pub directory: String,
    pub run_command: String,
    pub build_command: String,
    #[serde(rename = "ColorScheme")]
    pub color_scheme_id: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            title: "Terminal".to_string(),
            directory: String::new(),
            run_command: String::new(),
            build_command: String::new(),
            color_scheme_id: DEFAULT_COLOR_SCHEME.to_string(),
        }
    }
}

impl TerminalConfig {
    /// An empty slot titled `Terminal {n}`.
    pub fn blank(n: usize) -> Self {
        Self {
            title: format!("Terminal {}", n),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Profile {
    pub name: String,
    pub terminals: Vec<TerminalConfig>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
            terminals: Vec::new(),
        }
    }
}

impl Profile {
    pub fn new(name: impl Into<String>, terminals: Vec<TerminalConfig>) -> Self {
        Self {
            name: name.into(),
            terminals,
        }
    }

    pub fn add_terminal(&mut self, terminal: TerminalConfig) {
        self.terminals.push(terminal);
    }

    pub fn remove_terminal(&mut self, index: usize) -> Result<TerminalConfig, ConfigError> {
        if index >= self.terminals.len() {
            return Err(ConfigError::TerminalNotFound(index));
        }
        if self.terminals.len() <= 1 {
            return Err(ConfigError::LastTerminal);
        }
        Ok(self.terminals.remove(index))
    }

    /// Swaps the terminal with its predecessor. Returns `false` if already first.
    pub fn move_terminal_up(&mut self, index: usize) -> Result<bool, ConfigError> {
        if index >= self.terminals.len() {
            return Err(ConfigError::TerminalNotFound(index));
        }
        if index == 0 {
            return Ok(false);
        }
        self.terminals.swap(index - 1, index);
        Ok(true)
    }

    /// Swaps the terminal with its successor. Returns `false` if already last.
    pub fn move_terminal_down(&mut self, index: usize) -> Result<bool, ConfigError> {
        if index >= self.terminals.len() {
            return Err(ConfigError::TerminalNotFound(index));
        }
        if index + 1 == self.terminals.len() {
            return Ok(false);
        }
        self.terminals.swap(index, index + 1);
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub profiles: Vec<Profile>,
    pub current_profile_name: String,

    // Pre-profile layout. Only read when `profiles` is empty.
    pub front_end_directory: String,
    pub front_end_run_command: String,
    pub front_end_build_command: String,
    pub back_end_directory: String,
    pub back_end_run_command: String,
    pub back_end_build_command: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            current_profile_name: DEFAULT_PROFILE_NAME.to_string(),
            front_end_directory: String::new(),
            front_end_run_command: String::new(),
            front_end_build_command: String::new(),
            back_end_directory: String::new(),
            back_end_run_command: String::new(),
            back_end_build_command: String::new(),
        }
    }
}

impl Settings {
    /// Settings of a fresh install: one `Default` profile with the example layout.
    pub fn with_default_profile() -> Self {
        Self {
            profiles: vec![Profile::new(DEFAULT_PROFILE_NAME, default_terminals())],
            ..Self::default()
        }
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn current_profile(&self) -> Option<&Profile> {
        self.profile(&self.current_profile_name)
    }

    pub fn current_profile_mut(&mut self) -> Option<&mut Profile> {
        let name = self.current_profile_name.clone();
        self.profiles.iter_mut().find(|p| p.name == name)
    }

    pub fn select_profile(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.profile(name).is_none() {
            return Err(ConfigError::ProfileNotFound(name.to_string()));
        }
        self.current_profile_name = name.to_string();
        Ok(())
    }

    /// Adds a profile with one blank terminal and makes it current.
    pub fn create_profile(&mut self, name: &str) -> Result<(), ConfigError> {
        let name = self.check_new_name(name)?;
        self.profiles
            .push(Profile::new(name.clone(), vec![TerminalConfig::blank(1)]));
        self.current_profile_name = name;
        Ok(())
    }

    /// Copies `source`'s terminals into a new profile and makes it current.
    pub fn duplicate_profile(&mut self, source: &str, name: &str) -> Result<(), ConfigError> {
        let terminals = self
            .profile(source)
            .ok_or_else(|| ConfigError::ProfileNotFound(source.to_string()))?
            .terminals
            .clone();
        let name = self.check_new_name(name)?;
        self.profiles.push(Profile::new(name.clone(), terminals));
        self.current_profile_name = name;
        Ok(())
    }

    pub fn rename_profile(&mut self, old: &str, new: &str) -> Result<(), ConfigError> {
        let Some(index) = self.profiles.iter().position(|p| p.name == old) else {
            return Err(ConfigError::ProfileNotFound(old.to_string()));
        };
        let new = new.trim();
        if new == old {
            return Ok(());
        }
        let new = self.check_new_name(new)?;
        if self.current_profile_name == old {
            self.current_profile_name = new.clone();
        }
        self.profiles[index].name = new;
        Ok(())
    }

    /// Removes a profile. When it was current, the first remaining profile becomes current.
    pub fn delete_profile(&mut self, name: &str) -> Result<Profile, ConfigError> {
        let Some(index) = self.profiles.iter().position(|p| p.name == name) else {
            return Err(ConfigError::ProfileNotFound(name.to_string()));
        };
        if self.profiles.len() <= 1 {
            return Err(ConfigError::LastProfile);
        }
        let removed = self.profiles.remove(index);
        if self.current_profile_name == removed.name {
            self.current_profile_name = self.profiles[0].name.clone();
        }
        Ok(removed)
    }

    fn check_new_name(&self, name: &str) -> Result<String, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.profile(name).is_some() {
            return Err(ConfigError::DuplicateName(name.to_string()));
        }
        Ok(name.to_string())
    }
}
