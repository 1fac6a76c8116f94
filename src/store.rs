//! Loading and saving `settings.json`.
//!
//! `ConfigStore::load` never fails: a missing or broken file yields the default
//! settings, and a file from before profiles existed is migrated. `save` is
//! best-effort and only logs failures.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::settings::{
    default_terminals, Profile, Settings, TerminalConfig, DEFAULT_COLOR_SCHEME,
    DEFAULT_PROFILE_NAME,
};

const APP_DIR: &str = "devrunner";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/devrunner/settings.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings, falling back to defaults on any failure.
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(err) => {
                if self.path.exists() {
                    let error = format!("{:#}", err);
                    warn!(path = %self.path.display(), %error, "discarding unreadable settings");
                } else {
                    debug!(path = %self.path.display(), "no settings file, using defaults");
                }
                Settings::with_default_profile()
            }
        }
    }

    pub fn try_load(&self) -> Result<Settings> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings file {}", self.path.display()))?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings file {}", self.path.display()))?;
        if settings.profiles.is_empty() {
            migrate_legacy(&mut settings);
            info!(path = %self.path.display(), "migrated legacy settings to profiles");
        }
        normalize(&mut settings);
        Ok(settings)
    }

    /// Writes the settings, logging instead of failing.
    pub fn save(&self, settings: &Settings) {
        if let Err(err) = self.try_save(settings) {
            let error = format!("{:#}", err);
            warn!(path = %self.path.display(), %error, "failed to save settings");
        }
    }

    pub fn try_save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(settings).context("failed to serialize settings")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Builds the `Default` profile from the flat front-end/back-end fields.
fn migrate_legacy(settings: &mut Settings) {
    let mut terminals = Vec::new();
    let legacy = [
        (
            "Front End",
            &settings.front_end_directory,
            &settings.front_end_run_command,
            &settings.front_end_build_command,
        ),
        (
            "Back End",
            &settings.back_end_directory,
            &settings.back_end_run_command,
            &settings.back_end_build_command,
        ),
    ];
    for (title, directory, run_command, build_command) in legacy {
        if directory.is_empty() && run_command.is_empty() {
            continue;
        }
        terminals.push(TerminalConfig {
            title: title.to_string(),
            directory: directory.clone(),
            run_command: run_command.clone(),
            build_command: build_command.clone(),
            color_scheme_id: DEFAULT_COLOR_SCHEME.to_string(),
        });
    }
    if terminals.is_empty() {
        terminals = default_terminals();
    }
    settings
        .profiles
        .push(Profile::new(DEFAULT_PROFILE_NAME, terminals));
    settings.current_profile_name = DEFAULT_PROFILE_NAME.to_string();
}

// Repairs hand-edited files so the profile invariants hold after load.
fn normalize(settings: &mut Settings) {
    let mut seen = Vec::new();
    settings.profiles.retain(|profile| {
        if seen.contains(&profile.name) {
            false
        } else {
            seen.push(profile.name.clone());
            true
        }
    });
    for profile in &mut settings.profiles {
        if profile.terminals.is_empty() {
            profile.terminals.push(TerminalConfig::blank(1));
        }
    }
    if settings.current_profile().is_none() {
        if let Some(first) = settings.profiles.first() {
            settings.current_profile_name = first.name.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("nested").join("settings.json"))
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = store_in(&dir).load();
        assert_eq!(settings, Settings::with_default_profile());
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let settings = ConfigStore::new(&path).load();
        assert_eq!(settings, Settings::with_default_profile());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut settings = Settings::with_default_profile();
        settings.create_profile("Staging").unwrap();
        {
            let profile = settings.current_profile_mut().unwrap();
            profile.terminals[0] = TerminalConfig {
                title: "API".into(),
                directory: "/srv/api".into(),
                run_command: "cargo run".into(),
                build_command: "cargo build --release".into(),
                color_scheme_id: "Ocean Blue".into(),
            };
            profile.add_terminal(TerminalConfig::blank(2));
        }
        store.save(&settings);
        assert!(store.path().exists());
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn migrates_back_end_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "Profiles": [],
                "BackEndDirectory": "C:\\src\\api",
                "BackEndRunCommand": "dotnet run",
                "BackEndBuildCommand": "dotnet build"
            }"#,
        )
        .unwrap();
        let settings = ConfigStore::new(&path).load();
        assert_eq!(settings.current_profile_name, "Default");
        assert_eq!(settings.profiles.len(), 1);
        let terminals = &settings.profiles[0].terminals;
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].title, "Back End");
        assert_eq!(terminals[0].directory, "C:\\src\\api");
        assert_eq!(terminals[0].build_command, "dotnet build");
    }

    #[test]
    fn migration_without_legacy_values_uses_default_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "Profiles": [], "FrontEndDirectory": "", "FrontEndRunCommand": "" }"#,
        )
        .unwrap();
        let settings = ConfigStore::new(&path).load();
        assert_eq!(settings.profiles.len(), 1);
        assert_eq!(settings.profiles[0].name, "Default");
        assert_eq!(settings.profiles[0].terminals, default_terminals());
    }

    #[test]
    fn dangling_current_profile_is_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "Profiles": [
                    { "Name": "A", "Terminals": [] },
                    { "Name": "A", "Terminals": [] },
                    { "Name": "B", "Terminals": [{ "Title": "web" }] }
                ],
                "CurrentProfileName": "Gone"
            }"#,
        )
        .unwrap();
        let settings = ConfigStore::new(&path).load();
        assert_eq!(settings.current_profile_name, "A");
        assert_eq!(settings.profile_names(), vec!["A", "B"]);
        assert_eq!(settings.profiles[0].terminals, vec![TerminalConfig::blank(1)]);
        assert_eq!(settings.profiles[1].terminals[0].color_scheme_id, "Matrix Green");
    }

    #[test]
    fn save_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let store = ConfigStore::new(blocker.join("settings.json"));
        store.save(&Settings::with_default_profile());
        assert!(store.try_save(&Settings::with_default_profile()).is_err());
    }
}
