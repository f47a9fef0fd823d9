use crate::edit::ledger::DEFAULT_UNDO_CAPACITY;
use crate::editor::EditorOptions;
use crate::net::transport::DEFAULT_MAX_FRAME;
use crate::persistence::autosave::AutosaveConfig;
use crate::session::{SessionConfig, DEFAULT_PORT};
use crate::world::sector::DEFAULT_VACANT_POOL;
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "MAPEDIT_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub name: String,
    pub port: u16,
    pub ping_interval_secs: u64,
    pub timeout_secs: u64,
    pub max_frame_len: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            name: "mapedit".to_string(),
            port: DEFAULT_PORT,
            ping_interval_secs: 10,
            timeout_secs: 30,
            max_frame_len: DEFAULT_MAX_FRAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: PathBuf,
    pub log_level: String,
    pub undo_capacity: usize,
    pub vacant_sector_pool: usize,
    /// Seconds between autosaves of the open map; 0 turns autosave off.
    pub autosave_secs: u64,
    pub session: SessionSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            log_dir: PathBuf::from("log"),
            log_level: "info".to_string(),
            undo_capacity: DEFAULT_UNDO_CAPACITY,
            vacant_sector_pool: DEFAULT_VACANT_POOL,
            autosave_secs: 0,
            session: SessionSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|err| format!("config parse failed: {err}"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| format!("config read {} failed: {err}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Builds the configuration for one run: the optional YAML file named by
    /// `--config` or `MAPEDIT_CONFIG`, then environment overrides. Returns the
    /// arguments left after removing the `--config` flag.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>), String> {
        let mut rest = Vec::with_capacity(args.len());
        let mut config_path = env_value(CONFIG_ENV).map(PathBuf::from);
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "--config" {
                let path = iter
                    .next()
                    .ok_or_else(|| "--config needs a file argument".to_string())?;
                config_path = Some(PathBuf::from(path));
            } else {
                rest.push(arg.clone());
            }
        }
        let mut config = match config_path {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(env_value)?;
        Ok((config, rest))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MAPEDIT_LOG_DIR") {
            self.log_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("MAPEDIT_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = lookup("MAPEDIT_NAME") {
            self.session.name = value;
        }
        if let Some(value) = lookup("MAPEDIT_PORT") {
            self.session.port = parse_number("MAPEDIT_PORT", &value)?;
        }
        if let Some(value) = lookup("MAPEDIT_UNDO_CAPACITY") {
            self.undo_capacity = parse_number("MAPEDIT_UNDO_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("MAPEDIT_AUTOSAVE_SECS") {
            self.autosave_secs = parse_number("MAPEDIT_AUTOSAVE_SECS", &value)?;
        }
        Ok(())
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.trim().parse().unwrap_or(LevelFilter::Info)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            name: self.session.name.clone(),
            ping_interval: Duration::from_secs(self.session.ping_interval_secs.max(1)),
            timeout: Duration::from_secs(self.session.timeout_secs.max(1)),
            max_frame: self.session.max_frame_len,
        }
    }

    pub fn editor_options(&self) -> EditorOptions {
        EditorOptions {
            undo_capacity: self.undo_capacity,
            vacant_sector_pool: self.vacant_sector_pool,
            session: self.session_config(),
            autosave: AutosaveConfig {
                interval_seconds: self.autosave_secs,
            },
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("invalid {name} '{value}'"))
}
