//! Relay settings.
//!
//! Every field has a default, so an absent or partial settings file is fine.
//! The file lives at `<config_dir>/agent-relay/settings.json`:
//!
//! ```json
//! {
//!   "supervisor": { "model": "opus", "allowedTools": ["Read", "Grep"], "hangTimeoutMs": 120000 },
//!   "scheduler": { "flushDelayMs": 1500 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not find config directory")]
    NoConfigDir,
}

/// How the worker process is launched and supervised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Agent executable, resolved through `PATH`.
    pub executable: String,
    /// Arguments placed before the protocol flags (e.g. a script path when
    /// the executable is an interpreter).
    pub executable_args: Vec<String>,
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub append_system_prompt: Option<String>,
    pub permission_mode: Option<String>,
    /// `None` leaves the agent's defaults; an empty list disables all tools.
    pub allowed_tools: Option<Vec<String>>,
    /// Extra directories the agent may access besides `working_dir`.
    pub add_dirs: Vec<PathBuf>,
    pub working_dir: PathBuf,
    pub include_partial_messages: bool,
    /// Passed through verbatim after every other flag.
    pub extra_args: Vec<String>,
    /// No output for this long during a turn is treated as a hang.
    pub hang_timeout_ms: u64,
    /// No turn for this long while idle shuts the process down.
    pub idle_timeout_ms: u64,
    /// Time between the interrupt signal and the unconditional kill.
    pub kill_grace_ms: u64,
    pub max_images_per_turn: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            executable_args: Vec::new(),
            model: "sonnet".to_string(),
            fallback_model: None,
            max_budget_usd: None,
            append_system_prompt: None,
            permission_mode: None,
            allowed_tools: None,
            add_dirs: Vec::new(),
            working_dir: PathBuf::from("."),
            include_partial_messages: false,
            extra_args: Vec::new(),
            hang_timeout_ms: 5 * 60 * 1000,
            idle_timeout_ms: 30 * 60 * 1000,
            kill_grace_ms: 5_000,
            max_images_per_turn: 8,
        }
    }
}

impl SupervisorConfig {
    pub fn hang_timeout(&self) -> Duration {
        Duration::from_millis(self.hang_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Debounce windows for the display scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Initial text buffering before the first visible update.
    pub flush_delay_ms: u64,
    /// Shorter window right after a tool finishes.
    pub post_tool_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: 2_000,
            post_tool_delay_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn post_tool_delay(&self) -> Duration {
        Duration::from_millis(self.post_tool_delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
}

/// Default settings file location.
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join("agent-relay").join("settings.json"))
}

/// Load settings from the default location, falling back to defaults when the
/// file does not exist.
pub fn load_settings() -> Result<RelaySettings, SettingsError> {
    load_settings_from(&settings_path()?)
}

pub fn load_settings_from(path: &Path) -> Result<RelaySettings, SettingsError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No settings file at {}, using defaults", path.display());
            return Ok(RelaySettings::default());
        }
        Err(e) => return Err(e.into()),
    };
    let settings = serde_json::from_str(&content)?;
    log::info!("Loaded relay settings from {}", path.display());
    Ok(settings)
}
