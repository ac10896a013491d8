//! Service settings loading and management.
//! Uses injected `AppPaths` so platform shells control where files live.

use std::fs;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::platform::AppPaths;

pub const DEFAULT_SOCKET_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SOCKET_POLL_CAP_MS: u64 = 3000;
pub const DEFAULT_SOCKET_READY_GRACE_MS: u64 = 100;
pub const DEFAULT_COMMAND_READ_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub const DEFAULT_RELOAD_START_DELAY_MS: u64 = 1000;

/// Waits used by the lifecycle. Every value is in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub socket_poll_interval_ms: u64,
    pub socket_poll_cap_ms: u64,
    pub socket_ready_grace_ms: u64,
    pub command_read_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub reload_start_delay_ms: u64,
}

impl Timings {
    pub fn socket_poll_interval(&self) -> Duration {
        Duration::from_millis(self.socket_poll_interval_ms)
    }

    pub fn socket_poll_cap(&self) -> Duration {
        Duration::from_millis(self.socket_poll_cap_ms)
    }

    pub fn socket_ready_grace(&self) -> Duration {
        Duration::from_millis(self.socket_ready_grace_ms)
    }

    pub fn command_read_timeout(&self) -> Duration {
        Duration::from_millis(self.command_read_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn reload_start_delay(&self) -> Duration {
        Duration::from_millis(self.reload_start_delay_ms)
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            socket_poll_interval_ms: DEFAULT_SOCKET_POLL_INTERVAL_MS,
            socket_poll_cap_ms: DEFAULT_SOCKET_POLL_CAP_MS,
            socket_ready_grace_ms: DEFAULT_SOCKET_READY_GRACE_MS,
            command_read_timeout_ms: DEFAULT_COMMAND_READ_TIMEOUT_MS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            reload_start_delay_ms: DEFAULT_RELOAD_START_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Profile file the engine builds its configuration from.
    pub active_config_path: String,
    pub active_profile_name: String,
    /// JSON options overlay merged into the profile at build time.
    pub config_options: String,
    /// Writes the built configuration to `working/current-config.json`.
    pub debug_mode: bool,
    pub disable_memory_limit: bool,
    /// Shells prefer a hard restart over a soft reload when set.
    pub rebuild_on_reload: bool,
    /// Engine executable used by the process-backed engine.
    pub engine_binary: String,
    /// Extra PATH entries for the engine process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub timings: Timings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            active_config_path: String::new(),
            active_profile_name: String::new(),
            config_options: "{}".to_string(),
            debug_mode: false,
            disable_memory_limit: false,
            rebuild_on_reload: false,
            engine_binary: "sing-box".to_string(),
            path: None,
            timings: Timings::default(),
        }
    }
}

impl ServiceSettings {
    /// Load settings from the provided paths. Creates a default file if missing.
    pub fn load_with(paths: &dyn AppPaths) -> Result<Self, ServiceError> {
        let config_path = paths.config_path();

        if !config_path.exists() {
            info!(
                "Settings file not found at {:?}, creating default settings",
                config_path
            );
            let defaults = Self::default();
            defaults.save_with(paths)?;
            return Ok(defaults);
        }

        debug!("Loading settings from {:?}", config_path);
        let content = fs::read_to_string(&config_path)?;
        let settings: Self = toml::from_str(&content)?;

        info!(
            "Loaded settings (profile: {:?}, debug: {})",
            settings.active_profile_name, settings.debug_mode
        );
        Ok(settings)
    }

    /// Save settings to the provided paths.
    pub fn save_with(&self, paths: &dyn AppPaths) -> Result<(), ServiceError> {
        let config_path = paths.config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        info!("Saved settings to {:?}", config_path);
        Ok(())
    }

    /// Return configured PATH or fall back to the current process PATH.
    pub fn get_path(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }
        std::env::var("PATH").unwrap_or_default()
    }
}
