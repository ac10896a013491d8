// src/app.rs
//
// Shared daemon state: settings location and the service controller wired
// to the Linux collaborators.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use proxy_box_core::control::unix::UnixControlServerFactory;
use proxy_box_core::platform::{
    AppPaths, NetworkMonitor, Notifier, SystemProxy, SystemProxyStatus,
};
use proxy_box_core::process::ProcessEngine;
use proxy_box_core::{
    Collaborators, ServiceController, ServiceSettings, ServiceStatus, WorkspacePaths,
};

use crate::paths::LinuxPaths;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Headless stand-in for the ongoing notification.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, profile_name: &str, status: ServiceStatus) {
        let profile = if profile_name.is_empty() {
            "default"
        } else {
            profile_name
        };
        info!("[{}] {}", profile, status);
    }

    fn close(&self) {
        debug!("notification cleared");
    }
}

/// The engine process watches routes itself; nothing to do here.
struct PassiveMonitor;

impl NetworkMonitor for PassiveMonitor {
    fn start(&self) {
        debug!("network monitor: engine-managed");
    }

    fn stop(&self) {}
}

/// No desktop proxy integration in the headless daemon.
struct NoSystemProxy;

impl SystemProxy for NoSystemProxy {
    fn status(&self) -> SystemProxyStatus {
        SystemProxyStatus::default()
    }
}

pub struct AppState {
    pub paths: Arc<LinuxPaths>,
    pub controller: Arc<ServiceController>,
}

impl AppState {
    pub fn new() -> Self {
        let paths = Arc::new(LinuxPaths);

        let settings = match ServiceSettings::load_with(paths.as_ref()) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load settings: {}", e);
                warn!("Using default settings");
                ServiceSettings::default()
            }
        };

        let engine = ProcessEngine::sing_box(settings.engine_binary.clone(), settings.get_path());
        let controller = ServiceController::new(
            WorkspacePaths::from_app_paths(paths.as_ref()),
            settings,
            Collaborators {
                engine: Arc::new(engine),
                control_servers: Arc::new(UnixControlServerFactory),
                notifier: Arc::new(LogNotifier),
                network_monitor: Arc::new(PassiveMonitor),
                system_proxy: Arc::new(NoSystemProxy),
            },
        );

        info!("settings at {:?}", paths.config_path());
        Self { paths, controller }
    }

    pub fn save_settings(&self) {
        if let Err(e) = self.controller.settings().save_with(self.paths.as_ref()) {
            error!("Failed to save settings: {}", e);
        }
    }

    /// Blocks until the service is down so no engine process outlives the daemon.
    pub fn cleanup(&self) {
        match self.controller.shutdown(SHUTDOWN_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => warn!("Service did not stop within {:?}", SHUTDOWN_TIMEOUT),
            Err(e) => error!("Failed to stop service: {}", e),
        }
    }
}
