pub mod broadcast;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod service;
pub mod status;
pub mod workspace;

pub use broadcast::{LogLine, ObserverId, StatusBroadcaster, StatusEvent, StatusObserver};
pub use config::{ServiceSettings, Timings};
pub use engine::{Engine, EngineError, EngineHandle};
pub use error::ServiceError;
pub use service::{Collaborators, ReloadMode, ServiceCommand, ServiceController};
pub use status::{AlertEvent, AlertKind, ServiceStatus};
pub use workspace::WorkspacePaths;

/// Interfaces that platform shells implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use crate::status::ServiceStatus;

    /// Trait for platform-correct workspace and settings locations.
    pub trait AppPaths {
        /// Directory that holds the `working/` subdirectory.
        fn base_dir(&self) -> std::path::PathBuf;
        /// Scratch space handed to the engine.
        fn temp_dir(&self) -> std::path::PathBuf;
        fn config_path(&self) -> std::path::PathBuf;
    }

    /// Trait for the ongoing status notification shown while the service runs.
    pub trait Notifier: Send + Sync {
        fn show(&self, profile_name: &str, status: ServiceStatus);
        fn close(&self);
    }

    /// Trait for the default-network watcher the engine relies on while running.
    /// `start` is called again on every reload and must tolerate that.
    pub trait NetworkMonitor: Send + Sync {
        fn start(&self);
        fn stop(&self);
    }

    /// Whether the host can route traffic through a system-wide HTTP proxy.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SystemProxyStatus {
        pub available: bool,
        pub enabled: bool,
    }

    /// Trait for reporting the host's system proxy capability.
    pub trait SystemProxy: Send + Sync {
        fn status(&self) -> SystemProxyStatus;
    }
}
