//! Error taxonomy for the service lifecycle.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::status::{AlertKind, ServiceStatus};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to prepare {}: {source}", path.display())]
    Bootstrap {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("control server failed to start: {0}")]
    StartCommandServer(#[source] io::Error),

    #[error("empty configuration: {0}")]
    EmptyConfiguration(String),

    #[error("failed to build configuration: {0}")]
    ConfigBuild(String),

    #[error("configuration has no usable outbound: {0}")]
    ConfigInvalid(String),

    #[error("failed to create service: {0}")]
    CreateService(#[source] EngineError),

    #[error("failed to start service: {0}")]
    StartService(#[source] EngineError),

    #[error("service is not started (status: {0})")]
    NotStarted(ServiceStatus),

    #[error("control request failed: {0}")]
    Control(String),

    #[error("start was discarded by a concurrent stop")]
    Cancelled,

    #[error("invalid settings file: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("failed to encode settings: {0}")]
    SettingsEncode(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServiceError {
    /// The alert observers receive when this error aborts a start attempt.
    /// Errors that never abort a start map to `None`.
    pub fn alert_kind(&self) -> Option<AlertKind> {
        match self {
            Self::Bootstrap { .. } | Self::StartCommandServer(_) => {
                Some(AlertKind::StartCommandServer)
            }
            Self::EmptyConfiguration(_) | Self::ConfigBuild(_) => {
                Some(AlertKind::EmptyConfiguration)
            }
            Self::ConfigInvalid(_) => Some(AlertKind::ConfigInvalid),
            Self::CreateService(_) => Some(AlertKind::CreateService),
            Self::StartService(_) => Some(AlertKind::StartService),
            Self::NotStarted(_)
            | Self::Control(_)
            | Self::Cancelled
            | Self::Settings(_)
            | Self::SettingsEncode(_)
            | Self::Io(_) => None,
        }
    }
}
