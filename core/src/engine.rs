//! Boundary to the opaque tunneling engine.
//!
//! The engine merges profiles into configuration text and turns that text
//! into running instances. Packet processing happens entirely behind these
//! traits.

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::workspace::WorkspacePaths;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self(err.to_string())
    }
}

/// A live engine instance. Owned by the lifecycle controller; the control
/// channel only ever borrows it for request dispatch.
pub trait EngineHandle: Send + Sync {
    fn start(&self) -> Result<(), EngineError>;

    /// Must tolerate being called on an instance whose `start` failed.
    fn close(&self) -> Result<(), EngineError>;

    fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> Result<(), EngineError>;

    fn url_test(&self, group_tag: &str) -> Result<(), EngineError>;

    /// Device entered idle mode.
    fn pause(&self) {}

    fn wake(&self) {}
}

pub trait Engine: Send + Sync {
    /// One-time directory registration, run during workspace bootstrap.
    fn setup(&self, _paths: &WorkspacePaths) -> Result<(), EngineError> {
        Ok(())
    }

    /// Sends the engine's own diagnostics to `path`.
    fn redirect_stderr(&self, path: &Path) -> Result<(), EngineError>;

    /// Merges a stored profile with the JSON options overlay.
    fn build_config(&self, profile_path: &Path, options: &str) -> Result<String, EngineError>;

    /// Validates a profile without building a full configuration.
    fn check_config(&self, profile_path: &Path, temp_dir: &Path, debug: bool)
    -> Result<(), EngineError>;

    fn create(&self, config: &str) -> Result<Arc<dyn EngineHandle>, EngineError>;

    /// Installs or removes the in-process DNS transport hook.
    fn register_local_dns(&self, _enabled: bool) {}

    fn set_memory_limit(&self, _enabled: bool) {}
}
