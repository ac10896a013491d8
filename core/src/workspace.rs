//! One-time workspace bootstrap: directories, permissions, stale socket
//! cleanup and engine log redirection.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use crate::engine::Engine;
use crate::error::ServiceError;
use crate::platform::AppPaths;

pub const WORKING_DIR_NAME: &str = "working";
pub const SOCKET_FILE_NAME: &str = "command.sock";
pub const STDERR_LOG_FILE_NAME: &str = "stderr.log";
pub const CONFIG_SNAPSHOT_FILE_NAME: &str = "current-config.json";

const WORKING_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub base_dir: PathBuf,
    pub working_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(base_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            working_dir: base_dir.join(WORKING_DIR_NAME),
            base_dir,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn from_app_paths(paths: &dyn AppPaths) -> Self {
        Self::new(paths.base_dir(), paths.temp_dir())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.working_dir.join(SOCKET_FILE_NAME)
    }

    pub fn stderr_log_path(&self) -> PathBuf {
        self.working_dir.join(STDERR_LOG_FILE_NAME)
    }

    pub fn config_snapshot_path(&self) -> PathBuf {
        self.working_dir.join(CONFIG_SNAPSHOT_FILE_NAME)
    }
}

/// Owns the resolved paths and the once-per-process bootstrap flag.
#[derive(Debug)]
pub struct Workspace {
    paths: WorkspacePaths,
    initialized: AtomicBool,
}

impl Workspace {
    pub fn new(paths: WorkspacePaths) -> Self {
        Self {
            paths,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Bootstraps the workspace unless a previous call already did.
    /// Returns `true` when this call performed the bootstrap.
    pub fn ensure_initialized(&self, engine: &dyn Engine) -> Result<bool, ServiceError> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        if let Err(err) = bootstrap(&self.paths, engine) {
            // Let the next start retry from scratch.
            self.initialized.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(true)
    }
}

fn bootstrap(paths: &WorkspacePaths, engine: &dyn Engine) -> Result<(), ServiceError> {
    for dir in [&paths.base_dir, &paths.working_dir, &paths.temp_dir] {
        create_dir(dir)?;
    }

    fs::set_permissions(
        &paths.working_dir,
        fs::Permissions::from_mode(WORKING_DIR_MODE),
    )
    .map_err(|source| ServiceError::Bootstrap {
        path: paths.working_dir.clone(),
        source,
    })?;

    let socket = paths.socket_path();
    if socket.exists() {
        match fs::remove_file(&socket) {
            Ok(()) => debug!("Deleted stale control socket {:?}", socket),
            Err(e) => warn!("Failed to delete stale control socket {:?}: {}", socket, e),
        }
    }

    debug!("base dir: {:?}", paths.base_dir);
    debug!("working dir: {:?}", paths.working_dir);
    debug!("temp dir: {:?}", paths.temp_dir);

    if let Err(e) = engine.setup(paths) {
        warn!("Engine setup failed, continuing: {}", e);
    }
    if let Err(e) = engine.redirect_stderr(&paths.stderr_log_path()) {
        warn!("Failed to redirect engine diagnostics: {}", e);
    }

    info!("Workspace ready at {:?}", paths.working_dir);
    Ok(())
}

fn create_dir(dir: &Path) -> Result<(), ServiceError> {
    fs::create_dir_all(dir).map_err(|source| ServiceError::Bootstrap {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineHandle};
    use std::sync::Arc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SetupCounter {
        setups: Mutex<usize>,
        redirected: Mutex<Option<PathBuf>>,
    }

    impl Engine for SetupCounter {
        fn setup(&self, _paths: &WorkspacePaths) -> Result<(), EngineError> {
            *self.setups.lock().unwrap() += 1;
            Ok(())
        }

        fn redirect_stderr(&self, path: &Path) -> Result<(), EngineError> {
            *self.redirected.lock().unwrap() = Some(path.to_path_buf());
            Ok(())
        }

        fn build_config(&self, _: &Path, _: &str) -> Result<String, EngineError> {
            unreachable!()
        }

        fn check_config(&self, _: &Path, _: &Path, _: bool) -> Result<(), EngineError> {
            unreachable!()
        }

        fn create(&self, _: &str) -> Result<Arc<dyn EngineHandle>, EngineError> {
            unreachable!()
        }
    }

    #[test]
    fn layout_hangs_off_the_base_dir() {
        let paths = WorkspacePaths::new("/data/app", "/cache/app");
        assert_eq!(paths.working_dir, PathBuf::from("/data/app/working"));
        assert_eq!(
            paths.socket_path(),
            PathBuf::from("/data/app/working/command.sock")
        );
        assert_eq!(
            paths.stderr_log_path(),
            PathBuf::from("/data/app/working/stderr.log")
        );
    }

    #[test]
    fn bootstrap_creates_directories_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path().join("base"), dir.path().join("cache"));
        let workspace = Workspace::new(paths.clone());
        let engine = SetupCounter::default();

        assert!(workspace.ensure_initialized(&engine).unwrap());
        assert!(!workspace.ensure_initialized(&engine).unwrap());

        assert!(paths.working_dir.is_dir());
        assert!(paths.temp_dir.is_dir());
        assert_eq!(*engine.setups.lock().unwrap(), 1);
        assert_eq!(
            engine.redirected.lock().unwrap().as_deref(),
            Some(paths.stderr_log_path().as_path())
        );
        let mode = fs::metadata(&paths.working_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, WORKING_DIR_MODE);
    }

    #[test]
    fn stale_socket_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(dir.path().join("base"), dir.path().join("cache"));
        fs::create_dir_all(&paths.working_dir).unwrap();
        fs::write(paths.socket_path(), b"").unwrap();

        Workspace::new(paths.clone())
            .ensure_initialized(&SetupCounter::default())
            .unwrap();

        assert!(!paths.socket_path().exists());
    }

    #[test]
    fn unusable_base_dir_is_a_bootstrap_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"not a directory").unwrap();
        let workspace = Workspace::new(WorkspacePaths::new(
            blocker.join("base"),
            dir.path().join("cache"),
        ));

        let err = workspace
            .ensure_initialized(&SetupCounter::default())
            .unwrap_err();

        assert!(matches!(err, ServiceError::Bootstrap { .. }));
        assert!(!workspace.is_initialized());
    }
}
