//! Process-backed engine (platform-agnostic).
//! Builds configurations by merging JSON, then runs an external engine
//! binary per instance and kills it on close.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::engine::{Engine, EngineError, EngineHandle};
use crate::workspace::WorkspacePaths;

const CONFIG_PLACEHOLDER: &str = "{config}";

#[derive(Default)]
struct EngineDirs {
    temp_dir: Option<PathBuf>,
    stderr_log: Option<PathBuf>,
}

/// Runs `program args...` for every created instance, with `{config}` in the
/// arguments replaced by the instance's config file.
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
    env_path: String,
    dirs: Mutex<EngineDirs>,
    next_instance: AtomicU64,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, env_path: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env_path: env_path.into(),
            dirs: Mutex::new(EngineDirs::default()),
            next_instance: AtomicU64::new(1),
        }
    }

    /// `sing-box run -c {config}`.
    pub fn sing_box(program: impl Into<String>, env_path: impl Into<String>) -> Self {
        Self::new(
            program,
            vec!["run".into(), "-c".into(), CONFIG_PLACEHOLDER.into()],
            env_path,
        )
    }

    fn config_dir(&self) -> PathBuf {
        self.dirs
            .lock()
            .unwrap()
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn read_json(path: &Path) -> Result<Value, EngineError> {
    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::new(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| EngineError::new(format!("{} is not valid JSON: {e}", path.display())))
}

/// Objects merge key by key; anything else in the overlay replaces the base.
pub fn merge_overlay(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

impl Engine for ProcessEngine {
    fn setup(&self, paths: &WorkspacePaths) -> Result<(), EngineError> {
        self.dirs.lock().unwrap().temp_dir = Some(paths.temp_dir.clone());
        Ok(())
    }

    fn redirect_stderr(&self, path: &Path) -> Result<(), EngineError> {
        OpenOptions::new().create(true).append(true).open(path)?;
        self.dirs.lock().unwrap().stderr_log = Some(path.to_path_buf());
        debug!("Engine stderr goes to {:?}", path);
        Ok(())
    }

    fn build_config(&self, profile_path: &Path, options: &str) -> Result<String, EngineError> {
        let mut config = read_json(profile_path)?;
        let overlay: Value = serde_json::from_str(options)
            .map_err(|e| EngineError::new(format!("options are not valid JSON: {e}")))?;
        merge_overlay(&mut config, overlay);
        serde_json::to_string_pretty(&config).map_err(|e| EngineError::new(e.to_string()))
    }

    fn check_config(
        &self,
        profile_path: &Path,
        _temp_dir: &Path,
        debug: bool,
    ) -> Result<(), EngineError> {
        let config = read_json(profile_path)?;
        if !config.is_object() {
            return Err(EngineError::new("profile root must be a JSON object"));
        }
        if debug {
            debug!("Profile {:?} parsed", profile_path);
        }
        Ok(())
    }

    fn create(&self, config: &str) -> Result<Arc<dyn EngineHandle>, EngineError> {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let config_path = self.config_dir().join(format!("engine-{instance}.json"));
        fs::write(&config_path, config)?;

        let config_arg = config_path.to_string_lossy();
        let args = self
            .args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config_arg))
            .collect();

        debug!("Prepared engine instance {} at {:?}", instance, config_path);
        Ok(Arc::new(ProcessHandle {
            program: self.program.clone(),
            args,
            env_path: self.env_path.clone(),
            stderr_log: self.dirs.lock().unwrap().stderr_log.clone(),
            config_path,
            child: Mutex::new(None),
        }))
    }
}

pub struct ProcessHandle {
    program: String,
    args: Vec<String>,
    env_path: String,
    stderr_log: Option<PathBuf>,
    config_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ProcessHandle {
    fn stderr(&self) -> Stdio {
        let Some(path) = &self.stderr_log else {
            return Stdio::null();
        };
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!("Cannot open {:?} for engine output: {}", path, e);
                Stdio::null()
            }
        }
    }

    fn search_path(&self) -> String {
        match std::env::var("PATH") {
            Ok(inherited) if !inherited.is_empty() && inherited != self.env_path => {
                format!("{}:{}", self.env_path, inherited)
            }
            _ => self.env_path.clone(),
        }
    }
}

impl EngineHandle for ProcessHandle {
    fn start(&self) -> Result<(), EngineError> {
        let mut child = self.child.lock().unwrap();
        if child.is_some() {
            return Ok(());
        }

        info!("Spawning engine: {} {:?}", self.program, self.args);
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .env("PATH", self.search_path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(self.stderr())
            .spawn()
            .map_err(|e| EngineError::new(format!("failed to spawn {}: {e}", self.program)))?;

        *child = Some(spawned);
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        let result = match self.child.lock().unwrap().take() {
            Some(mut child) => {
                debug!("Stopping engine process {}", child.id());
                // Fails only if the process already exited; reap it either way.
                if let Err(e) = child.kill() {
                    debug!("Engine process already gone: {}", e);
                }
                child.wait().map(|_| ()).map_err(EngineError::from)
            }
            None => Ok(()),
        };

        if let Err(e) = fs::remove_file(&self.config_path) {
            debug!("Engine config {:?} not removed: {}", self.config_path, e);
        }
        if let Err(e) = &result {
            error!("Failed to stop engine process: {}", e);
        }
        result
    }

    fn select_outbound(&self, group_tag: &str, _outbound_tag: &str) -> Result<(), EngineError> {
        Err(EngineError::new(format!(
            "outbound selection for {group_tag:?} is not supported by the process engine"
        )))
    }

    fn url_test(&self, group_tag: &str) -> Result<(), EngineError> {
        Err(EngineError::new(format!(
            "url test for {group_tag:?} is not supported by the process engine"
        )))
    }
}
