//! Collaborator doubles that record every call into one shared journal.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use proxy_box_core::control::{ControlHandler, ControlServer, ControlServerFactory};
use proxy_box_core::platform::{NetworkMonitor, Notifier, SystemProxy, SystemProxyStatus};
use proxy_box_core::{
    Collaborators, Engine, EngineError, EngineHandle, ServiceController, ServiceSettings,
    ServiceStatus, StatusEvent, Timings, WorkspacePaths,
};
use serde_json::{Value, json};
use tempfile::TempDir;

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn last_position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().rposition(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct FakeHandle {
    pub id: u64,
    journal: Journal,
    fail_start: bool,
    gate: Option<Receiver<()>>,
    pub selected: Mutex<Vec<(String, String)>>,
}

impl EngineHandle for FakeHandle {
    fn start(&self) -> Result<(), EngineError> {
        self.journal.push(format!("start:{}", self.id));
        if let Some(gate) = &self.gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        if self.fail_start {
            return Err(EngineError::new("tun device busy"));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        self.journal.push(format!("close:{}", self.id));
        Ok(())
    }

    fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> Result<(), EngineError> {
        self.selected
            .lock()
            .unwrap()
            .push((group_tag.to_string(), outbound_tag.to_string()));
        Ok(())
    }

    fn url_test(&self, group_tag: &str) -> Result<(), EngineError> {
        self.journal.push(format!("url_test:{group_tag}"));
        Ok(())
    }

    fn pause(&self) {
        self.journal.push(format!("pause:{}", self.id));
    }

    fn wake(&self) {
        self.journal.push(format!("wake:{}", self.id));
    }
}

#[derive(Default)]
pub struct FakeEngine {
    journal: Journal,
    next_id: AtomicU64,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    gate: Mutex<Option<Receiver<()>>>,
    pub handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeEngine {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// The next handle blocks in `start` until the returned sender fires.
    pub fn gate_next_start(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn last_handle(&self) -> Option<Arc<FakeHandle>> {
        self.handles.lock().unwrap().last().cloned()
    }
}

impl Engine for FakeEngine {
    fn setup(&self, _paths: &WorkspacePaths) -> Result<(), EngineError> {
        self.journal.push("setup");
        Ok(())
    }

    fn redirect_stderr(&self, _path: &Path) -> Result<(), EngineError> {
        self.journal.push("redirect");
        Ok(())
    }

    fn build_config(&self, profile_path: &Path, _options: &str) -> Result<String, EngineError> {
        self.journal.push("build");
        Ok(fs::read_to_string(profile_path)?)
    }

    fn check_config(
        &self,
        profile_path: &Path,
        _temp: &Path,
        _debug: bool,
    ) -> Result<(), EngineError> {
        let text = fs::read_to_string(profile_path)?;
        serde_json::from_str::<Value>(&text)
            .map(|_| ())
            .map_err(|e| EngineError::new(e.to_string()))
    }

    fn create(&self, _config: &str) -> Result<Arc<dyn EngineHandle>, EngineError> {
        self.journal.push("create");
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::new("unsupported inbound"));
        }
        let handle = Arc::new(FakeHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            journal: self.journal.clone(),
            fail_start: self.fail_start.load(Ordering::SeqCst),
            gate: self.gate.lock().unwrap().take(),
            selected: Mutex::new(Vec::new()),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    fn register_local_dns(&self, enabled: bool) {
        self.journal
            .push(if enabled { "dns:on" } else { "dns:off" });
    }

    fn set_memory_limit(&self, enabled: bool) {
        self.journal.push(format!("memory:{enabled}"));
    }
}

struct FakeServer {
    path: PathBuf,
    journal: Journal,
    creates_socket: bool,
}

impl ControlServer for FakeServer {
    fn start(&self) -> io::Result<()> {
        self.journal.push("control:start");
        if self.creates_socket {
            fs::write(&self.path, b"")?;
        }
        Ok(())
    }

    fn set_service(&self, service: Option<Arc<dyn EngineHandle>>) {
        self.journal.push(if service.is_some() {
            "set_service:bound"
        } else {
            "set_service:none"
        });
    }

    fn close(&self) {
        self.journal.push("control:close");
        let _ = fs::remove_file(&self.path);
    }
}

pub struct FakeServerFactory {
    journal: Journal,
    creates_socket: bool,
}

impl ControlServerFactory for FakeServerFactory {
    fn create(
        &self,
        socket_path: &Path,
        _handler: Arc<dyn ControlHandler>,
        _read_timeout: Duration,
    ) -> io::Result<Arc<dyn ControlServer>> {
        Ok(Arc::new(FakeServer {
            path: socket_path.to_path_buf(),
            journal: self.journal.clone(),
            creates_socket: self.creates_socket,
        }))
    }
}

struct RecordingNotifier(Journal);

impl Notifier for RecordingNotifier {
    fn show(&self, _profile_name: &str, status: ServiceStatus) {
        self.0.push(format!("notify:{status}"));
    }

    fn close(&self) {
        self.0.push("notify:close");
    }
}

struct FakeMonitor(Journal);

impl NetworkMonitor for FakeMonitor {
    fn start(&self) {
        self.0.push("monitor:start");
    }

    fn stop(&self) {
        self.0.push("monitor:stop");
    }
}

struct FakeProxy;

impl SystemProxy for FakeProxy {
    fn status(&self) -> SystemProxyStatus {
        SystemProxyStatus {
            available: true,
            enabled: true,
        }
    }
}

pub fn proxy(tag: &str, server: &str) -> Value {
    json!({ "type": "shadowsocks", "tag": tag, "server": server, "server_port": 8388 })
}

pub fn usable_profile() -> Value {
    json!({
        "log": { "level": "info" },
        "outbounds": [
            proxy("hk", "hk.example.net"),
            proxy("jp", "jp.example.net"),
            { "type": "direct", "tag": "direct" },
        ],
    })
}

pub fn quick_timings() -> Timings {
    Timings {
        socket_poll_interval_ms: 5,
        socket_poll_cap_ms: 60,
        socket_ready_grace_ms: 1,
        command_read_timeout_ms: 500,
        restart_delay_ms: 10,
        reload_start_delay_ms: 1,
    }
}

pub enum ControlMode {
    /// Fake listener that creates the socket file immediately.
    Ready,
    /// Fake listener whose socket never appears.
    NeverReady,
    /// The real Unix socket server.
    Unix,
}

pub struct Harness {
    pub dir: TempDir,
    pub journal: Journal,
    pub engine: Arc<FakeEngine>,
    pub controller: Arc<ServiceController>,
    events: Receiver<StatusEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_control(ControlMode::Ready)
    }

    pub fn with_control(mode: ControlMode) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::default();
        let engine = Arc::new(FakeEngine::new(journal.clone()));

        let mut timings = quick_timings();
        let control_servers: Arc<dyn ControlServerFactory> = match mode {
            ControlMode::Ready => Arc::new(FakeServerFactory {
                journal: journal.clone(),
                creates_socket: true,
            }),
            ControlMode::NeverReady => Arc::new(FakeServerFactory {
                journal: journal.clone(),
                creates_socket: false,
            }),
            ControlMode::Unix => {
                // A real listener binds on its own thread; give it room.
                timings.socket_poll_cap_ms = 3000;
                Arc::new(proxy_box_core::control::unix::UnixControlServerFactory)
            }
        };

        let profile = dir.path().join("profile.json");
        write_json(&profile, &usable_profile());
        let settings = ServiceSettings {
            active_config_path: profile.to_string_lossy().into_owned(),
            active_profile_name: "home".into(),
            timings,
            ..ServiceSettings::default()
        };

        let controller = ServiceController::new(
            WorkspacePaths::new(dir.path().join("base"), dir.path().join("cache")),
            settings,
            Collaborators {
                engine: engine.clone(),
                control_servers,
                notifier: Arc::new(RecordingNotifier(journal.clone())),
                network_monitor: Arc::new(FakeMonitor(journal.clone())),
                system_proxy: Arc::new(FakeProxy),
            },
        );

        let (tx, events) = unbounded();
        controller.register_observer(Arc::new(tx));

        Self {
            dir,
            journal,
            engine,
            controller,
            events,
        }
    }

    pub fn profile_path(&self) -> PathBuf {
        self.dir.path().join("profile.json")
    }

    pub fn write_profile(&self, profile: &Value) {
        write_json(&self.profile_path(), profile);
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.try_iter().collect()
    }
}

pub fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn statuses(events: &[StatusEvent]) -> Vec<ServiceStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            StatusEvent::Status(status) => Some(*status),
            _ => None,
        })
        .collect()
}

pub fn alerts(events: &[StatusEvent]) -> Vec<proxy_box_core::AlertKind> {
    events
        .iter()
        .filter_map(|event| match event {
            StatusEvent::Alert(alert) => Some(alert.kind),
            _ => None,
        })
        .collect()
}
