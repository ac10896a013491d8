//! Service lifecycle controller (platform-agnostic).
//!
//! Owns the status value, the engine session and the control channel, and
//! sequences start, stop, reload and teardown. Each external trigger may run
//! on its own thread; every transition into or out of `Starting` happens
//! under the session lock and bumps a generation counter, so a start that
//! loses a race against `stop` notices at its commit point and backs out.

use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{Level, debug, error, info, log, warn};

use crate::broadcast::{ObserverId, StatusBroadcaster, StatusObserver};
use crate::config::ServiceSettings;
use crate::control::protocol::{ControlRequest, ControlResponse};
use crate::control::{ChannelState, ControlChannel, ControlHandler, ControlServerFactory};
use crate::engine::{Engine, EngineHandle};
use crate::error::ServiceError;
use crate::pipeline::{self, BuiltConfig, ProfileConfig};
use crate::platform::{NetworkMonitor, Notifier, SystemProxy, SystemProxyStatus};
use crate::status::{ServiceStatus, StatusCell};
use crate::workspace::{Workspace, WorkspacePaths};

const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Everything the controller drives but does not implement itself.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn Engine>,
    pub control_servers: Arc<dyn ControlServerFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub network_monitor: Arc<dyn NetworkMonitor>,
    pub system_proxy: Arc<dyn SystemProxy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    /// Recreate the engine handle only; the control listener is reused.
    Soft,
    /// Full stop, a delay, then a full start.
    Hard,
}

/// Typed commands for the controller's single-consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    Stop,
    Reload,
    IdleModeChanged(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Reload,
    Full,
}

struct EngineSession {
    id: u64,
    handle: Arc<dyn EngineHandle>,
}

#[derive(Default)]
struct Session {
    engine: Option<EngineSession>,
    tun_fd: Option<OwnedFd>,
    generation: u64,
}

pub struct ServiceController {
    me: Weak<ServiceController>,
    workspace: Workspace,
    settings: RwLock<ServiceSettings>,
    status: StatusCell,
    broadcaster: StatusBroadcaster,
    control: ControlChannel,
    deps: Collaborators,
    session: Mutex<Session>,
    next_session_id: AtomicU64,
    receiver_registered: AtomicBool,
    started_by_user: AtomicBool,
    commands: Sender<ServiceCommand>,
}

impl ServiceController {
    /// Builds the controller and spawns its command loop.
    pub fn new(
        paths: WorkspacePaths,
        settings: ServiceSettings,
        deps: Collaborators,
    ) -> Arc<Self> {
        let (commands_tx, commands_rx) = unbounded();
        let controller = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            control: ControlChannel::new(deps.control_servers.clone(), paths.socket_path()),
            workspace: Workspace::new(paths),
            settings: RwLock::new(settings),
            status: StatusCell::new(),
            broadcaster: StatusBroadcaster::new(),
            deps,
            session: Mutex::new(Session::default()),
            next_session_id: AtomicU64::new(1),
            receiver_registered: AtomicBool::new(false),
            started_by_user: AtomicBool::new(false),
            commands: commands_tx,
        });

        let weak = Arc::downgrade(&controller);
        if let Err(e) = thread::Builder::new()
            .name("service-commands".into())
            .spawn(move || run_command_loop(weak, commands_rx))
        {
            error!("Failed to spawn command loop: {}", e);
        }
        controller
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn register_observer(&self, observer: Arc<dyn StatusObserver>) -> ObserverId {
        self.broadcaster.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.broadcaster.unregister(id)
    }

    pub fn settings(&self) -> ServiceSettings {
        self.settings.read().unwrap().clone()
    }

    /// Changes are picked up by the next start or reload.
    pub fn update_settings(&self, update: impl FnOnce(&mut ServiceSettings)) {
        update(&mut self.settings.write().unwrap());
    }

    pub fn set_active_profile(&self, path: impl Into<String>, name: impl Into<String>) {
        let (path, name) = (path.into(), name.into());
        self.update_settings(|settings| {
            settings.active_config_path = path;
            settings.active_profile_name = name;
        });
    }

    pub fn set_config_options(&self, options: impl Into<String>) {
        let options = options.into();
        self.update_settings(|settings| settings.config_options = options);
    }

    pub fn workspace_paths(&self) -> &WorkspacePaths {
        self.workspace.paths()
    }

    pub fn control_state(&self) -> ChannelState {
        self.control.state()
    }

    /// Identifies the live engine handle; changes on every start and reload.
    pub fn session_id(&self) -> Option<u64> {
        self.lock_session().engine.as_ref().map(|engine| engine.id)
    }

    pub fn started_by_user(&self) -> bool {
        self.started_by_user.load(Ordering::SeqCst)
    }

    pub fn post(&self, command: ServiceCommand) {
        if self.commands.send(command).is_err() {
            warn!("Command loop is gone, dropping {:?}", command);
        }
    }

    /// Hands the session an owned descriptor (the TUN device) that is closed
    /// on the next teardown.
    pub fn attach_tun_fd(&self, fd: OwnedFd) {
        if self.lock_session().tun_fd.replace(fd).is_some() {
            debug!("Replaced previous session file descriptor");
        }
    }

    pub fn write_log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log!(level, "{}", message);
        self.broadcaster.log(level, message);
    }

    pub fn start(&self) -> Result<(), ServiceError> {
        let generation = {
            let mut session = self.lock_session();
            if let Err(current) = self
                .status
                .transition(ServiceStatus::Stopped, ServiceStatus::Starting)
            {
                debug!("Start ignored, service is {}", current);
                return Ok(());
            }
            self.broadcaster.status(ServiceStatus::Starting);
            session.generation += 1;
            session.generation
        };

        if !self.receiver_registered.swap(true, Ordering::SeqCst) {
            debug!("Command receiver registered");
        }
        self.started_by_user.store(true, Ordering::SeqCst);

        let settings = self.settings();
        info!("Starting service (profile: {:?})", settings.active_profile_name);
        self.deps
            .notifier
            .show(&settings.active_profile_name, ServiceStatus::Starting);

        if let Err(err) = self.bootstrap(&settings) {
            return self.abort_start(generation, err);
        }
        self.start_service(generation, &settings, false)
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        {
            let mut session = self.lock_session();
            match self.status.get() {
                ServiceStatus::Started => self.publish(&session, ServiceStatus::Stopping),
                ServiceStatus::Starting => {
                    session.generation += 1;
                    info!("Stop requested while starting, discarding the start attempt");
                    return Ok(());
                }
                other => {
                    debug!("Stop ignored, service is {}", other);
                    return Ok(());
                }
            }
        }

        {
            let mut session = self.lock_session();
            self.teardown(&mut session, Teardown::Full);
            self.publish(&session, ServiceStatus::Stopped);
        }
        info!("Service stopped");
        Ok(())
    }

    /// Stops the service and waits for a start that is still in flight to
    /// back out. Returns `false` if it has not settled in `Stopped` by `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> Result<bool, ServiceError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.stop()?;
            if self.status() == ServiceStatus::Stopped {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!("Service still {} after {:?}", self.status(), timeout);
                return Ok(false);
            }
            thread::sleep(SHUTDOWN_POLL);
        }
    }

    pub fn reload(&self) -> Result<(), ServiceError> {
        self.reload_with(ReloadMode::Soft)
    }

    pub fn reload_with(&self, mode: ReloadMode) -> Result<(), ServiceError> {
        match mode {
            ReloadMode::Soft => self.soft_reload(),
            ReloadMode::Hard => self.restart(),
        }
    }

    /// Full stop, `restart_delay`, full start. No-op unless started.
    pub fn restart(&self) -> Result<(), ServiceError> {
        let status = self.status();
        if status != ServiceStatus::Started {
            debug!("Restart ignored, service is {}", status);
            return Ok(());
        }
        self.stop()?;
        thread::sleep(self.settings().timings.restart_delay());
        self.start()
    }

    /// The platform reads the new proxy setting itself; the engine only
    /// needs to be rebuilt.
    pub fn set_system_proxy_enabled(&self, enabled: bool) -> Result<(), ServiceError> {
        info!("System proxy {}", if enabled { "enabled" } else { "disabled" });
        self.reload()
    }

    pub fn system_proxy_status(&self) -> SystemProxyStatus {
        self.deps.system_proxy.status()
    }

    pub fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> Result<(), ServiceError> {
        self.require_started()?;
        self.control_request(&ControlRequest::SelectOutbound {
            group_tag: group_tag.to_string(),
            outbound_tag: outbound_tag.to_string(),
        })
    }

    pub fn url_test(&self, group_tag: &str) -> Result<(), ServiceError> {
        self.require_started()?;
        self.control_request(&ControlRequest::UrlTest {
            group_tag: group_tag.to_string(),
        })
    }

    pub fn clear_logs(&self) -> Result<(), ServiceError> {
        self.require_started()?;
        self.broadcaster.reset_logs();
        Ok(())
    }

    /// Pauses the engine while the device idles and wakes it afterwards.
    pub fn update_idle_mode(&self, idle: bool) {
        if self.status() != ServiceStatus::Started {
            return;
        }
        let handle = self
            .lock_session()
            .engine
            .as_ref()
            .map(|engine| engine.handle.clone());
        match handle {
            Some(handle) if idle => {
                debug!("Device idle, pausing engine");
                handle.pause();
            }
            Some(handle) => {
                debug!("Device active, waking engine");
                handle.wake();
            }
            None => {}
        }
    }

    /// Checks a profile. Returns an empty string when it is valid, otherwise
    /// the engine's message.
    pub fn parse_config(&self, profile_path: &Path, debug: bool) -> String {
        match self.deps.engine.check_config(
            profile_path,
            &self.workspace.paths().temp_dir,
            debug,
        ) {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        }
    }

    /// Builds the filtered configuration for `profile_path` using the stored
    /// options overlay.
    pub fn generate_config(&self, profile_path: &str) -> Result<String, ServiceError> {
        let options = self.settings.read().unwrap().config_options.clone();
        let profile = ProfileConfig::new(profile_path, options);
        pipeline::build_filtered(self.deps.engine.as_ref(), &profile).map(BuiltConfig::into_text)
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap()
    }

    /// Every status change goes through the session lock, and observers hear
    /// about it before the lock is released, so they see changes in order.
    fn publish(&self, _session: &Session, status: ServiceStatus) {
        self.status.set(status);
        self.broadcaster.status(status);
    }

    fn require_started(&self) -> Result<(), ServiceError> {
        match self.status() {
            ServiceStatus::Started => Ok(()),
            other => Err(ServiceError::NotStarted(other)),
        }
    }

    fn control_request(&self, request: &ControlRequest) -> Result<(), ServiceError> {
        match self.control.dispatch(request) {
            ControlResponse::Ok(_) => Ok(()),
            ControlResponse::Error(message) => Err(ServiceError::Control(message)),
        }
    }

    fn handler(&self) -> Arc<dyn ControlHandler> {
        Arc::new(ControllerLink(self.me.clone()))
    }

    fn preferred_reload_mode(&self) -> ReloadMode {
        if self.settings.read().unwrap().rebuild_on_reload {
            ReloadMode::Hard
        } else {
            ReloadMode::Soft
        }
    }

    fn bootstrap(&self, settings: &ServiceSettings) -> Result<(), ServiceError> {
        if self.workspace.ensure_initialized(self.deps.engine.as_ref())? {
            debug!("Workspace bootstrapped");
        }

        match self.control.start(self.handler(), &settings.timings)? {
            ChannelState::Failed => self.write_log(
                Level::Warn,
                "Control socket did not become ready, continuing without live control",
            ),
            state => debug!("Control channel {:?}", state),
        }
        Ok(())
    }

    fn prepare_config(&self, settings: &ServiceSettings) -> Result<BuiltConfig, ServiceError> {
        let profile = ProfileConfig::new(
            settings.active_config_path.as_str(),
            settings.config_options.as_str(),
        );
        let config = pipeline::build_filtered(self.deps.engine.as_ref(), &profile)?;

        if settings.debug_mode {
            let snapshot = self.workspace.paths().config_snapshot_path();
            match pipeline::write_snapshot(&config, &snapshot) {
                Ok(()) => debug!("Wrote configuration snapshot to {:?}", snapshot),
                Err(e) => warn!("Failed to write configuration snapshot: {}", e),
            }
        }
        Ok(config)
    }

    /// Config pipeline onwards. Shared by start and soft reload.
    fn start_service(
        &self,
        generation: u64,
        settings: &ServiceSettings,
        reloading: bool,
    ) -> Result<(), ServiceError> {
        let config = match self.prepare_config(settings) {
            Ok(config) => config,
            Err(err) => return self.abort_start(generation, err),
        };

        self.deps
            .notifier
            .show(&settings.active_profile_name, ServiceStatus::Starting);
        self.broadcaster.reset_logs();

        self.deps.network_monitor.start();
        self.deps.engine.register_local_dns(true);
        self.deps
            .engine
            .set_memory_limit(!settings.disable_memory_limit);

        let handle = match self.deps.engine.create(config.as_str()) {
            Ok(handle) => handle,
            Err(e) => return self.abort_start(generation, ServiceError::CreateService(e)),
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let stale = {
            let mut session = self.lock_session();
            session.engine = Some(EngineSession {
                id: session_id,
                handle: handle.clone(),
            });
            session.generation != generation
        };
        if stale {
            return self.abort_start(generation, ServiceError::Cancelled);
        }

        if reloading {
            thread::sleep(settings.timings.reload_start_delay());
        }

        if let Err(e) = handle.start() {
            return self.abort_start(generation, ServiceError::StartService(e));
        }

        {
            let session = self.lock_session();
            if session.generation != generation {
                drop(session);
                return self.abort_start(generation, ServiceError::Cancelled);
            }
            self.control.set_service(Some(handle));
            self.publish(&session, ServiceStatus::Started);
        }

        self.deps
            .notifier
            .show(&settings.active_profile_name, ServiceStatus::Started);
        info!("Service started (session {})", session_id);
        Ok(())
    }

    /// Releases everything the attempt acquired and settles in `Stopped`.
    /// Superseded attempts report `Cancelled` and raise no alert.
    fn abort_start(&self, generation: u64, err: ServiceError) -> Result<(), ServiceError> {
        let superseded = {
            let mut session = self.lock_session();
            let superseded = session.generation != generation;
            self.teardown(&mut session, Teardown::Full);
            self.publish(&session, ServiceStatus::Stopped);
            superseded
        };

        if superseded || matches!(err, ServiceError::Cancelled) {
            info!("Start attempt discarded by a concurrent stop");
            return Err(ServiceError::Cancelled);
        }

        error!("Start failed: {}", err);
        if let Some(kind) = err.alert_kind() {
            self.broadcaster.alert(kind, Some(err.to_string()));
        }
        Err(err)
    }

    fn soft_reload(&self) -> Result<(), ServiceError> {
        let generation = {
            let mut session = self.lock_session();
            if let Err(current) = self
                .status
                .transition(ServiceStatus::Started, ServiceStatus::Starting)
            {
                debug!("Reload ignored, service is {}", current);
                return Ok(());
            }
            self.broadcaster.status(ServiceStatus::Starting);
            info!("Reloading service");
            session.generation += 1;
            self.teardown(&mut session, Teardown::Reload);
            session.generation
        };

        let settings = self.settings();
        self.start_service(generation, &settings, true)
    }

    /// Step failures are logged and never stop later steps.
    fn teardown(&self, session: &mut Session, kind: Teardown) {
        if kind == Teardown::Full && self.receiver_registered.swap(false, Ordering::SeqCst) {
            debug!("Command receiver unregistered");
        }

        self.deps.notifier.close();

        if let Some(fd) = session.tun_fd.take() {
            drop(fd);
            debug!("Closed session file descriptor");
        }

        // Unbind first so no control request lands in a closing handle.
        self.control.set_service(None);

        if let Some(engine) = &session.engine {
            if let Err(e) = engine.handle.close() {
                warn!("Failed to close engine session {}: {}", engine.id, e);
            }
        }
        session.engine = None;

        if kind == Teardown::Full {
            self.deps.engine.register_local_dns(false);
            self.deps.network_monitor.stop();
            self.control.close();
            self.started_by_user.store(false, Ordering::SeqCst);
        }
    }

    fn handle_command(&self, command: ServiceCommand) {
        if !self.receiver_registered.load(Ordering::SeqCst) {
            debug!("Receiver not registered, dropping {:?}", command);
            return;
        }
        let result = match command {
            ServiceCommand::Stop => self.stop(),
            ServiceCommand::Reload => self.reload_with(self.preferred_reload_mode()),
            ServiceCommand::IdleModeChanged(idle) => {
                self.update_idle_mode(idle);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("{:?} failed: {}", command, e);
        }
    }
}

fn run_command_loop(controller: Weak<ServiceController>, commands: Receiver<ServiceCommand>) {
    for command in commands.iter() {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_command(command);
    }
    debug!("Command loop exited");
}

/// The control server's view of the controller. Lifecycle work is posted
/// to the command loop and never runs on the listener thread.
struct ControllerLink(Weak<ServiceController>);

impl ControlHandler for ControllerLink {
    fn service_reload(&self) {
        if let Some(controller) = self.0.upgrade() {
            controller.post(ServiceCommand::Reload);
        }
    }

    fn service_status(&self) -> ServiceStatus {
        self.0
            .upgrade()
            .map_or(ServiceStatus::Stopped, |controller| controller.status())
    }

    fn system_proxy_status(&self) -> SystemProxyStatus {
        self.0
            .upgrade()
            .map(|controller| controller.system_proxy_status())
            .unwrap_or_default()
    }

    fn set_system_proxy_enabled(&self, enabled: bool) {
        if let Some(controller) = self.0.upgrade() {
            let state = if enabled { "enabled" } else { "disabled" };
            info!("System proxy {} over control socket", state);
            controller.post(ServiceCommand::Reload);
        }
    }

    fn clear_logs(&self) {
        if let Some(controller) = self.0.upgrade() {
            controller.broadcaster.reset_logs();
        }
    }
}
