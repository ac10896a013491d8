//! Control-channel supervision.
//!
//! The control server listens on `working/command.sock` and forwards live
//! requests to whichever engine handle is currently bound. Listener startup
//! is asynchronous, so `ControlChannel::start` polls for the socket file
//! with a bounded retry before declaring the channel ready.

pub mod protocol;
pub mod unix;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::Timings;
use crate::engine::EngineHandle;
use crate::error::ServiceError;
use crate::platform::SystemProxyStatus;
use crate::status::ServiceStatus;

use self::protocol::{ControlRequest, ControlResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotStarted,
    Starting,
    Ready,
    /// The socket never appeared. The channel keeps running degraded.
    Failed,
}

/// Callbacks the control server invokes for requests that concern the
/// lifecycle rather than the engine.
pub trait ControlHandler: Send + Sync {
    fn service_reload(&self);
    fn service_status(&self) -> ServiceStatus;
    fn system_proxy_status(&self) -> SystemProxyStatus;
    fn set_system_proxy_enabled(&self, enabled: bool);
    fn clear_logs(&self);
}

pub trait ControlServer: Send + Sync {
    /// Starts listening. Binding may complete after this returns.
    fn start(&self) -> io::Result<()>;
    fn set_service(&self, service: Option<Arc<dyn EngineHandle>>);
    /// Must be idempotent.
    fn close(&self);
}

pub trait ControlServerFactory: Send + Sync {
    fn create(
        &self,
        socket_path: &Path,
        handler: Arc<dyn ControlHandler>,
        read_timeout: Duration,
    ) -> io::Result<Arc<dyn ControlServer>>;
}

struct ChannelInner {
    state: ChannelState,
    server: Option<Arc<dyn ControlServer>>,
    handler: Option<Arc<dyn ControlHandler>>,
    service: Option<Arc<dyn EngineHandle>>,
}

pub struct ControlChannel {
    factory: Arc<dyn ControlServerFactory>,
    socket_path: PathBuf,
    inner: Mutex<ChannelInner>,
}

impl ControlChannel {
    pub fn new(factory: Arc<dyn ControlServerFactory>, socket_path: PathBuf) -> Self {
        Self {
            factory,
            socket_path,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::NotStarted,
                server: None,
                handler: None,
                service: None,
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().server.is_some()
    }

    /// Creates and starts the listener, then waits for its socket file.
    ///
    /// A socket that never shows up is not an error: the channel is marked
    /// `Failed` and the caller carries on. Only a listener that refuses to
    /// start at all is reported as `StartCommandServer`.
    pub fn start(
        &self,
        handler: Arc<dyn ControlHandler>,
        timings: &Timings,
    ) -> Result<ChannelState, ServiceError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.server.is_some() {
                debug!("Control server already running ({:?})", inner.state);
                return Ok(inner.state);
            }
            inner.state = ChannelState::Starting;

            let started = self
                .factory
                .create(
                    &self.socket_path,
                    handler.clone(),
                    timings.command_read_timeout(),
                )
                .and_then(|server| server.start().map(|()| server));
            match started {
                Ok(server) => {
                    inner.server = Some(server);
                    inner.handler = Some(handler);
                }
                Err(e) => {
                    inner.state = ChannelState::NotStarted;
                    return Err(ServiceError::StartCommandServer(e));
                }
            }
        }

        let ready = wait_for_socket(
            &self.socket_path,
            timings.socket_poll_interval(),
            timings.socket_poll_cap(),
        );
        let state = if ready {
            thread::sleep(timings.socket_ready_grace());
            info!("Control socket ready at {:?}", self.socket_path);
            ChannelState::Ready
        } else {
            debug!(
                "Control socket {:?} missing after {:?}",
                self.socket_path,
                timings.socket_poll_cap()
            );
            ChannelState::Failed
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.server.is_some() {
            inner.state = state;
        }
        Ok(state)
    }

    /// Rebinds the handle control requests are dispatched to. `None`
    /// unbinds; safe to call before the old handle is closed.
    pub fn set_service(&self, service: Option<Arc<dyn EngineHandle>>) {
        let server = {
            let mut inner = self.inner.lock().unwrap();
            inner.service = service.clone();
            inner.server.clone()
        };
        if let Some(server) = server {
            server.set_service(service);
        }
    }

    /// Runs a request in-process, exactly as if it had arrived on the socket.
    pub fn dispatch(&self, request: &ControlRequest) -> ControlResponse {
        let (service, handler) = {
            let inner = self.inner.lock().unwrap();
            (inner.service.clone(), inner.handler.clone())
        };
        match handler {
            Some(handler) => protocol::execute(request, service.as_ref(), handler.as_ref()),
            None => ControlResponse::Error("control channel not started".into()),
        }
    }

    pub fn close(&self) {
        let server = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ChannelState::NotStarted;
            inner.service = None;
            inner.handler = None;
            inner.server.take()
        };
        if let Some(server) = server {
            server.close();
            debug!("Control server closed");
        }
    }
}

/// Sleeps between checks; never spins.
fn wait_for_socket(path: &Path, interval: Duration, cap: Duration) -> bool {
    let deadline = Instant::now() + cap;
    loop {
        if path.exists() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullHandler;

    impl ControlHandler for NullHandler {
        fn service_reload(&self) {}

        fn service_status(&self) -> ServiceStatus {
            ServiceStatus::Started
        }

        fn system_proxy_status(&self) -> SystemProxyStatus {
            SystemProxyStatus::default()
        }

        fn set_system_proxy_enabled(&self, _enabled: bool) {}

        fn clear_logs(&self) {}
    }

    /// Creates the socket file after `delay`, or never.
    struct LateServer {
        path: PathBuf,
        delay: Option<Duration>,
        closes: Arc<AtomicUsize>,
    }

    impl ControlServer for LateServer {
        fn start(&self) -> io::Result<()> {
            if let Some(delay) = self.delay {
                let path = self.path.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = fs::write(path, b"");
                });
            }
            Ok(())
        }

        fn set_service(&self, _service: Option<Arc<dyn EngineHandle>>) {}

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct LateFactory {
        delay: Option<Duration>,
        closes: Arc<AtomicUsize>,
    }

    impl ControlServerFactory for LateFactory {
        fn create(
            &self,
            socket_path: &Path,
            _handler: Arc<dyn ControlHandler>,
            _read_timeout: Duration,
        ) -> io::Result<Arc<dyn ControlServer>> {
            Ok(Arc::new(LateServer {
                path: socket_path.to_path_buf(),
                delay: self.delay,
                closes: self.closes.clone(),
            }))
        }
    }

    struct BrokenFactory;

    impl ControlServerFactory for BrokenFactory {
        fn create(
            &self,
            _: &Path,
            _: Arc<dyn ControlHandler>,
            _: Duration,
        ) -> io::Result<Arc<dyn ControlServer>> {
            Err(io::Error::new(io::ErrorKind::AddrInUse, "busy"))
        }
    }

    fn quick_timings() -> Timings {
        Timings {
            socket_poll_interval_ms: 10,
            socket_poll_cap_ms: 150,
            socket_ready_grace_ms: 5,
            ..Timings::default()
        }
    }

    fn channel(dir: &Path, delay: Option<Duration>) -> (ControlChannel, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = LateFactory {
            delay,
            closes: closes.clone(),
        };
        (
            ControlChannel::new(Arc::new(factory), dir.join("command.sock")),
            closes,
        )
    }

    #[test]
    fn becomes_ready_once_the_socket_appears() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = channel(dir.path(), Some(Duration::from_millis(30)));

        let state = channel.start(Arc::new(NullHandler), &quick_timings()).unwrap();

        assert_eq!(state, ChannelState::Ready);
        assert_eq!(channel.state(), ChannelState::Ready);
    }

    #[test]
    fn missing_socket_degrades_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = channel(dir.path(), None);

        let started = Instant::now();
        let state = channel.start(Arc::new(NullHandler), &quick_timings()).unwrap();

        assert_eq!(state, ChannelState::Failed);
        assert!(channel.is_running());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn listener_that_cannot_start_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ControlChannel::new(Arc::new(BrokenFactory), dir.path().join("command.sock"));

        let err = channel
            .start(Arc::new(NullHandler), &quick_timings())
            .unwrap_err();

        assert!(matches!(err, ServiceError::StartCommandServer(_)));
        assert_eq!(channel.state(), ChannelState::NotStarted);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, closes) = channel(dir.path(), Some(Duration::ZERO));
        channel.start(Arc::new(NullHandler), &quick_timings()).unwrap();

        channel.close();
        channel.close();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!channel.is_running());
    }

    #[test]
    fn dispatch_without_service_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _) = channel(dir.path(), Some(Duration::ZERO));
        channel.start(Arc::new(NullHandler), &quick_timings()).unwrap();

        let response = channel.dispatch(&ControlRequest::UrlTest {
            group_tag: "auto".into(),
        });

        assert_eq!(
            response,
            ControlResponse::Error("service not running".into())
        );
    }
}
