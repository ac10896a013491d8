//! Unix-domain-socket control server and the standalone client that talks
//! to it.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::protocol::{self, ControlRequest, ControlResponse};
use super::{ControlHandler, ControlServer, ControlServerFactory};
use crate::engine::EngineHandle;
use crate::error::ServiceError;

const ACCEPT_IDLE: Duration = Duration::from_millis(25);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

type ServiceSlot = Arc<RwLock<Option<Arc<dyn EngineHandle>>>>;

pub struct UnixControlServer {
    socket_path: PathBuf,
    handler: Arc<dyn ControlHandler>,
    read_timeout: Duration,
    service: ServiceSlot,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UnixControlServer {
    pub fn new(
        socket_path: PathBuf,
        handler: Arc<dyn ControlHandler>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            socket_path,
            handler,
            read_timeout,
            service: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl ControlServer for UnixControlServer {
    fn start(&self) -> io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.socket_path.exists() {
            debug!("Removing leftover socket {:?}", self.socket_path);
            fs::remove_file(&self.socket_path)?;
        }

        let socket_path = self.socket_path.clone();
        let handler = self.handler.clone();
        let service = self.service.clone();
        let running = self.running.clone();
        let read_timeout = self.read_timeout;

        let worker = thread::Builder::new()
            .name("control-server".into())
            .spawn(move || {
                let listener = match UnixListener::bind(&socket_path)
                    .and_then(|l| l.set_nonblocking(true).map(|()| l))
                {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("Failed to bind control socket {:?}: {}", socket_path, e);
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                info!("Control server listening on {:?}", socket_path);

                while running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(e) =
                                serve_connection(stream, read_timeout, &service, handler.as_ref())
                            {
                                debug!("Control connection ended with error: {}", e);
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_IDLE);
                        }
                        Err(e) => {
                            warn!("Control socket accept failed: {}", e);
                            thread::sleep(ACCEPT_IDLE);
                        }
                    }
                }

                if let Err(e) = fs::remove_file(&socket_path) {
                    debug!("Control socket already gone: {}", e);
                }
                debug!("Control server stopped");
            })?;

        *self.worker.lock().unwrap() = Some(worker);
        Ok(())
    }

    fn set_service(&self, service: Option<Arc<dyn EngineHandle>>) {
        *self.service.write().unwrap() = service;
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.service.write().unwrap() = None;
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                error!("Control server thread panicked");
            }
        }
    }
}

fn serve_connection(
    stream: UnixStream,
    read_timeout: Duration,
    service: &ServiceSlot,
    handler: &dyn ControlHandler,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_timeout))?;

    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;

    let response = match ControlRequest::parse(&line) {
        Ok(request) => {
            debug!("Control request: {}", request);
            let service = service.read().unwrap().clone();
            protocol::execute(&request, service.as_ref(), handler)
        }
        Err(message) => ControlResponse::Error(message),
    };

    let mut stream = &stream;
    writeln!(stream, "{response}")?;
    stream.flush()
}

pub struct UnixControlServerFactory;

impl ControlServerFactory for UnixControlServerFactory {
    fn create(
        &self,
        socket_path: &Path,
        handler: Arc<dyn ControlHandler>,
        read_timeout: Duration,
    ) -> io::Result<Arc<dyn ControlServer>> {
        Ok(Arc::new(UnixControlServer::new(
            socket_path.to_path_buf(),
            handler,
            read_timeout,
        )))
    }
}

/// Sends single requests to a running control server.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn send(&self, request: &ControlRequest) -> Result<ControlResponse, ServiceError> {
        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

        let mut writer = &stream;
        writeln!(writer, "{request}")?;
        writer.flush()?;

        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line)?;
        Ok(ControlResponse::parse(&line))
    }

    /// Like `send`, but an `error` reply becomes `ServiceError::Control`.
    pub fn call(&self, request: &ControlRequest) -> Result<Option<String>, ServiceError> {
        match self.send(request)? {
            ControlResponse::Ok(payload) => Ok(payload),
            ControlResponse::Error(message) => Err(ServiceError::Control(message)),
        }
    }

    pub fn reload(&self) -> Result<(), ServiceError> {
        self.call(&ControlRequest::Reload).map(|_| ())
    }

    pub fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> Result<(), ServiceError> {
        self.call(&ControlRequest::SelectOutbound {
            group_tag: group_tag.to_string(),
            outbound_tag: outbound_tag.to_string(),
        })
        .map(|_| ())
    }

    pub fn url_test(&self, group_tag: &str) -> Result<(), ServiceError> {
        self.call(&ControlRequest::UrlTest {
            group_tag: group_tag.to_string(),
        })
        .map(|_| ())
    }
}
