//! Linux daemon shell for proxy_box.
//! Runs the service controller and reads commands from stdin, or with
//! `ctl` sends one request to a running daemon over the control socket.

mod app;
mod paths;

use std::io::{self, BufRead};
use std::path::Path;
use std::process::ExitCode;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use log::{error, info, warn};
use proxy_box_core::control::protocol::{ControlRequest, ControlResponse};
use proxy_box_core::control::unix::ControlClient;
use proxy_box_core::{ReloadMode, ServiceController, StatusEvent, WorkspacePaths};

use crate::app::AppState;
use crate::paths::LinuxPaths;

const HELP: &str = "commands: start | stop | reload | restart | select <group> <outbound> | \
urltest <group> | clear | status | proxy on|off | profile <path> [name] | \
check <path> | generate <path> | quit";

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("ctl") {
        return run_ctl(&args[1..]);
    }

    info!("starting proxy_box (linux daemon)");
    let app_state = AppState::new();
    let running = Arc::new(AtomicBool::new(true));

    let (event_tx, event_rx) = unbounded::<StatusEvent>();
    app_state.controller.register_observer(Arc::new(event_tx));
    thread::spawn(move || print_events(event_rx));

    // Ctrl+C cleanup
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received signal, stopping service and exiting");
            running.store(false, Ordering::SeqCst);
        }) {
            error!("Error setting Ctrl-C handler: {e}");
        }
    }

    if args.iter().any(|arg| arg == "--start") {
        spawn_trigger(&app_state.controller, "start", |c| c.start());
    }

    let looper = EventLoop {
        app_state,
        running,
        lines: spawn_stdin_reader(),
    };
    looper.run();
    ExitCode::SUCCESS
}

struct EventLoop {
    app_state: AppState,
    running: Arc<AtomicBool>,
    lines: Receiver<String>,
}

impl EventLoop {
    fn run(&self) {
        info!("daemon ready; {HELP}");

        while self.running.load(Ordering::SeqCst) {
            match self.lines.recv_timeout(Duration::from_millis(50)) {
                Ok(line) => self.handle_line(line.trim()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("stdin closed");
                    break;
                }
            }
        }

        info!("exiting event loop; cleaning up");
        self.app_state.cleanup();
    }

    fn handle_line(&self, line: &str) {
        let words: Vec<&str> = line.split_whitespace().collect();
        let controller = &self.app_state.controller;

        match words.as_slice() {
            [] => {}
            ["start"] => spawn_trigger(controller, "start", |c| c.start()),
            ["stop"] => spawn_trigger(controller, "stop", |c| c.stop()),
            ["reload"] => spawn_trigger(controller, "reload", |c| c.reload()),
            ["restart"] => {
                spawn_trigger(controller, "restart", |c| c.reload_with(ReloadMode::Hard))
            }
            ["select", group, outbound] => {
                let (group, outbound) = (group.to_string(), outbound.to_string());
                spawn_trigger(controller, "select", move |c| {
                    c.select_outbound(&group, &outbound)
                });
            }
            ["urltest", group] => {
                let group = group.to_string();
                spawn_trigger(controller, "urltest", move |c| c.url_test(&group));
            }
            ["clear"] => spawn_trigger(controller, "clear", |c| c.clear_logs()),
            ["status"] => {
                let proxy = controller.system_proxy_status();
                println!(
                    "status: {} (control: {:?}, system proxy available={} enabled={})",
                    controller.status(),
                    controller.control_state(),
                    proxy.available,
                    proxy.enabled
                );
            }
            ["proxy", state @ ("on" | "off")] => {
                let enabled = *state == "on";
                spawn_trigger(controller, "proxy", move |c| c.set_system_proxy_enabled(enabled));
            }
            ["profile", path, rest @ ..] => {
                let name = if rest.is_empty() {
                    profile_name(path)
                } else {
                    rest.join(" ")
                };
                controller.set_active_profile(*path, name);
                self.app_state.save_settings();
            }
            ["check", path] => match controller.parse_config(Path::new(path), true).as_str() {
                "" => println!("{path}: ok"),
                message => println!("{path}: {message}"),
            },
            ["generate", path] => match controller.generate_config(path) {
                Ok(config) => println!("{config}"),
                Err(e) => error!("generate failed: {e}"),
            },
            ["quit" | "exit"] => self.running.store(false, Ordering::SeqCst),
            _ => warn!("unrecognized command {line:?}; {HELP}"),
        }
    }
}

/// Every trigger runs on its own thread; the controller settles races.
fn spawn_trigger<F>(controller: &Arc<ServiceController>, name: &'static str, action: F)
where
    F: FnOnce(&ServiceController) -> Result<(), proxy_box_core::ServiceError> + Send + 'static,
{
    let controller = controller.clone();
    thread::spawn(move || {
        if let Err(e) = action(&controller) {
            error!("{name} failed: {e}");
        }
    });
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                }
            }
        }
    });
    rx
}

fn print_events(events: Receiver<StatusEvent>) {
    for event in events.iter() {
        match &event {
            StatusEvent::Log(line) => {
                println!(
                    "{} {:<5} {}",
                    line.at.format("%H:%M:%S"),
                    line.level,
                    line.message
                );
            }
            other => match serde_json::to_string(other) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("failed to encode event: {e}"),
            },
        }
    }
}

fn profile_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn run_ctl(args: &[String]) -> ExitCode {
    let request = match ControlRequest::parse(&args.join(" ")) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let socket = WorkspacePaths::from_app_paths(&LinuxPaths).socket_path();
    match ControlClient::new(socket).send(&request) {
        Ok(ControlResponse::Ok(payload)) => {
            if let Some(payload) = payload {
                println!("{payload}");
            }
            ExitCode::SUCCESS
        }
        Ok(ControlResponse::Error(message)) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("cannot reach daemon: {e}");
            ExitCode::FAILURE
        }
    }
}
