//! Multicast of status, log and alert events to registered observers.
//!
//! Delivery is at-most-once and nothing is queued here: an event broadcast
//! while no observer is registered is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use log::Level;
use serde::Serialize;

use crate::status::{AlertEvent, AlertKind, ServiceStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StatusEvent {
    Status(ServiceStatus),
    Log(LogLine),
    LogReset,
    Alert(AlertEvent),
}

/// Status events are delivered while the controller still holds its session
/// lock, so an observer must not call back into `start`, `stop` or `reload`.
pub trait StatusObserver: Send + Sync {
    fn on_event(&self, event: &StatusEvent);
}

/// A channel sender is the simplest observer: each event becomes a message.
impl StatusObserver for Sender<StatusEvent> {
    fn on_event(&self, event: &StatusEvent) {
        let _ = self.send(event.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct StatusBroadcaster {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Arc<dyn StatusObserver>)>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn StatusObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().unwrap().push((id, observer));
        id
    }

    /// Returns `false` if the observer was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn broadcast(&self, event: StatusEvent) {
        // Snapshot so observers run without the registry lock held.
        let observers: Vec<Arc<dyn StatusObserver>> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            observer.on_event(&event);
        }
    }

    pub fn status(&self, status: ServiceStatus) {
        self.broadcast(StatusEvent::Status(status));
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.broadcast(StatusEvent::Log(LogLine {
            at: Local::now(),
            level,
            message: message.into(),
        }));
    }

    pub fn reset_logs(&self) {
        self.broadcast(StatusEvent::LogReset);
    }

    pub fn alert(&self, kind: AlertKind, message: Option<String>) {
        self.broadcast(StatusEvent::Alert(AlertEvent { kind, message }));
    }
}
