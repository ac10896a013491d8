//! Service status values and the alerts surfaced when a start fails.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ServiceStatus {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl ServiceStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide status value. Transitions are compare-and-set so a
/// read-check-then-write never tears under concurrent triggers.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ServiceStatus::Stopped as u8))
    }

    pub fn get(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Moves `from` -> `to`. On failure returns the status actually observed.
    pub fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> Result<(), ServiceStatus> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ServiceStatus::from_u8)
    }

    /// Unconditional store, returning the previous value.
    pub fn set(&self, to: ServiceStatus) -> ServiceStatus {
        ServiceStatus::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    EmptyConfiguration,
    CreateService,
    StartService,
    StartCommandServer,
    ConfigInvalid,
}

/// Terminal failure signal delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_stopped() {
        assert_eq!(StatusCell::new().get(), ServiceStatus::Stopped);
    }

    #[test]
    fn transition_only_from_expected_state() {
        let cell = StatusCell::new();
        assert!(
            cell.transition(ServiceStatus::Stopped, ServiceStatus::Starting)
                .is_ok()
        );
        assert_eq!(
            cell.transition(ServiceStatus::Stopped, ServiceStatus::Starting),
            Err(ServiceStatus::Starting)
        );
        assert_eq!(cell.get(), ServiceStatus::Starting);
    }

    #[test]
    fn concurrent_start_has_a_single_winner() {
        let cell = std::sync::Arc::new(StatusCell::new());
        let winners: usize = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    cell.transition(ServiceStatus::Stopped, ServiceStatus::Starting)
                        .is_ok() as usize
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn set_returns_previous() {
        let cell = StatusCell::new();
        assert_eq!(cell.set(ServiceStatus::Started), ServiceStatus::Stopped);
        assert_eq!(cell.set(ServiceStatus::Stopped), ServiceStatus::Started);
    }
}
