//! Orchestrator state machine and event stream

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::OperationErrorKind;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

/// What the orchestrator is doing right now.
///
/// `Idle` is the only state from which an operation may start; `Error` is
/// passed through on the way back to `Idle` after a failed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SyncState {
    Idle = 0,
    Syncing = 1,
    BackingUp = 2,
    Restoring = 3,
    Error = 4,
}

impl SyncState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Syncing,
            2 => Self::BackingUp,
            3 => Self::Restoring,
            4 => Self::Error,
            _ => Self::Idle,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::BackingUp => "backing_up",
            Self::Restoring => "restoring",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step within a running operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Organizing,
    Downloading,
    Decoding,
    Merging,
    Exporting,
    Encoding,
    Uploading,
    Registering,
    Importing,
    Retention,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Organizing => "organizing",
            Self::Downloading => "downloading",
            Self::Decoding => "decoding",
            Self::Merging => "merging",
            Self::Exporting => "exporting",
            Self::Encoding => "encoding",
            Self::Uploading => "uploading",
            Self::Registering => "registering",
            Self::Importing => "importing",
            Self::Retention => "retention",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    StateChanged {
        from: SyncState,
        to: SyncState,
    },
    Progress {
        state: SyncState,
        phase: SyncPhase,
        detail: String,
    },
}

/// Current state plus a broadcast of every transition and progress step.
#[derive(Debug)]
pub struct StatusTracker {
    state: AtomicU8,
    events: broadcast::Sender<SyncEvent>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: AtomicU8::new(SyncState::Idle as u8),
            events,
        }
    }

    pub fn current(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Move from `Idle` to `state`, or fail with `AlreadyInProgress`.
    pub fn try_begin(&self, state: SyncState) -> Result<OperationGuard<'_>> {
        match self.state.compare_exchange(
            SyncState::Idle as u8,
            state as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.emit(SyncEvent::StateChanged {
                    from: SyncState::Idle,
                    to: state,
                });
                Ok(OperationGuard {
                    tracker: self,
                    state,
                    finished: false,
                })
            }
            Err(current) => Err(Error::operation(
                OperationErrorKind::AlreadyInProgress,
                format!(
                    "cannot start {state}: orchestrator is {}",
                    SyncState::from_u8(current)
                ),
            )),
        }
    }

    fn set(&self, from: SyncState, to: SyncState) {
        self.state.store(to as u8, Ordering::SeqCst);
        self.emit(SyncEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SyncEvent) {
        debug!(?event, "sync event");
        // No subscribers is fine.
        self.events.send(event).ok();
    }
}

/// Holds the orchestrator busy; returns it to `Idle` when finished or dropped.
#[derive(Debug)]
pub struct OperationGuard<'a> {
    tracker: &'a StatusTracker,
    state: SyncState,
    finished: bool,
}

impl OperationGuard<'_> {
    pub const fn state(&self) -> SyncState {
        self.state
    }

    pub fn progress(&self, phase: SyncPhase, detail: impl Into<String>) {
        self.tracker.emit(SyncEvent::Progress {
            state: self.state,
            phase,
            detail: detail.into(),
        });
    }

    /// Return to `Idle`, passing through `Error` when the operation failed.
    pub fn finish(mut self, failed: bool) {
        self.finished = true;
        if failed {
            self.tracker.set(self.state, SyncState::Error);
            self.tracker.set(SyncState::Error, SyncState::Idle);
        } else {
            self.tracker.set(self.state, SyncState::Idle);
        }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.set(self.state, SyncState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(receiver: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    #[test]
    fn only_one_operation_at_a_time() {
        let tracker = StatusTracker::new();
        let guard = tracker.try_begin(SyncState::Syncing).unwrap();
        assert_eq!(tracker.current(), SyncState::Syncing);

        let error = tracker.try_begin(SyncState::BackingUp).unwrap_err();
        assert_eq!(error.kind_name(), "already_in_progress");
        assert_eq!(tracker.current(), SyncState::Syncing);

        guard.finish(false);
        assert_eq!(tracker.current(), SyncState::Idle);
        assert!(tracker.try_begin(SyncState::BackingUp).is_ok());
    }

    #[test]
    fn failures_pass_through_error_state() {
        let tracker = StatusTracker::new();
        let mut events = tracker.subscribe();

        let guard = tracker.try_begin(SyncState::Restoring).unwrap();
        guard.progress(SyncPhase::Downloading, "latest");
        guard.finish(true);

        assert_eq!(
            drain(&mut events),
            vec![
                SyncEvent::StateChanged {
                    from: SyncState::Idle,
                    to: SyncState::Restoring
                },
                SyncEvent::Progress {
                    state: SyncState::Restoring,
                    phase: SyncPhase::Downloading,
                    detail: "latest".to_string()
                },
                SyncEvent::StateChanged {
                    from: SyncState::Restoring,
                    to: SyncState::Error
                },
                SyncEvent::StateChanged {
                    from: SyncState::Error,
                    to: SyncState::Idle
                },
            ]
        );
    }

    #[test]
    fn dropped_guard_returns_to_idle() {
        let tracker = StatusTracker::new();
        drop(tracker.try_begin(SyncState::BackingUp).unwrap());
        assert_eq!(tracker.current(), SyncState::Idle);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(SyncEvent::StateChanged {
            from: SyncState::Idle,
            to: SyncState::BackingUp,
        })
        .unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "backing_up");
    }
}
