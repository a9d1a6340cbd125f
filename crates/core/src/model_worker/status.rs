//! Worker state tracking

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::proto::status_response::State as RemoteState;

/// Lifecycle state of a worker handle
///
/// `Uninitialized → Loading → Ready ⇄ Busy → Unloaded`, with
/// `Loading → Error` on load failure and any state → `Error` when the
/// channel to the worker is found broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Uninitialized,
    Loading,
    Ready,
    Busy,
    Unloaded,
    Error,
}

impl WorkerState {
    /// Terminal handles are never handed out again
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Unloaded | WorkerState::Error)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Loading => "loading",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Unloaded => "unloaded",
            WorkerState::Error => "error",
        };
        f.write_str(s)
    }
}

impl From<RemoteState> for WorkerState {
    fn from(state: RemoteState) -> Self {
        match state {
            RemoteState::Uninitialized => WorkerState::Uninitialized,
            RemoteState::Busy => WorkerState::Busy,
            RemoteState::Ready => WorkerState::Ready,
            RemoteState::Error => WorkerState::Error,
        }
    }
}

/// Tracks a handle's state and usage
#[derive(Debug)]
pub struct StatusTracker {
    state: WorkerState,
    created_at: Instant,
    loaded_at: Option<DateTime<Utc>>,
    last_used: Instant,
    busy_since: Option<Instant>,
    total_requests: u64,
}

impl StatusTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: WorkerState::Uninitialized,
            created_at: now,
            loaded_at: None,
            last_used: now,
            busy_since: None,
            total_requests: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn set_loading(&mut self) {
        self.state = WorkerState::Loading;
    }

    /// Mark the model loaded
    pub fn set_ready(&mut self) {
        self.state = WorkerState::Ready;
        self.loaded_at = Some(Utc::now());
        self.last_used = Instant::now();
    }

    /// Enter `Busy` for one operation
    pub fn set_busy(&mut self) {
        self.state = WorkerState::Busy;
        self.busy_since = Some(Instant::now());
    }

    /// Leave `Busy` after an operation, unless the handle went terminal meanwhile
    ///
    /// Probes such as `Status` pass `record = false` so they neither count as
    /// requests nor reset the idle clock.
    pub fn finish_op(&mut self, record: bool) {
        if record {
            self.total_requests += 1;
            self.last_used = Instant::now();
        }
        self.busy_since = None;
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Ready;
        }
    }

    pub fn set_error(&mut self) {
        self.state = WorkerState::Error;
    }

    pub fn set_unloaded(&mut self) {
        self.state = WorkerState::Unloaded;
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last operation finished; zero while busy
    pub fn idle_for(&self) -> Duration {
        if self.busy_since.is_some() {
            Duration::ZERO
        } else {
            self.last_used.elapsed()
        }
    }

    /// Time the current operation has been running
    pub fn busy_for(&self) -> Option<Duration> {
        self.busy_since.map(|t| t.elapsed())
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
