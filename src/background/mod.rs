//! Long-lived background services: the idle-session sweeper, the journal
//! flusher, and the checkpoint coordinator.

pub mod checkpointer;
pub mod flusher;
pub mod sweeper;

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Why a background thread woke up. Shutdown and early-wake requests are
/// distinct flags; conflating them risks missed wake-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Shutdown,
    Kicked,
    Timeout,
}

#[derive(Default)]
struct WakeState {
    shutdown: bool,
    kicked: bool,
}

/// Timed condition a background thread parks on between passes. `kick`
/// requests an early pass; `shutdown` asks the thread to exit.
#[derive(Default)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    cv: Condvar,
}

impl WakeSignal {
    pub fn kick(&self) {
        let mut state = self.state.lock();
        state.kicked = true;
        drop(state);
        self.cv.notify_one();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        drop(state);
        self.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Clears a consumed shutdown so the signal can drive a respawned
    /// thread (rollback-to-stable restarts the checkpoint pipeline).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.shutdown = false;
        state.kicked = false;
    }

    pub fn wait(&self, timeout: Duration) -> Wake {
        let mut state = self.state.lock();
        if state.shutdown {
            return Wake::Shutdown;
        }
        if state.kicked {
            state.kicked = false;
            return Wake::Kicked;
        }
        let _ = self.cv.wait_for(&mut state, timeout);
        if state.shutdown {
            Wake::Shutdown
        } else if state.kicked {
            state.kicked = false;
            Wake::Kicked
        } else {
            Wake::Timeout
        }
    }
}
