//! Idle-session sweeper: periodically asks the session cache to close
//! sessions that have been idle past the configured threshold.

use crate::background::{Wake, WakeSignal};
use crate::session::SessionCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// Sweep cadence; shorter in debug builds to aid testing.
fn sweep_interval() -> Duration {
    if cfg!(debug_assertions) {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(10)
    }
}

pub struct SessionSweeper {
    signal: Arc<WakeSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSweeper {
    /// `idle_secs` is shared so the server can retune the threshold while
    /// the sweeper runs.
    pub fn spawn(cache: Arc<SessionCache>, idle_secs: Arc<AtomicU32>) -> Self {
        let signal = Arc::new(WakeSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("cask-session-sweeper".into())
            .spawn(move || {
                debug!("starting idle session sweeper");
                loop {
                    if thread_signal.wait(sweep_interval()) == Wake::Shutdown {
                        break;
                    }
                    let idle_ms = u64::from(idle_secs.load(Ordering::SeqCst)) * 1000;
                    cache.close_expired_idle_sessions(idle_ms);
                }
                debug!("stopping idle session sweeper");
            })
            .expect("spawn session sweeper");
        Self {
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Idempotent; wakes the thread early so shutdown never waits out a full
    /// sweep interval.
    pub fn shutdown(&self) {
        self.signal.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
