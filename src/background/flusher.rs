//! Journal flusher: drives periodic durability on the engine so commits
//! become durable within the journal commit interval.

use crate::background::{Wake, WakeSignal};
use crate::session::SessionCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_JOURNAL_DELAY_MS: u64 = 100;

pub struct JournalFlusher {
    signal: Arc<WakeSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JournalFlusher {
    pub fn spawn(cache: Arc<SessionCache>, interval: Duration) -> Self {
        let signal = Arc::new(WakeSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("cask-journal-flusher".into())
            .spawn(move || {
                debug!("starting journal flusher");
                loop {
                    match cache.wait_until_durable(false, false) {
                        Ok(()) => {}
                        Err(e) if e.is_shutdown() => break,
                        Err(e) => {
                            error!(error = %e, "journal flush failed");
                        }
                    }
                    if thread_signal.wait(interval) == Wake::Shutdown {
                        break;
                    }
                }
                debug!("stopping journal flusher");
            })
            .expect("spawn journal flusher");
        Self {
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Requests an immediate flush pass (e.g. when a replication batch
    /// completes) instead of waiting out the interval.
    pub fn kick(&self) {
        self.signal.kick();
    }

    pub fn shutdown(&self) {
        self.signal.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JournalFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
