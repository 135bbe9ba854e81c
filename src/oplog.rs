//! Reference-counted oplog manager handle. The replication layer above owns
//! oplog visibility; the adapter only consumes the oplog read timestamp when
//! lagging the oldest timestamp, and forwards flush kicks to the journal
//! flusher.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Default)]
pub struct OplogManager {
    read_timestamp: AtomicU64,
    state: Mutex<OplogState>,
}

#[derive(Default)]
struct OplogState {
    refcount: u32,
    uri: Option<String>,
}

impl OplogManager {
    /// First `start` activates tracking for `uri`; later calls only bump the
    /// reference count.
    pub fn start(&self, uri: &str) {
        let mut state = self.state.lock();
        if state.refcount == 0 {
            debug!(uri, "starting oplog manager");
            state.uri = Some(uri.to_string());
        }
        state.refcount += 1;
    }

    /// Last `halt` tears tracking down.
    pub fn halt(&self) {
        let mut state = self.state.lock();
        assert!(state.refcount > 0, "oplog manager halted more times than started");
        state.refcount -= 1;
        if state.refcount == 0 {
            debug!("halting oplog manager");
            state.uri = None;
            self.read_timestamp.store(0, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().refcount > 0
    }

    /// Timestamp up to which oplog readers are currently served. Zero means
    /// "not tracking".
    pub fn read_timestamp(&self) -> u64 {
        self.read_timestamp.load(Ordering::SeqCst)
    }

    pub fn set_read_timestamp(&self, timestamp: u64) {
        self.read_timestamp.store(timestamp, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::OplogManager;

    #[test]
    fn refcounted_start_halt() {
        let oplog = OplogManager::default();
        oplog.start("table:oplog");
        oplog.start("table:oplog");
        oplog.set_read_timestamp(42);
        oplog.halt();
        assert!(oplog.is_running());
        assert_eq!(oplog.read_timestamp(), 42);
        oplog.halt();
        assert!(!oplog.is_running());
        assert_eq!(oplog.read_timestamp(), 0);
    }

    #[test]
    #[should_panic(expected = "halted more times")]
    fn halt_without_start_panics() {
        OplogManager::default().halt();
    }
}
