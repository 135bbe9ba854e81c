//! Timestamp coordinator: owns the stable, oldest, and initial-data clocks,
//! publishes them to the engine, and signals the checkpoint coordinator when
//! the stable timestamp first crosses the initial-data watermark.

use crate::background::WakeSignal;
use crate::error::CaskError;
use crate::oplog::OplogManager;
use crate::session::SessionCache;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Initial-data values at or below this sentinel mean "no consistent view of
/// the data yet"; only unstable checkpoints may be taken.
pub const ALLOW_UNSTABLE_CHECKPOINTS_SENTINEL: u64 = 1;

pub struct TimestampCoordinator {
    cache: Arc<SessionCache>,
    oplog: Arc<OplogManager>,
    checkpoint_wake: Arc<WakeSignal>,
    /// Snapshot history retention on: stable timestamps are meaningful.
    keep_data_history: bool,
    stable: AtomicU64,
    oldest: AtomicU64,
    initial_data: AtomicU64,
    last_stable_checkpoint: AtomicU64,
    first_stable_checkpoint_taken: AtomicBool,
}

impl TimestampCoordinator {
    pub fn new(
        cache: Arc<SessionCache>,
        oplog: Arc<OplogManager>,
        checkpoint_wake: Arc<WakeSignal>,
        keep_data_history: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            oplog,
            checkpoint_wake,
            keep_data_history,
            stable: AtomicU64::new(0),
            oldest: AtomicU64::new(0),
            initial_data: AtomicU64::new(0),
            last_stable_checkpoint: AtomicU64::new(0),
            first_stable_checkpoint_taken: AtomicBool::new(false),
        })
    }

    /// Publishes the stable timestamp to the engine, wakes the checkpoint
    /// coordinator on the first stable crossing, then advances the oldest
    /// timestamp behind it.
    pub fn set_stable(&self, timestamp: u64) -> Result<(), CaskError> {
        if !self.keep_data_history || timestamp == 0 {
            return Ok(());
        }

        self.cache
            .connection()
            .set_timestamp(&format!("stable_timestamp={timestamp:016x}"))
            .map_err(CaskError::from)?;

        let prev_stable = self.stable.swap(timestamp, Ordering::SeqCst);
        if !self.first_stable_checkpoint_taken.load(Ordering::SeqCst) {
            let initial_data = self.initial_data.load(Ordering::SeqCst);
            if prev_stable < initial_data && timestamp >= initial_data {
                self.first_stable_checkpoint_taken
                    .store(true, Ordering::SeqCst);
                info!(
                    initial_data,
                    prev_stable,
                    stable = timestamp,
                    "triggering the first stable checkpoint"
                );
                self.checkpoint_wake.kick();
            }
        }

        self.set_oldest(timestamp, false)
    }

    /// Publishes the oldest timestamp. Without `force`, the value is lagged
    /// behind the oplog read timestamp and the local snapshot timestamp so
    /// in-flight oplog reads and secondary reads keep their history. With
    /// `force`, the caller's value wins, even moving backwards.
    pub fn set_oldest(&self, timestamp: u64, force: bool) -> Result<(), CaskError> {
        if timestamp == 0 {
            return Ok(());
        }

        let mut effective = timestamp;
        if !force {
            let oplog_read = self.oplog.read_timestamp();
            if oplog_read != 0 && effective > oplog_read {
                effective = oplog_read;
            }
            if let Some(local_snapshot) = self.cache.snapshot_manager().local_snapshot() {
                if effective > local_snapshot {
                    effective = local_snapshot;
                }
            }
        }

        let config = if force {
            format!("force=true,oldest_timestamp={effective:016x},commit_timestamp={effective:016x}")
        } else {
            format!("oldest_timestamp={effective:016x}")
        };
        self.cache
            .connection()
            .set_timestamp(&config)
            .map_err(CaskError::from)?;

        // The engine ignores backwards motion unless forced; mirror that in
        // the cached value.
        if force {
            self.oldest.store(effective, Ordering::SeqCst);
            debug!(oldest = effective, "oldest and commit timestamps force set");
        } else {
            self.oldest.fetch_max(effective, Ordering::SeqCst);
            debug!(oldest = effective, "oldest timestamp set");
        }
        Ok(())
    }

    pub fn set_initial_data(&self, timestamp: u64) {
        debug!(initial_data = timestamp, "setting initial data timestamp");
        self.initial_data.store(timestamp, Ordering::SeqCst);
    }

    pub fn stable(&self) -> u64 {
        self.stable.load(Ordering::SeqCst)
    }

    pub fn oldest(&self) -> u64 {
        self.oldest.load(Ordering::SeqCst)
    }

    pub fn initial_data(&self) -> u64 {
        self.initial_data.load(Ordering::SeqCst)
    }

    pub fn last_stable_checkpoint(&self) -> u64 {
        self.last_stable_checkpoint.load(Ordering::SeqCst)
    }

    pub(crate) fn publish_last_stable_checkpoint(&self, timestamp: u64) {
        self.last_stable_checkpoint.store(timestamp, Ordering::SeqCst);
    }

    /// Whether a rollback to the stable timestamp would land on consistent
    /// data. Illegal to ask while the dataset is incomplete.
    pub fn can_recover_to_stable(&self) -> bool {
        let initial_data = self.initial_data.load(Ordering::SeqCst);
        assert!(
            initial_data > ALLOW_UNSTABLE_CHECKPOINTS_SENTINEL,
            "recoverability is undefined while the dataset is incomplete"
        );
        self.stable.load(Ordering::SeqCst) >= initial_data
    }

    /// Recovering to stable recreates the checkpoint pipeline; the first
    /// stable crossing and the published checkpoint timestamp start over.
    pub(crate) fn reset_after_rollback(&self) {
        self.first_stable_checkpoint_taken
            .store(false, Ordering::SeqCst);
        self.last_stable_checkpoint.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::TimestampCoordinator;
    use crate::background::{Wake, WakeSignal};
    use crate::oplog::OplogManager;
    use crate::session::SessionCache;
    use crate::store::Connection;
    use std::sync::Arc;
    use std::time::Duration;

    fn coordinator(
        keep_history: bool,
    ) -> (
        tempfile::TempDir,
        Arc<SessionCache>,
        Arc<OplogManager>,
        Arc<WakeSignal>,
        Arc<TimestampCoordinator>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path(), "create").expect("open");
        let cache = SessionCache::new(conn);
        let oplog = Arc::new(OplogManager::default());
        let wake = Arc::new(WakeSignal::default());
        let ts = TimestampCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&oplog),
            Arc::clone(&wake),
            keep_history,
        );
        (dir, cache, oplog, wake, ts)
    }

    #[test]
    fn stable_publishes_and_drags_oldest() {
        let (_dir, cache, _oplog, _wake, ts) = coordinator(true);
        ts.set_stable(100).expect("set stable");
        assert_eq!(ts.stable(), 100);
        assert_eq!(ts.oldest(), 100);
        assert_eq!(cache.connection().stable_timestamp(), 100);
        assert_eq!(cache.connection().oldest_timestamp(), 100);
    }

    #[test]
    fn history_disabled_ignores_stable() {
        let (_dir, cache, _oplog, _wake, ts) = coordinator(false);
        ts.set_stable(100).expect("set stable");
        assert_eq!(ts.stable(), 0);
        assert_eq!(cache.connection().stable_timestamp(), 0);
    }

    #[test]
    fn oldest_lags_behind_oplog_reads_and_local_snapshots() {
        let (_dir, cache, oplog, _wake, ts) = coordinator(true);
        oplog.start("table:oplog");
        oplog.set_read_timestamp(50);
        cache.snapshot_manager().set_local_snapshot(70);
        ts.set_oldest(100, false).expect("set oldest");
        assert_eq!(ts.oldest(), 50);
        assert_eq!(cache.connection().oldest_timestamp(), 50);

        // The tighter of the two limits wins.
        oplog.set_read_timestamp(90);
        ts.set_oldest(100, false).expect("set oldest");
        assert_eq!(ts.oldest(), 70);
        oplog.halt();
    }

    #[test]
    fn forced_oldest_moves_backwards() {
        let (_dir, cache, _oplog, _wake, ts) = coordinator(true);
        ts.set_oldest(100, false).expect("forward");
        assert_eq!(ts.oldest(), 100);
        ts.set_oldest(40, false).expect("ignored");
        assert_eq!(ts.oldest(), 100);
        ts.set_oldest(40, true).expect("forced");
        assert_eq!(ts.oldest(), 40);
        assert_eq!(cache.connection().oldest_timestamp(), 40);
    }

    #[test]
    fn first_stable_crossing_kicks_checkpointer_once() {
        let (_dir, _cache, _oplog, wake, ts) = coordinator(true);
        ts.set_initial_data(100);
        ts.set_stable(50).expect("below watermark");
        assert_eq!(wake.wait(Duration::from_millis(1)), Wake::Timeout);
        ts.set_stable(150).expect("crossing");
        assert_eq!(wake.wait(Duration::from_millis(1)), Wake::Kicked);
        ts.set_stable(200).expect("already crossed");
        assert_eq!(wake.wait(Duration::from_millis(1)), Wake::Timeout);
    }

    #[test]
    fn set_stable_is_idempotent() {
        let (_dir, cache, _oplog, _wake, ts) = coordinator(true);
        ts.set_stable(100).expect("first");
        ts.set_stable(100).expect("second");
        assert_eq!(ts.stable(), 100);
        assert_eq!(cache.connection().stable_timestamp(), 100);
    }
}
