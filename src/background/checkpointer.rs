//! Checkpoint coordinator. On each tick it snapshots the stable and
//! initial-data clocks and decides between skipping, taking an unstable
//! (full) checkpoint, or taking a stable checkpoint bound to the current
//! stable timestamp. The encryption keystore, when present, gets an
//! unstable checkpoint after every pass.

use crate::background::{Wake, WakeSignal};
use crate::error::CaskError;
use crate::keystore::KeyStore;
use crate::session::SessionCache;
use crate::timestamps::{TimestampCoordinator, ALLOW_UNSTABLE_CHECKPOINTS_SENTINEL};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shared slot for the keystore so the coordinator reaches it through the
/// session-cache façade side rather than walking back through the engine.
pub type KeystoreSlot = Mutex<Option<Arc<KeyStore>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointDecision {
    /// No consistent view of the data yet, or stable checkpoints are not
    /// being tracked: persist everything.
    Unstable,
    /// Data on disk is prone to rollback; hold off.
    Skip,
    Stable(u64),
}

fn decide(stable: u64, initial_data: u64, keep_data_history: bool) -> CheckpointDecision {
    if initial_data <= ALLOW_UNSTABLE_CHECKPOINTS_SENTINEL {
        CheckpointDecision::Unstable
    } else if !keep_data_history {
        CheckpointDecision::Unstable
    } else if stable < initial_data {
        CheckpointDecision::Skip
    } else {
        CheckpointDecision::Stable(stable)
    }
}

struct CheckpointInner {
    cache: Arc<SessionCache>,
    timestamps: Arc<TimestampCoordinator>,
    keystore: Arc<KeystoreSlot>,
    keep_data_history: bool,
    write_conflicts: AtomicU64,
}

impl CheckpointInner {
    fn run_once(&self) -> Result<(), CaskError> {
        let stable = self.timestamps.stable();
        let initial_data = self.timestamps.initial_data();

        match decide(stable, initial_data, self.keep_data_history) {
            CheckpointDecision::Unstable => {
                let session = self.cache.get_session();
                session.checkpoint("use_timestamp=false")?;
                if !self.keep_data_history {
                    // With no stable timestamp tracked, oplog truncation is
                    // driven purely by size.
                    self.timestamps.publish_last_stable_checkpoint(u64::MAX);
                }
            }
            CheckpointDecision::Skip => {
                debug!(
                    stable,
                    initial_data,
                    "stable timestamp is behind the initial data timestamp, skipping a checkpoint"
                );
            }
            CheckpointDecision::Stable(stable) => {
                debug!(stable, "performing stable checkpoint");
                let session = self.cache.get_session();
                session.checkpoint("use_timestamp=true")?;
                // Publish the checkpoint time only after it is durable.
                self.timestamps.publish_last_stable_checkpoint(stable);
            }
        }

        let keystore = self.keystore.lock().clone();
        if let Some(keystore) = keystore {
            keystore.checkpoint()?;
        }
        Ok(())
    }

    fn run_once_logged(&self) {
        match self.run_once() {
            Ok(()) => {}
            Err(CaskError::WriteConflict) => {
                self.write_conflicts.fetch_add(1, Ordering::SeqCst);
                warn!("checkpoint encountered a write conflict, retrying next tick");
            }
            Err(e) if e.is_shutdown() => {}
            Err(e) => {
                error!(error = %e, "checkpoint pass failed");
            }
        }
    }
}

pub struct Checkpointer {
    inner: Arc<CheckpointInner>,
    signal: Arc<WakeSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Checkpointer {
    /// `wake` is the same signal handed to the timestamp coordinator so a
    /// first stable crossing triggers an early checkpoint.
    pub fn spawn(
        cache: Arc<SessionCache>,
        timestamps: Arc<TimestampCoordinator>,
        keystore: Arc<KeystoreSlot>,
        wake: Arc<WakeSignal>,
        keep_data_history: bool,
        delay: Duration,
    ) -> Self {
        let inner = Arc::new(CheckpointInner {
            cache,
            timestamps,
            keystore,
            keep_data_history,
            write_conflicts: AtomicU64::new(0),
        });
        let thread_inner = Arc::clone(&inner);
        let thread_signal = Arc::clone(&wake);
        let handle = std::thread::Builder::new()
            .name("cask-checkpointer".into())
            .spawn(move || {
                info!("starting checkpoint coordinator");
                loop {
                    if thread_signal.wait(delay) == Wake::Shutdown {
                        break;
                    }
                    thread_inner.run_once_logged();
                }
                info!("stopping checkpoint coordinator");
            })
            .expect("spawn checkpointer");
        Self {
            inner,
            signal: wake,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Runs a single coordinator pass synchronously. Used by forced-flush
    /// paths and tests that cannot wait out the tick interval.
    pub fn tick(&self) -> Result<(), CaskError> {
        self.inner.run_once()
    }

    /// Write conflicts swallowed during checkpoint passes. Surfaced as a
    /// counter so a durability regression is visible beyond the log line.
    pub fn write_conflict_count(&self) -> u64 {
        self.inner.write_conflicts.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.signal.shutdown();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
