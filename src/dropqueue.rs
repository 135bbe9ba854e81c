//! Deferred-drop queue. Tables reported busy at drop time are parked here
//! and retried in throttled batches once their cursors go away.

use crate::error::CaskError;
use crate::store::{Session, StoreError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Minimum spacing between queue probes so the hot path never thrashes.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub struct DropQueue {
    queue: Mutex<VecDeque<String>>,
    last_probe: Mutex<Instant>,
}

impl Default for DropQueue {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            // Start one interval in the past so the first probe is live.
            last_probe: Mutex::new(Instant::now() - PROBE_INTERVAL),
        }
    }
}

impl DropQueue {
    /// First-attempt failures go to the front: a table that just reported
    /// busy is the most likely to be free again soon, so it gets priority
    /// over entries that have already failed a retry.
    pub fn enqueue_front(&self, uri: String) {
        debug!(uri, "queueing busy table for deferred drop");
        self.queue.lock().push_front(uri);
    }

    /// Throttled probe. Uses a try-lock so callers on the hot path never
    /// block; an unavailable lock reads as "no drops".
    pub fn have_drops_queued(&self) -> bool {
        {
            let mut last = self.last_probe.lock();
            if last.elapsed() < PROBE_INTERVAL {
                return false;
            }
            *last = Instant::now();
        }
        match self.queue.try_lock() {
            Some(queue) => !queue.is_empty(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.queue.lock().iter().cloned().collect()
    }

    /// One drain pass: attempts `max(10, 10%)` of the queue. Busy entries
    /// are re-appended at the back (not the front, unlike the initial
    /// enqueue) so every queued table eventually gets a turn and a single
    /// pinned table cannot livelock the pass.
    pub fn drop_some_queued_idents(&self, session: &Session) -> Result<(), CaskError> {
        let queued = self.len();
        if queued == 0 {
            return Ok(());
        }
        let attempts = std::cmp::max(10, queued / 10);
        debug!(queued, attempts, "draining deferred drop queue");

        for _ in 0..attempts {
            let uri = match self.queue.lock().pop_front() {
                Some(uri) => uri,
                None => break,
            };
            match session.drop(&uri, "force,checkpoint_wait=false") {
                Ok(()) => {
                    info!(uri, "deferred drop completed");
                }
                Err(StoreError::Busy(_)) => {
                    self.queue.lock().push_back(uri);
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    return Err(CaskError::Fatal(format!(
                        "deferred drop of {uri} failed: {e}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DropQueue;
    use crate::store::Connection;
    use std::time::Duration;

    #[test]
    fn probe_is_throttled() {
        let queue = DropQueue::default();
        queue.enqueue_front("table:c1".into());
        assert!(queue.have_drops_queued());
        // Second probe inside the interval is suppressed.
        assert!(!queue.have_drops_queued());
    }

    #[test]
    fn busy_retries_append_instead_of_prepending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path(), "create").expect("open");
        let session = conn.open_session();
        session.create("table:busy", "cfg").expect("create");
        session.create("table:free", "cfg").expect("create");
        let pin = session.open_cursor("table:busy").expect("cursor");

        let queue = DropQueue::default();
        queue.enqueue_front("table:free".into());
        queue.enqueue_front("table:busy".into());
        assert_eq!(queue.snapshot(), vec!["table:busy", "table:free"]);

        queue.drop_some_queued_idents(&session).expect("drain");
        // Busy entry moved to the back; the free one is gone.
        assert_eq!(queue.snapshot(), vec!["table:busy"]);
        assert!(!session.has_uri("table:free").expect("has"));

        drop(pin);
        queue.drop_some_queued_idents(&session).expect("drain");
        assert!(queue.is_empty());
        assert!(!session.has_uri("table:busy").expect("has"));
    }

    #[test]
    fn missing_tables_are_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path(), "create").expect("open");
        let session = conn.open_session();
        let queue = DropQueue::default();
        queue.enqueue_front("table:never-existed".into());
        queue.drop_some_queued_idents(&session).expect("drain");
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_attempts_scale_with_queue_depth() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path(), "create").expect("open");
        let session = conn.open_session();
        let queue = DropQueue::default();
        for i in 0..200 {
            queue.enqueue_front(format!("table:gone-{i}"));
        }
        // 10% of 200 = 20 attempts; all hit the not-found discard path.
        queue.drop_some_queued_idents(&session).expect("drain");
        assert_eq!(queue.len(), 180);
        std::thread::sleep(Duration::from_millis(1));
        queue.drop_some_queued_idents(&session).expect("drain");
        assert_eq!(queue.len(), 162);
    }
}
