//! Session cache façade over the store connection. Hands out sessions,
//! drives durability, expires idle sessions, and invalidates cached cursors
//! for queued drops.

use crate::error::CaskError;
use crate::store::{Connection, Cursor, Session, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tracks the timestamp local (secondary) reads are served at. The oldest
/// timestamp is lagged behind it so those snapshots stay readable.
#[derive(Default)]
pub struct SnapshotManager {
    local_snapshot: Mutex<Option<u64>>,
}

impl SnapshotManager {
    pub fn set_local_snapshot(&self, timestamp: u64) {
        *self.local_snapshot.lock() = Some(timestamp);
    }

    pub fn clear_local_snapshot(&self) {
        *self.local_snapshot.lock() = None;
    }

    pub fn local_snapshot(&self) -> Option<u64> {
        *self.local_snapshot.lock()
    }
}

struct CachedSession {
    session: Session,
    idle_since: Instant,
}

pub struct SessionCache {
    conn: Arc<Connection>,
    sessions: Mutex<Vec<CachedSession>>,
    cursors: Mutex<HashMap<String, Vec<Cursor>>>,
    shutting_down: AtomicBool,
    snapshot: SnapshotManager,
}

impl SessionCache {
    pub fn new(conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            sessions: Mutex::new(Vec::new()),
            cursors: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            snapshot: SnapshotManager::default(),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn get_session(self: &Arc<Self>) -> SessionHandle {
        let session = self
            .sessions
            .lock()
            .pop()
            .map(|cached| cached.session)
            .unwrap_or_else(|| self.conn.open_session());
        SessionHandle {
            cache: Arc::clone(self),
            session: Some(session),
        }
    }

    fn release(&self, session: Session) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.sessions.lock().push(CachedSession {
            session,
            idle_since: Instant::now(),
        });
    }

    /// Journal flush, or a checkpoint when `force_checkpoint` is set.
    /// `stable_checkpoint` binds the checkpoint to the stable timestamp.
    pub fn wait_until_durable(
        &self,
        force_checkpoint: bool,
        stable_checkpoint: bool,
    ) -> Result<(), CaskError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CaskError::ShutdownInProgress);
        }
        let session = self.conn.open_session();
        let result = if force_checkpoint {
            session.checkpoint(if stable_checkpoint {
                "use_timestamp=true"
            } else {
                "use_timestamp=false"
            })
        } else {
            session.log_flush("sync=on")
        };
        result.map_err(|e| match e {
            StoreError::ConnectionClosed => CaskError::ShutdownInProgress,
            other => CaskError::Io(std::io::Error::other(other.to_string())),
        })
    }

    /// Closes cached sessions idle longer than `idle_ms`. Returns how many
    /// were dropped.
    pub fn close_expired_idle_sessions(&self, idle_ms: u64) -> usize {
        let threshold = Duration::from_millis(idle_ms);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|cached| cached.idle_since.elapsed() < threshold);
        let closed = before - sessions.len();
        if closed > 0 {
            debug!(closed, "expired idle sessions");
        }
        closed
    }

    pub fn cached_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Parks a cursor for later reuse by record stores and indexes.
    pub fn cache_cursor(&self, cursor: Cursor) {
        self.cursors
            .lock()
            .entry(cursor.uri().to_string())
            .or_default()
            .push(cursor);
    }

    pub fn cached_cursor_count(&self, uri: &str) -> usize {
        self.cursors.lock().get(uri).map(Vec::len).unwrap_or(0)
    }

    /// Invalidates every cached cursor for `uri` so a pending drop can
    /// acquire the table exclusively.
    pub fn close_all_cursors(&self, uri: &str) {
        self.cursors.lock().remove(uri);
    }

    pub fn close_cursors_for_queued_drops(&self, queued_uris: &[String]) {
        if queued_uris.is_empty() {
            return;
        }
        let mut cursors = self.cursors.lock();
        for uri in queued_uris {
            cursors.remove(uri);
        }
    }

    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.sessions.lock().clear();
        self.cursors.lock().clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// RAII session loan; returns the session to the cache on drop.
pub struct SessionHandle {
    cache: Arc<SessionCache>,
    session: Option<Session>,
}

impl std::ops::Deref for SessionHandle {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.cache.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionCache;
    use crate::store::Connection;
    use std::time::Duration;

    fn cache() -> (tempfile::TempDir, std::sync::Arc<SessionCache>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path(), "create").expect("open");
        (dir, SessionCache::new(conn))
    }

    #[test]
    fn sessions_are_reused_and_expired() {
        let (_dir, cache) = cache();
        {
            let _session = cache.get_session();
        }
        assert_eq!(cache.cached_session_count(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.close_expired_idle_sessions(1), 1);
        assert_eq!(cache.cached_session_count(), 0);
    }

    #[test]
    fn cursor_invalidation_by_uri() {
        let (_dir, cache) = cache();
        let session = cache.get_session();
        session.create("table:c1", "cfg").expect("create");
        session.create("table:c2", "cfg").expect("create");
        cache.cache_cursor(session.open_cursor("table:c1").expect("cursor"));
        cache.cache_cursor(session.open_cursor("table:c2").expect("cursor"));
        assert_eq!(cache.cached_cursor_count("table:c1"), 1);
        cache.close_cursors_for_queued_drops(&["table:c1".to_string()]);
        assert_eq!(cache.cached_cursor_count("table:c1"), 0);
        assert_eq!(cache.cached_cursor_count("table:c2"), 1);
    }

    #[test]
    fn shutdown_rejects_durability_requests() {
        let (_dir, cache) = cache();
        cache.wait_until_durable(false, false).expect("flush");
        cache.mark_shutting_down();
        let err = cache.wait_until_durable(false, false).expect_err("rejected");
        assert!(err.is_shutdown());
    }
}
