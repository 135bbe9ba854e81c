//! Per-ident size cache persisted in the engine under a reserved ident.
//! Writes are buffered in memory and flushed best-effort; exact counts are
//! reconciled by validation above the adapter.

use crate::error::CaskError;
use crate::store::Connection;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const SIZE_STORER_IDENT: &str = "sizeStorer";
pub const SIZE_STORER_URI: &str = "table:sizeStorer";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub num_records: i64,
    pub data_size: i64,
}

pub struct SizeStorer {
    conn: Arc<Connection>,
    read_only: bool,
    buffer: Mutex<HashMap<String, SizeInfo>>,
}

impl SizeStorer {
    pub fn new(conn: Arc<Connection>, read_only: bool) -> Result<Self, CaskError> {
        let session = conn.open_session();
        if !session.has_uri(SIZE_STORER_URI).map_err(CaskError::from)? && !read_only {
            session
                .create(SIZE_STORER_URI, "key_format=S,value_format=u")
                .map_err(CaskError::from)?;
        }
        Ok(Self {
            conn,
            read_only,
            buffer: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self, uri: &str, info: SizeInfo) {
        self.buffer.lock().insert(uri.to_string(), info);
    }

    pub fn load(&self, uri: &str) -> Result<SizeInfo, CaskError> {
        if let Some(info) = self.buffer.lock().get(uri) {
            return Ok(*info);
        }
        let session = self.conn.open_session();
        match session.get(SIZE_STORER_URI, uri).map_err(CaskError::from)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| CaskError::Internal(format!("bad size storer entry for {uri}: {e}"))),
            None => Ok(SizeInfo::default()),
        }
    }

    pub fn remove(&self, uri: &str) -> Result<(), CaskError> {
        self.buffer.lock().remove(uri);
        if self.read_only {
            return Ok(());
        }
        let session = self.conn.open_session();
        session.remove(SIZE_STORER_URI, uri).map_err(CaskError::from)?;
        Ok(())
    }

    /// Writes buffered entries through. `sync` additionally checkpoints so
    /// the sizes survive a crash.
    pub fn flush(&self, sync: bool) -> Result<(), CaskError> {
        if self.read_only {
            return Ok(());
        }
        let buffered: Vec<(String, SizeInfo)> = self
            .buffer
            .lock()
            .iter()
            .map(|(uri, info)| (uri.clone(), *info))
            .collect();
        if buffered.is_empty() && !sync {
            return Ok(());
        }
        let session = self.conn.open_session();
        for (uri, info) in &buffered {
            let raw = serde_json::to_vec(info)
                .map_err(|e| CaskError::Internal(e.to_string()))?;
            session
                .put(SIZE_STORER_URI, uri, &raw)
                .map_err(CaskError::from)?;
        }
        if sync {
            session
                .checkpoint("use_timestamp=false")
                .map_err(CaskError::from)?;
        }
        debug!(entries = buffered.len(), sync, "size storer flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{SizeInfo, SizeStorer, SIZE_STORER_URI};
    use crate::store::Connection;
    use std::sync::Arc;

    #[test]
    fn sizes_roundtrip_through_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path(), "create").expect("open");
        let storer = SizeStorer::new(Arc::clone(&conn), false).expect("storer");
        storer.store(
            "table:c1",
            SizeInfo {
                num_records: 7,
                data_size: 512,
            },
        );
        storer.flush(true).expect("flush");

        let again = SizeStorer::new(conn, false).expect("second view");
        assert_eq!(
            again.load("table:c1").expect("load"),
            SizeInfo {
                num_records: 7,
                data_size: 512,
            }
        );
        assert_eq!(again.load("table:unknown").expect("load"), SizeInfo::default());
        again.remove("table:c1").expect("remove");
        assert_eq!(again.load("table:c1").expect("load"), SizeInfo::default());
    }

    #[test]
    fn read_only_flush_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let conn = Connection::open(dir.path(), "create").expect("open");
            let storer = SizeStorer::new(conn, false).expect("create table");
            storer.flush(true).expect("flush");
        }
        let conn = Connection::open(dir.path(), "readonly=true").expect("reopen");
        let storer = SizeStorer::new(conn, true).expect("storer");
        storer.store("table:c1", SizeInfo::default());
        storer.flush(true).expect("no-op flush");
        assert!(
            storer
                .conn
                .open_session()
                .get(SIZE_STORER_URI, "table:c1")
                .expect("get")
                .is_none()
        );
    }
}
