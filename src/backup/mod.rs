//! Hot backup: enumerates a consistent set of live data, journal, and
//! metadata files across the main engine and the optional keystore, then
//! copies them to a local directory or streams them to an object store.

pub mod object_store;

use crate::error::CaskError;
use crate::keystore::{KeyStore, KEYDB_DIR};
use crate::store::{BackupCursor, Connection, Session};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const JOURNAL_DIR: &str = "journal";
pub const STORAGE_METADATA_FILE: &str = "storage.bson";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub src: PathBuf,
    pub dst: PathBuf,
    /// Size at cursor-enumeration time. Copies transfer exactly this many
    /// bytes; the live file may keep growing behind the cursor.
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub backup_id: String,
    pub files: Vec<BackupFile>,
}

/// One participating engine: its session pins the backup cursor for the
/// lifetime of the enumeration.
struct EngineBackup {
    src_root: PathBuf,
    dst_root: PathBuf,
    _session: Session,
    cursor: BackupCursor,
}

/// Opens backup cursors across the main engine and the keystore (when
/// present) and resolves every reported filename to a sized copy entry.
/// The write barrier is held only while both cursors open, and only when a
/// keystore participates, so the two engines yield one consistent snapshot.
pub(crate) fn populate_file_list(
    conn: &Arc<Connection>,
    engine_root: &Path,
    dest_root: &Path,
    keystore: Option<&Arc<KeyStore>>,
    write_barrier: &RwLock<()>,
) -> Result<Vec<BackupFile>, CaskError> {
    let mut engines = Vec::new();
    {
        let _barrier = keystore.map(|_| write_barrier.write());

        let session = conn.open_session();
        session
            .log_flush("sync=off")
            .map_err(CaskError::from)?;
        let cursor = session.open_backup_cursor().map_err(CaskError::from)?;
        engines.push(EngineBackup {
            src_root: engine_root.to_path_buf(),
            dst_root: dest_root.to_path_buf(),
            _session: session,
            cursor,
        });

        if let Some(keystore) = keystore {
            let session = keystore.connection().open_session();
            session
                .log_flush("sync=off")
                .map_err(CaskError::from)?;
            let cursor = session.open_backup_cursor().map_err(CaskError::from)?;
            engines.push(EngineBackup {
                src_root: engine_root.join(KEYDB_DIR),
                dst_root: dest_root.join(KEYDB_DIR),
                _session: session,
                cursor,
            });
        }
    }

    let mut files = Vec::new();
    for engine in &engines {
        for name in engine.cursor.files() {
            let src = engine.src_root.join(name);
            if let Ok(meta) = std::fs::metadata(&src) {
                files.push(BackupFile {
                    src,
                    dst: engine.dst_root.join(name),
                    size: meta.len(),
                });
                continue;
            }
            // Journal files are reported by bare name; resolve them under
            // the journal directory.
            let src = engine.src_root.join(JOURNAL_DIR).join(name);
            let Ok(meta) = std::fs::metadata(&src) else {
                return Err(CaskError::InvalidPath(format!(
                    "cannot find source file for backup: {name}, source path: {}",
                    engine.src_root.display()
                )));
            };
            files.push(BackupFile {
                src,
                dst: engine.dst_root.join(JOURNAL_DIR).join(name),
                size: meta.len(),
            });
        }
    }

    // The engine metadata file is not reported by the cursor but every
    // restore needs it.
    let metadata_src = engine_root.join(STORAGE_METADATA_FILE);
    let metadata_size = std::fs::metadata(&metadata_src)
        .map_err(|e| {
            CaskError::InvalidPath(format!(
                "cannot stat {}: {e}",
                metadata_src.display()
            ))
        })?
        .len();
    files.push(BackupFile {
        src: metadata_src,
        dst: dest_root.join(STORAGE_METADATA_FILE),
        size: metadata_size,
    });

    debug!(files = files.len(), "backup file list populated");
    Ok(files)
}

/// Streams `size` bytes of `src` into `dst`. A plain file copy would race
/// the live tail; the cursor-declared length is the consistent one.
fn copy_file_exact(src: &Path, dst: &Path, size: u64) -> Result<(), CaskError> {
    let file = std::fs::File::open(src)
        .map_err(|e| CaskError::InvalidPath(format!("cannot open {}: {e}", src.display())))?;
    let mut reader = BufReader::new(file).take(size);
    let out = std::fs::File::create(dst)
        .map_err(|e| CaskError::InvalidPath(format!("cannot create {}: {e}", dst.display())))?;
    let mut writer = BufWriter::new(out);
    let copied = std::io::copy(&mut reader, &mut writer)
        .map_err(|e| CaskError::Internal(format!("copy of {} failed: {e}", src.display())))?;
    if copied != size {
        return Err(CaskError::Internal(format!(
            "{} truncated during backup: copied {copied} of {size} bytes",
            src.display()
        )));
    }
    writer
        .flush()
        .map_err(|e| CaskError::Internal(e.to_string()))?;
    Ok(())
}

/// Local-directory destination. The destination root is expected to exist
/// (validated by the caller); nested directories are created on demand.
pub(crate) fn copy_to_local(files: &[BackupFile]) -> Result<(), CaskError> {
    let mut known_dirs: HashSet<PathBuf> = HashSet::new();
    for file in files {
        if let Some(parent) = file.dst.parent() {
            if !known_dirs.contains(parent) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CaskError::InvalidPath(format!(
                        "cannot create backup directory {}: {e}",
                        parent.display()
                    ))
                })?;
                known_dirs.insert(parent.to_path_buf());
            }
        }
        copy_file_exact(&file.src, &file.dst, file.size)?;
    }
    info!(files = files.len(), "hot backup copied to local destination");
    Ok(())
}
