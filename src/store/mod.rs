//! Minimal embedded table store. This is the "underlying engine" the
//! adapter coordinates: it owns the on-disk format and is driven through a
//! connection/session/cursor surface and configuration strings.

pub mod configstr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const META_FILE: &str = "cask.meta";
pub const TABLE_FILE_SUFFIX: &str = ".wt";
pub const CURRENT_FORMAT: &str = "3.1";

const TABLE_MAGIC: &[u8; 8] = b"CASKTBL1";
const DEFAULT_LOG_DIR: &str = "journal";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is busy")]
    Busy(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("metadata corruption: {0}")]
    MetadataCorruption(String),
    #[error("on-disk format {on_disk} does not satisfy require_min {required}")]
    VersionMismatch { required: String, on_disk: String },
    #[error("table data corrupt: {0}")]
    Corrupt(String),
    #[error("unsalvageable: {0}")]
    Unsalvageable(String),
    #[error("invalid store config: {0}")]
    InvalidConfig(String),
    #[error("a backup cursor is already open")]
    BackupInProgress,
    #[error("rollback to stable unavailable: {0}")]
    RollbackUnavailable(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("store opened read-only")]
    ReadOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    config: String,
    log_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Meta {
    version: String,
    tables: BTreeMap<String, TableMeta>,
    checkpoint_stable: u64,
}

impl Meta {
    fn new() -> Self {
        Self {
            version: CURRENT_FORMAT.into(),
            tables: BTreeMap::new(),
            checkpoint_stable: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Stable(u64),
    Unstable,
}

type TableData = BTreeMap<String, Vec<u8>>;

struct OpenOptions {
    create: bool,
    log_enabled: bool,
    log_dir: String,
    read_only: bool,
    salvage: bool,
    require_min: Option<String>,
    extensions: Vec<String>,
}

fn parse_open_config(config: &str) -> OpenOptions {
    let pairs = configstr::parse(config);
    let log = configstr::get(&pairs, "log");
    let log_enabled = log
        .and_then(|g| configstr::group_get(g, "enabled"))
        .map(|v| v == "true")
        .unwrap_or(false);
    let log_dir = log
        .and_then(|g| configstr::group_get(g, "path"))
        .unwrap_or(DEFAULT_LOG_DIR)
        .to_string();
    let require_min = configstr::get(&pairs, "compatibility")
        .and_then(|g| configstr::group_get(g, "require_min"))
        .map(str::to_string);
    let extensions = configstr::get(&pairs, "extensions")
        .map(|v| vec![v.to_string()])
        .unwrap_or_default();
    OpenOptions {
        create: configstr::flag(&pairs, "create"),
        log_enabled,
        log_dir,
        read_only: configstr::flag(&pairs, "readonly"),
        salvage: configstr::flag(&pairs, "salvage"),
        require_min,
        extensions,
    }
}

/// `require_min` carries a patch component ("3.1.0"); the on-disk format
/// only records major.minor.
fn format_satisfies(on_disk: &str, require_min: &str) -> bool {
    fn major_minor(v: &str) -> (u32, u32) {
        let mut parts = v.split('.').filter_map(|p| p.parse::<u32>().ok());
        (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
    }
    major_minor(on_disk) >= major_minor(require_min)
}

/// An open store database. Cheap to share; all public methods take `&self`.
pub struct Connection {
    root: PathBuf,
    meta: Mutex<Meta>,
    tables: Mutex<HashMap<String, TableData>>,
    /// Table images captured at the last stable checkpoint; the restore
    /// point for `rollback_to_stable`.
    stable_tables: Mutex<HashMap<String, TableData>>,
    open_cursors: Mutex<HashMap<String, usize>>,
    backup_open: AtomicBool,
    closed: AtomicBool,
    stable: AtomicU64,
    oldest: AtomicU64,
    all_committed: AtomicU64,
    recovery_timestamp: u64,
    metadata_salvaged: bool,
    log_enabled: bool,
    log_dir: String,
    log_seq: AtomicU64,
    read_only: bool,
    extensions: Vec<String>,
    checkpoints: Mutex<Vec<CheckpointKind>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("root", &self.root).finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens (or creates) a database under `root`.
    pub fn open(root: &Path, config: &str) -> Result<Arc<Connection>, StoreError> {
        let options = parse_open_config(config);
        let meta_path = root.join(META_FILE);

        let mut metadata_salvaged = false;
        let meta = if meta_path.exists() {
            match read_meta(&meta_path) {
                Ok(meta) => meta,
                Err(StoreError::MetadataCorruption(reason)) if options.salvage => {
                    warn!(reason, "salvaging store metadata");
                    metadata_salvaged = true;
                    salvage_meta(root)?
                }
                Err(e) => return Err(e),
            }
        } else if options.create {
            Meta::new()
        } else {
            return Err(StoreError::NotFound(root.display().to_string()));
        };

        if let Some(require_min) = &options.require_min {
            if !format_satisfies(&meta.version, require_min) {
                return Err(StoreError::VersionMismatch {
                    required: require_min.clone(),
                    on_disk: meta.version.clone(),
                });
            }
        }

        let log_seq = AtomicU64::new(1);
        if options.log_enabled && !options.read_only {
            let log_dir = root.join(&options.log_dir);
            std::fs::create_dir_all(&log_dir)?;
            let first = log_dir.join(log_file_name(1));
            if !first.exists() {
                std::fs::write(&first, b"")?;
            }
        }

        let recovery_timestamp = meta.checkpoint_stable;
        debug!(
            root = %root.display(),
            version = meta.version,
            recovery_timestamp,
            "store opened"
        );

        let conn = Arc::new(Connection {
            root: root.to_path_buf(),
            meta: Mutex::new(meta),
            tables: Mutex::new(HashMap::new()),
            stable_tables: Mutex::new(HashMap::new()),
            open_cursors: Mutex::new(HashMap::new()),
            backup_open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stable: AtomicU64::new(0),
            oldest: AtomicU64::new(0),
            all_committed: AtomicU64::new(0),
            recovery_timestamp,
            metadata_salvaged,
            log_enabled: options.log_enabled,
            log_dir: options.log_dir,
            log_seq,
            read_only: options.read_only,
            extensions: options.extensions,
            checkpoints: Mutex::new(Vec::new()),
        });
        if !options.read_only && metadata_salvaged {
            conn.write_meta()?;
        }
        Ok(conn)
    }

    pub fn open_session(self: &Arc<Self>) -> Session {
        Session {
            conn: Arc::clone(self),
        }
    }

    /// Final checkpoint plus shutdown. `use_timestamp=false` discards the
    /// stable association, leaving a zero recovery timestamp for the next
    /// open.
    pub fn close(&self, config: &str) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.read_only {
            return Ok(());
        }
        let pairs = configstr::parse(config);
        let use_timestamp = configstr::get(&pairs, "use_timestamp")
            .map(|v| v == "true")
            .unwrap_or(true);
        self.checkpoint_inner(use_timestamp, false)?;
        info!(root = %self.root.display(), "store closed");
        Ok(())
    }

    pub fn set_timestamp(&self, config: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let pairs = configstr::parse(config);
        let force = configstr::flag(&pairs, "force");
        if let Some(raw) = configstr::get(&pairs, "stable_timestamp") {
            let ts = configstr::parse_hex_timestamp(raw)
                .ok_or_else(|| StoreError::InvalidConfig(format!("bad stable_timestamp: {raw}")))?;
            // Backwards stable posts are rejected silently.
            self.stable.fetch_max(ts, Ordering::SeqCst);
            self.all_committed.fetch_max(ts, Ordering::SeqCst);
        }
        if let Some(raw) = configstr::get(&pairs, "oldest_timestamp") {
            let ts = configstr::parse_hex_timestamp(raw)
                .ok_or_else(|| StoreError::InvalidConfig(format!("bad oldest_timestamp: {raw}")))?;
            if force {
                self.oldest.store(ts, Ordering::SeqCst);
            } else {
                self.oldest.fetch_max(ts, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// `get=recovery`, `get=oldest_reader`, `get=all_committed`. Returns a
    /// zero-padded 16-digit hex string, mirroring what `set_timestamp`
    /// consumes.
    pub fn query_timestamp(&self, config: &str) -> Result<String, StoreError> {
        self.check_open()?;
        let pairs = configstr::parse(config);
        match configstr::get(&pairs, "get") {
            Some("recovery") => Ok(format!("{:016x}", self.recovery_timestamp)),
            Some("oldest_reader") => Err(StoreError::NotFound("no open readers".into())),
            Some("all_committed") => Ok(format!("{:016x}", self.all_committed.load(Ordering::SeqCst))),
            other => Err(StoreError::InvalidConfig(format!(
                "unknown timestamp query: {other:?}"
            ))),
        }
    }

    pub fn reconfigure(&self, config: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let pairs = configstr::parse(config);
        if let Some(compat) = configstr::get(&pairs, "compatibility") {
            let release = configstr::group_get(compat, "release").ok_or_else(|| {
                StoreError::InvalidConfig(format!("bad compatibility group: {compat}"))
            })?;
            let mut meta = self.meta.lock();
            info!(from = meta.version, to = release, "reconfiguring on-disk format");
            meta.version = release.to_string();
            drop(meta);
            self.write_meta()?;
        }
        Ok(())
    }

    /// Discards content newer than the last stable checkpoint, restoring
    /// each captured table image in memory and on disk. Tables never seen
    /// by a stable checkpoint keep their current content.
    pub fn rollback_to_stable(&self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.open_cursors.lock().values().any(|&n| n > 0) {
            return Err(StoreError::Busy("open cursors".into()));
        }
        let stable = self.stable.load(Ordering::SeqCst);
        if stable == 0 {
            return Err(StoreError::RollbackUnavailable(
                "no stable timestamp has been set".into(),
            ));
        }
        let snapshot = self.stable_tables.lock().clone();
        {
            let mut tables = self.tables.lock();
            let meta = self.meta.lock();
            for (uri, data) in snapshot {
                // Dropped since the checkpoint; a rollback does not
                // resurrect schema.
                if !meta.tables.contains_key(&uri) {
                    continue;
                }
                let table_meta = &meta.tables[&uri];
                let path = self.table_path(&uri)?;
                write_table_file(&path, &table_meta.config, &data)?;
                tables.insert(uri, data);
            }
        }
        self.all_committed.store(stable, Ordering::SeqCst);
        Ok(())
    }

    pub fn recovery_timestamp(&self) -> u64 {
        self.recovery_timestamp
    }

    pub fn metadata_salvaged(&self) -> bool {
        self.metadata_salvaged
    }

    pub fn stable_timestamp(&self) -> u64 {
        self.stable.load(Ordering::SeqCst)
    }

    pub fn oldest_timestamp(&self) -> u64 {
        self.oldest.load(Ordering::SeqCst)
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Checkpoints taken over the connection's lifetime, oldest first.
    pub fn checkpoint_history(&self) -> Vec<CheckpointKind> {
        self.checkpoints.lock().clone()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.check_open()?;
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    fn table_path(&self, uri: &str) -> Result<PathBuf, StoreError> {
        let ident = uri
            .strip_prefix("table:")
            .ok_or_else(|| StoreError::InvalidConfig(format!("not a table uri: {uri}")))?;
        Ok(self.root.join(format!("{ident}{TABLE_FILE_SUFFIX}")))
    }

    fn load_table(&self, uri: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if tables.contains_key(uri) {
            return Ok(());
        }
        let path = self.table_path(uri)?;
        if !path.exists() {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        let (_, data) = read_table_file(&path)?;
        tables.insert(uri.to_string(), data);
        Ok(())
    }

    fn checkpoint_inner(&self, use_timestamp: bool, record: bool) -> Result<(), StoreError> {
        let stable = self.stable.load(Ordering::SeqCst);
        let kind = if use_timestamp && stable > 0 {
            CheckpointKind::Stable(stable)
        } else {
            CheckpointKind::Unstable
        };
        {
            let mut meta = self.meta.lock();
            meta.checkpoint_stable = match kind {
                CheckpointKind::Stable(ts) => ts,
                CheckpointKind::Unstable => 0,
            };
        }
        self.write_meta()?;
        let tables = self.tables.lock();
        let meta = self.meta.lock();
        for (uri, data) in tables.iter() {
            if let Some(table_meta) = meta.tables.get(uri) {
                let path = self.table_path(uri)?;
                write_table_file(&path, &table_meta.config, data)?;
            }
        }
        if matches!(kind, CheckpointKind::Stable(_)) {
            *self.stable_tables.lock() = tables.clone();
        }
        drop(meta);
        drop(tables);
        if record {
            self.checkpoints.lock().push(kind);
        }
        Ok(())
    }

    fn write_meta(&self) -> Result<(), StoreError> {
        let meta = self.meta.lock();
        let body = serde_json::to_vec(&*meta)
            .map_err(|e| StoreError::MetadataCorruption(e.to_string()))?;
        drop(meta);
        let crc = crc32c::crc32c(&body);
        let mut out = format!("{crc:08x}\n").into_bytes();
        out.extend_from_slice(&body);
        std::fs::write(self.root.join(META_FILE), out)?;
        Ok(())
    }
}

fn log_file_name(seq: u64) -> String {
    format!("log.{seq:010}")
}

fn read_meta(path: &Path) -> Result<Meta, StoreError> {
    let raw = std::fs::read(path)?;
    let newline = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| StoreError::MetadataCorruption("missing checksum line".into()))?;
    let expected = std::str::from_utf8(&raw[..newline])
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| StoreError::MetadataCorruption("bad checksum line".into()))?;
    let body = &raw[newline + 1..];
    if crc32c::crc32c(body) != expected {
        return Err(StoreError::MetadataCorruption("checksum mismatch".into()));
    }
    serde_json::from_slice(body).map_err(|e| StoreError::MetadataCorruption(e.to_string()))
}

/// Rebuilds the metadata table by scanning data files on disk. Nested
/// database roots (directories carrying their own metadata file) are
/// skipped.
fn salvage_meta(root: &Path) -> Result<Meta, StoreError> {
    fn walk(root: &Path, dir: &Path, meta: &mut Meta) -> Result<(), StoreError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                if path.join(META_FILE).exists() {
                    continue;
                }
                walk(root, &path, meta)?;
            } else if path
                .extension()
                .map(|e| e == "wt")
                .unwrap_or(false)
            {
                if let Ok((config, _)) = read_table_header(&path) {
                    let rel = path
                        .strip_prefix(root)
                        .map_err(|_| StoreError::MetadataCorruption("bad table path".into()))?;
                    let ident = rel
                        .to_string_lossy()
                        .trim_end_matches(TABLE_FILE_SUFFIX)
                        .replace('\\', "/");
                    meta.tables.insert(
                        format!("table:{ident}"),
                        TableMeta {
                            config,
                            log_enabled: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    let mut meta = Meta::new();
    walk(root, root, &mut meta)?;
    info!(tables = meta.tables.len(), "store metadata rebuilt from data files");
    Ok(meta)
}

fn write_table_file(path: &Path, config: &str, data: &TableData) -> Result<(), StoreError> {
    let body = serde_json::to_vec(data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let mut out = Vec::with_capacity(16 + config.len() + body.len() + 4);
    out.extend_from_slice(TABLE_MAGIC);
    out.extend_from_slice(&(config.len() as u32).to_le_bytes());
    out.extend_from_slice(config.as_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    let crc = crc32c::crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    std::fs::write(path, out)?;
    Ok(())
}

/// Reads only the header (magic + create config); used by salvage, which
/// must work even when the record section is torn.
fn read_table_header(path: &Path) -> Result<(String, usize), StoreError> {
    let raw = std::fs::read(path)?;
    if raw.len() < 12 || &raw[..8] != TABLE_MAGIC {
        return Err(StoreError::Unsalvageable(path.display().to_string()));
    }
    let config_len = u32::from_le_bytes(raw[8..12].try_into().expect("slice len")) as usize;
    if raw.len() < 12 + config_len {
        return Err(StoreError::Unsalvageable(path.display().to_string()));
    }
    let config = String::from_utf8(raw[12..12 + config_len].to_vec())
        .map_err(|_| StoreError::Unsalvageable(path.display().to_string()))?;
    Ok((config, 12 + config_len))
}

fn read_table_file(path: &Path) -> Result<(String, TableData), StoreError> {
    let raw = std::fs::read(path)?;
    let (config, header_len) = read_table_header(path)?;
    if raw.len() < header_len + 8 {
        return Err(StoreError::Corrupt(path.display().to_string()));
    }
    let crc_offset = raw.len() - 4;
    let expected = u32::from_le_bytes(raw[crc_offset..].try_into().expect("slice len"));
    if crc32c::crc32c(&raw[..crc_offset]) != expected {
        return Err(StoreError::Corrupt(path.display().to_string()));
    }
    let data_len =
        u32::from_le_bytes(raw[header_len..header_len + 4].try_into().expect("slice len")) as usize;
    if header_len + 4 + data_len > crc_offset {
        return Err(StoreError::Corrupt(path.display().to_string()));
    }
    let body = &raw[header_len + 4..header_len + 4 + data_len];
    let data = serde_json::from_slice(body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok((config, data))
}

/// A unit of work against the store. Sessions are cheap; the adapter caches
/// them to avoid table-handle churn in the engine.
pub struct Session {
    conn: Arc<Connection>,
}

impl Session {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn create(&self, uri: &str, config: &str) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        let path = self.conn.table_path(uri)?;
        {
            let mut meta = self.conn.meta.lock();
            if meta.tables.contains_key(uri) {
                return Err(StoreError::AlreadyExists(uri.to_string()));
            }
            // The data file lands before the metadata entry; a failed write
            // must not leave a phantom table behind.
            write_table_file(&path, config, &TableData::new())?;
            meta.tables.insert(
                uri.to_string(),
                TableMeta {
                    config: config.to_string(),
                    log_enabled: self.conn.log_enabled,
                },
            );
        }
        self.conn.tables.lock().insert(uri.to_string(), TableData::new());
        self.conn.write_meta()?;
        Ok(())
    }

    /// `force` drops a missing data file silently; `checkpoint_wait=false`
    /// is accepted and ignored (the store never blocks drops on a running
    /// checkpoint).
    pub fn drop(&self, uri: &str, config: &str) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        let pairs = configstr::parse(config);
        let force = configstr::flag(&pairs, "force");
        if self
            .conn
            .open_cursors
            .lock()
            .get(uri)
            .copied()
            .unwrap_or(0)
            > 0
        {
            return Err(StoreError::Busy(uri.to_string()));
        }
        {
            let mut meta = self.conn.meta.lock();
            if meta.tables.remove(uri).is_none() {
                return Err(StoreError::NotFound(uri.to_string()));
            }
        }
        self.conn.tables.lock().remove(uri);
        let path = self.conn.table_path(uri)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && force => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        self.conn.write_meta()?;
        Ok(())
    }

    pub fn open_cursor(&self, uri: &str) -> Result<Cursor, StoreError> {
        self.conn.check_open()?;
        if !self.conn.meta.lock().tables.contains_key(uri) {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        *self
            .conn
            .open_cursors
            .lock()
            .entry(uri.to_string())
            .or_insert(0) += 1;
        Ok(Cursor {
            conn: Arc::clone(&self.conn),
            uri: uri.to_string(),
        })
    }

    /// Fails with `Busy` when the table is in use, `NotFound` when the data
    /// file is gone, `Corrupt` when the record section fails its checksum.
    pub fn verify(&self, uri: &str) -> Result<(), StoreError> {
        self.conn.check_open()?;
        if !self.conn.meta.lock().tables.contains_key(uri) {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        if self
            .conn
            .open_cursors
            .lock()
            .get(uri)
            .copied()
            .unwrap_or(0)
            > 0
        {
            return Err(StoreError::Busy(uri.to_string()));
        }
        let path = self.conn.table_path(uri)?;
        if !path.exists() {
            return Err(StoreError::NotFound(uri.to_string()));
        }
        read_table_file(&path).map(|_| ())
    }

    /// Recovers what the header allows: a parseable record section is kept,
    /// a torn one is discarded.
    pub fn salvage(&self, uri: &str) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        let path = self.conn.table_path(uri)?;
        let (config, _) = read_table_header(&path)?;
        let data = match read_table_file(&path) {
            Ok((_, data)) => data,
            Err(_) => TableData::new(),
        };
        write_table_file(&path, &config, &data)?;
        self.conn.tables.lock().insert(uri.to_string(), data);
        Ok(())
    }

    pub fn checkpoint(&self, config: &str) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        let pairs = configstr::parse(config);
        let use_timestamp = configstr::get(&pairs, "use_timestamp")
            .map(|v| v == "true")
            .unwrap_or(true);
        self.conn.checkpoint_inner(use_timestamp, true)
    }

    pub fn log_flush(&self, config: &str) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        if !self.conn.log_enabled {
            return Ok(());
        }
        let pairs = configstr::parse(config);
        let sync = configstr::get(&pairs, "sync").unwrap_or("on");
        let seq = self.conn.log_seq.fetch_add(1, Ordering::SeqCst);
        let dir = self.conn.root.join(&self.conn.log_dir);
        let path = dir.join(log_file_name(1));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(&seq.to_le_bytes())?;
        if sync != "off" {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn set_table_logging(&self, uri: &str, enabled: bool) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        let mut meta = self.conn.meta.lock();
        let table = meta
            .tables
            .get_mut(uri)
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))?;
        table.log_enabled = enabled;
        drop(meta);
        self.conn.write_meta()
    }

    /// Snapshot of the metadata table as `(uri, create config)` pairs.
    pub fn metadata_entries(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.conn.check_open()?;
        let meta = self.conn.meta.lock();
        Ok(meta
            .tables
            .iter()
            .map(|(uri, t)| (uri.clone(), t.config.clone()))
            .collect())
    }

    pub fn has_uri(&self, uri: &str) -> Result<bool, StoreError> {
        self.conn.check_open()?;
        Ok(self.conn.meta.lock().tables.contains_key(uri))
    }

    pub fn table_create_config(&self, uri: &str) -> Result<String, StoreError> {
        self.conn.check_open()?;
        self.conn
            .meta
            .lock()
            .tables
            .get(uri)
            .map(|t| t.config.clone())
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))
    }

    /// Enumerates a consistent set of live files. At most one backup cursor
    /// may be open per connection.
    pub fn open_backup_cursor(&self) -> Result<BackupCursor, StoreError> {
        self.conn.check_open()?;
        if self.conn.backup_open.swap(true, Ordering::SeqCst) {
            return Err(StoreError::BackupInProgress);
        }
        let mut files = vec![META_FILE.to_string()];
        {
            let meta = self.conn.meta.lock();
            for uri in meta.tables.keys() {
                if let Some(ident) = uri.strip_prefix("table:") {
                    files.push(format!("{ident}{TABLE_FILE_SUFFIX}"));
                }
            }
        }
        if self.conn.log_enabled {
            let dir = self.conn.root.join(&self.conn.log_dir);
            if dir.is_dir() {
                let mut logs: Vec<String> = std::fs::read_dir(&dir)?
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_file())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                logs.sort();
                // Journal entries are reported as bare file names; the
                // caller resolves them under the journal directory.
                files.extend(logs);
            }
        }
        Ok(BackupCursor {
            conn: Arc::clone(&self.conn),
            files,
        })
    }

    pub fn put(&self, uri: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.conn.check_writable()?;
        self.conn.load_table(uri)?;
        let mut tables = self.conn.tables.lock();
        let table = tables
            .get_mut(uri)
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))?;
        table.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    pub fn get(&self, uri: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn.check_open()?;
        self.conn.load_table(uri)?;
        let tables = self.conn.tables.lock();
        Ok(tables.get(uri).and_then(|t| t.get(key).cloned()))
    }

    pub fn remove(&self, uri: &str, key: &str) -> Result<bool, StoreError> {
        self.conn.check_writable()?;
        self.conn.load_table(uri)?;
        let mut tables = self.conn.tables.lock();
        let table = tables
            .get_mut(uri)
            .ok_or_else(|| StoreError::NotFound(uri.to_string()))?;
        Ok(table.remove(key).is_some())
    }

    pub fn scan(&self, uri: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.conn.check_open()?;
        self.conn.load_table(uri)?;
        let tables = self.conn.tables.lock();
        Ok(tables
            .get(uri)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// An open cursor pins its table: drops report `Busy` until it is closed.
pub struct Cursor {
    conn: Arc<Connection>,
    uri: String,
}

impl Cursor {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut cursors = self.conn.open_cursors.lock();
        if let Some(count) = cursors.get_mut(&self.uri) {
            *count = count.saturating_sub(1);
        }
    }
}

pub struct BackupCursor {
    conn: Arc<Connection>,
    files: Vec<String>,
}

impl BackupCursor {
    pub fn files(&self) -> &[String] {
        &self.files
    }
}

impl Drop for BackupCursor {
    fn drop(&mut self) {
        self.conn.backup_open.store(false, Ordering::SeqCst);
    }
}
