//! Engine lifecycle and ident lifecycle: open with version negotiation and
//! metadata salvage, background service wiring, create/drop/verify/rebuild
//! of idents, hot backup entry points, statistics, and clean shutdown with
//! optional file-format downgrade.

pub mod sizestorer;
pub mod version;

use crate::background::checkpointer::{Checkpointer, KeystoreSlot};
use crate::background::flusher::JournalFlusher;
use crate::background::sweeper::SessionSweeper;
use crate::background::WakeSignal;
use crate::backup::object_store::{ObjectStore, ObjectStoreParams};
use crate::backup::{self, BackupReport, JOURNAL_DIR, STORAGE_METADATA_FILE};
use crate::config::CaskConfig;
use crate::dropqueue::DropQueue;
use crate::error::CaskError;
use crate::ident::{data_file_path, ensure_ident_path, uri};
use crate::keystore::{self, KeyStore};
use crate::oplog::OplogManager;
use crate::session::SessionCache;
use crate::store::{BackupCursor, Connection, Session, StoreError};
use crate::tickets::{TicketHolder, TicketStats};
use crate::timestamps::TimestampCoordinator;
use parking_lot::{Mutex, RwLock};
use self::sizestorer::{SizeInfo, SizeStorer, SIZE_STORER_IDENT, SIZE_STORER_URI};
use self::version::{FileVersion, StartupVersion, COMPAT_CURRENT, COMPAT_PREV1, COMPAT_PREV2};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often `have_drops_queued` piggybacks a best-effort size-storer sync.
const SIZE_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct RecordStoreOptions {
    pub capped: bool,
    pub capped_max_size: i64,
    pub capped_max_docs: i64,
    /// Per-collection engine config appended to the create string.
    pub storage_config: String,
}

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    pub key_pattern: String,
    pub storage_config: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub write_tickets: TicketStats,
    pub read_tickets: TicketStats,
    pub recovery_timestamp: u64,
    pub last_stable_checkpoint_timestamp: Option<u64>,
    pub oldest_open_reader_timestamp: Option<u64>,
    pub all_committed_timestamp: u64,
    pub checkpoint_write_conflicts: u64,
    pub queued_drops: usize,
}

struct BackupPin {
    _session: Session,
    _cursor: BackupCursor,
}

pub struct CaskEngine {
    config: CaskConfig,
    path: PathBuf,
    /// Base open config, reused verbatim for the downgrade reopen.
    open_config: String,
    file_version: FileVersion,
    recovery_timestamp: u64,
    conn: Mutex<Option<Arc<Connection>>>,
    cache: Arc<SessionCache>,
    write_tickets: TicketHolder,
    read_tickets: TicketHolder,
    oplog: Arc<OplogManager>,
    timestamps: Arc<TimestampCoordinator>,
    checkpoint_wake: Arc<WakeSignal>,
    sweeper: Mutex<Option<SessionSweeper>>,
    flusher: Mutex<Option<JournalFlusher>>,
    checkpointer: Mutex<Option<Checkpointer>>,
    keystore: Arc<KeystoreSlot>,
    size_storer: Mutex<Option<SizeStorer>>,
    size_sync_tracker: Mutex<Instant>,
    drop_queue: DropQueue,
    backup_pin: Mutex<Option<BackupPin>>,
    /// Held for writing while backup cursors open across both engines.
    write_barrier: RwLock<()>,
    repair_events: Mutex<Vec<String>>,
    idle_secs: Arc<AtomicU32>,
}

impl std::fmt::Debug for CaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaskEngine").field("path", &self.path).finish_non_exhaustive()
    }
}

impl CaskEngine {
    /// Opens the engine under `path`, negotiating the file-format version,
    /// bootstrapping the keystore when encryption is on, and starting the
    /// background services.
    pub fn open(path: &Path, config: CaskConfig) -> Result<Arc<CaskEngine>, CaskError> {
        config.validate()?;
        if !path.is_dir() {
            return Err(CaskError::InvalidPath(format!(
                "engine path {} is not a directory",
                path.display()
            )));
        }

        let journal_path = path.join(JOURNAL_DIR);
        if config.durable && !journal_path.exists() {
            std::fs::create_dir(&journal_path)?;
        }

        let keystore = if let Some(encryption) = &config.encryption {
            Some(keystore::bootstrap(path, encryption, config.directory_per_db)?)
        } else {
            None
        };

        let mut open_config = format!(
            "create,cache_size={}M,session_max=20000,eviction=(threads_min=4,threads_max=4),\
             config_base=false,statistics=(fast),",
            config.cache_size_mb
        );
        if !config.read_only {
            open_config.push_str("log=(enabled=true,archive=true,path=journal),");
            open_config.push_str("file_manager=(close_idle_time=100000),");
        }
        if keystore.is_some() {
            if let Some(encryption) = &config.encryption {
                open_config.push_str(&format!(
                    "extensions=[{}],",
                    KeyStore::extension_config(encryption.cipher_mode)
                ));
            }
        }
        open_config.push_str(&config.extra_open_config);
        if config.read_only {
            open_config.push_str(",readonly=true,");
        }
        if !config.durable && !config.read_only {
            // If we started without the journal but previously used it, open
            // once with the log enabled to run recovery, then drop the
            // journal and reopen without it.
            if journal_path.exists() {
                info!("detected journal files, running recovery from last checkpoint");
                let recovery_conn =
                    Connection::open(path, &open_config).map_err(CaskError::from)?;
                recovery_conn.close("").map_err(CaskError::from)?;
                std::fs::remove_dir_all(&journal_path)?;
            }
            // Overrides the earlier log setting because it comes later in
            // the config string.
            open_config.push_str(",log=(enabled=false),");
        }

        info!(config = open_config, "opening engine");
        let (conn, file_version) = open_store(path, &open_config, config.repair)?;
        let metadata_salvaged = conn.metadata_salvaged();

        let storage_metadata = path.join(STORAGE_METADATA_FILE);
        if !storage_metadata.exists() && !config.read_only {
            let body = serde_json::json!({
                "engine": config.canonical_name,
                "version": env!("CARGO_PKG_VERSION"),
            });
            std::fs::write(&storage_metadata, serde_json::to_vec(&body).expect("static json"))?;
        }

        let recovery_timestamp = {
            let raw = conn
                .query_timestamp("get=recovery")
                .map_err(CaskError::from)?;
            u64::from_str_radix(&raw, 16)
                .map_err(|e| CaskError::Fatal(format!("bad recovery timestamp {raw}: {e}")))?
        };
        info!(recovery_timestamp, "engine recovery timestamp");

        let cache = SessionCache::new(Arc::clone(&conn));
        let oplog = Arc::new(OplogManager::default());
        let checkpoint_wake = Arc::new(WakeSignal::default());
        let timestamps = TimestampCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&oplog),
            Arc::clone(&checkpoint_wake),
            config.enable_majority_read_concern,
        );
        let keystore_slot: Arc<KeystoreSlot> = Arc::new(Mutex::new(keystore));

        let idle_secs = Arc::new(AtomicU32::new(config.session_close_idle_time_secs));
        let sweeper = SessionSweeper::spawn(Arc::clone(&cache), Arc::clone(&idle_secs));

        let flusher = if config.durable {
            Some(JournalFlusher::spawn(
                Arc::clone(&cache),
                config.journal_commit_interval(),
            ))
        } else {
            None
        };

        let checkpointer = if !config.read_only {
            if recovery_timestamp != 0 {
                timestamps.set_initial_data(recovery_timestamp);
                timestamps.set_stable(recovery_timestamp)?;
            }
            Some(Checkpointer::spawn(
                Arc::clone(&cache),
                Arc::clone(&timestamps),
                Arc::clone(&keystore_slot),
                Arc::clone(&checkpoint_wake),
                config.enable_majority_read_concern,
                Duration::from_secs(config.checkpoint_delay_secs),
            ))
        } else {
            None
        };

        let engine = Arc::new(CaskEngine {
            write_tickets: TicketHolder::new(config.concurrent_write_transactions),
            read_tickets: TicketHolder::new(config.concurrent_read_transactions),
            path: path.to_path_buf(),
            open_config,
            file_version,
            recovery_timestamp,
            conn: Mutex::new(Some(Arc::clone(&conn))),
            cache,
            oplog,
            timestamps,
            checkpoint_wake,
            sweeper: Mutex::new(Some(sweeper)),
            flusher: Mutex::new(flusher),
            checkpointer: Mutex::new(checkpointer),
            keystore: keystore_slot,
            size_storer: Mutex::new(None),
            size_sync_tracker: Mutex::new(Instant::now()),
            drop_queue: DropQueue::default(),
            backup_pin: Mutex::new(None),
            write_barrier: RwLock::new(()),
            repair_events: Mutex::new(Vec::new()),
            idle_secs,
            config,
        });

        if metadata_salvaged {
            engine.record_repair_event("engine metadata salvaged");
        }

        let session = conn.open_session();
        if !engine.config.read_only
            && engine.config.repair
            && session.has_uri(SIZE_STORER_URI).map_err(CaskError::from)?
        {
            info!("repairing size cache");
            match engine.salvage_if_needed(SIZE_STORER_URI) {
                Ok(()) | Err(CaskError::DataModifiedByRepair(_)) => {}
                Err(e) => return Err(CaskError::Fatal(format!("size cache repair failed: {e}"))),
            }
        }
        *engine.size_storer.lock() =
            Some(SizeStorer::new(conn, engine.config.read_only)?);

        Ok(engine)
    }

    fn conn(&self) -> Result<Arc<Connection>, CaskError> {
        self.conn
            .lock()
            .clone()
            .ok_or(CaskError::ShutdownInProgress)
    }

    /// The live store connection, for introspection.
    pub fn connection(&self) -> Result<Arc<Connection>, CaskError> {
        self.conn()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn timestamps(&self) -> &Arc<TimestampCoordinator> {
        &self.timestamps
    }

    pub fn oplog_manager(&self) -> &Arc<OplogManager> {
        &self.oplog
    }

    pub fn keystore(&self) -> Option<Arc<KeyStore>> {
        self.keystore.lock().clone()
    }

    pub fn startup_version(&self) -> StartupVersion {
        self.file_version.startup
    }

    pub fn recovery_timestamp(&self) -> u64 {
        self.recovery_timestamp
    }

    pub fn repair_events(&self) -> Vec<String> {
        self.repair_events.lock().clone()
    }

    fn record_repair_event(&self, event: &str) {
        warn!(event, "repair modified data");
        self.repair_events.lock().push(event.to_string());
    }

    pub fn set_session_close_idle_time_secs(&self, secs: u32) {
        self.idle_secs.store(secs, Ordering::SeqCst);
    }

    pub fn resize_write_tickets(&self, capacity: u32) -> Result<(), CaskError> {
        self.write_tickets.resize(capacity)
    }

    pub fn resize_read_tickets(&self, capacity: u32) -> Result<(), CaskError> {
        self.read_tickets.resize(capacity)
    }

    pub fn write_tickets(&self) -> &TicketHolder {
        &self.write_tickets
    }

    pub fn read_tickets(&self) -> &TicketHolder {
        &self.read_tickets
    }

    // ---- timestamps ----------------------------------------------------

    pub fn set_stable_timestamp(&self, timestamp: u64) -> Result<(), CaskError> {
        self.timestamps.set_stable(timestamp)
    }

    pub fn set_oldest_timestamp(&self, timestamp: u64, force: bool) -> Result<(), CaskError> {
        self.timestamps.set_oldest(timestamp, force)
    }

    pub fn set_initial_data_timestamp(&self, timestamp: u64) {
        self.timestamps.set_initial_data(timestamp);
    }

    pub fn supports_recover_to_stable(&self) -> bool {
        self.config.enable_majority_read_concern
    }

    /// Rolls the data back to the stable timestamp: quiesces the journal
    /// flusher and checkpoint coordinator, asks the engine to roll back,
    /// then restarts both seeded from the preserved clocks.
    pub fn recover_to_stable(&self) -> Result<u64, CaskError> {
        if !self.supports_recover_to_stable() {
            return Err(CaskError::UnrecoverableRollback(
                "engine is not keeping data history".into(),
            ));
        }
        if !self.timestamps.can_recover_to_stable() {
            return Err(CaskError::UnrecoverableRollback(format!(
                "no stable timestamp available to recover to: initial data timestamp {}, stable timestamp {}",
                self.timestamps.initial_data(),
                self.timestamps.stable()
            )));
        }

        self.sync_size_info(true)?;
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.shutdown();
        }
        if let Some(checkpointer) = self.checkpointer.lock().take() {
            checkpointer.shutdown();
        }

        let stable = self.timestamps.stable();
        let initial_data = self.timestamps.initial_data();
        info!(stable, initial_data, "rolling back to the stable timestamp");

        let conn = self.conn()?;
        conn.rollback_to_stable().map_err(|e| {
            CaskError::UnrecoverableRollback(format!("error rolling back to stable: {e}"))
        })?;
        self.timestamps.reset_after_rollback();

        // A fresh size storer: the old one still buffers sizes written
        // after the stable point, which the rollback just discarded.
        *self.size_storer.lock() = Some(SizeStorer::new(
            Arc::clone(&conn),
            self.config.read_only,
        )?);

        if self.config.durable {
            *self.flusher.lock() = Some(JournalFlusher::spawn(
                Arc::clone(&self.cache),
                self.config.journal_commit_interval(),
            ));
        }
        self.checkpoint_wake.reset();
        *self.checkpointer.lock() = Some(Checkpointer::spawn(
            Arc::clone(&self.cache),
            Arc::clone(&self.timestamps),
            Arc::clone(&self.keystore),
            Arc::clone(&self.checkpoint_wake),
            self.config.enable_majority_read_concern,
            Duration::from_secs(self.config.checkpoint_delay_secs),
        ));

        Ok(stable)
    }

    // ---- checkpoint & durability ---------------------------------------

    /// One synchronous checkpoint-coordinator pass. Forced-flush paths and
    /// tests use this instead of waiting out the tick interval.
    pub fn checkpoint_once(&self) -> Result<(), CaskError> {
        let checkpointer = self.checkpointer.lock();
        match checkpointer.as_ref() {
            Some(checkpointer) => checkpointer.tick(),
            None => Err(CaskError::Internal(
                "checkpoint coordinator is not running".into(),
            )),
        }
    }

    /// Syncs size info and forces a durable checkpoint (stable when
    /// journaling, full otherwise).
    pub fn flush_all_files(&self) -> Result<(), CaskError> {
        debug!("flushing all files");
        self.sync_size_info(false)?;
        self.cache.wait_until_durable(true, self.config.durable)
    }

    /// Kicks the journal flusher when a replication batch finishes so the
    /// batch becomes durable without waiting out the commit interval.
    pub fn replication_batch_complete(&self) {
        if let Some(flusher) = self.flusher.lock().as_ref() {
            flusher.kick();
        }
    }

    pub fn start_oplog_manager(&self, oplog_uri: &str) {
        self.oplog.start(oplog_uri);
    }

    pub fn halt_oplog_manager(&self) {
        self.oplog.halt();
    }

    /// Best-effort: write conflicts are retried later, and a full cache
    /// under a non-durable engine only costs sizes, not data.
    pub fn sync_size_info(&self, sync: bool) -> Result<(), CaskError> {
        let size_storer = self.size_storer.lock();
        let Some(size_storer) = size_storer.as_ref() else {
            return Ok(());
        };
        match size_storer.flush(sync) {
            Ok(()) => Ok(()),
            Err(CaskError::WriteConflict) => Ok(()),
            Err(CaskError::MemoryLimit(reason)) if !self.config.durable => {
                error!(reason, "size storer failed to sync cache, ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn store_ident_size(&self, ident: &str, info: SizeInfo) {
        if let Some(size_storer) = self.size_storer.lock().as_ref() {
            size_storer.store(&uri(ident), info);
        }
    }

    pub fn load_ident_size(&self, ident: &str) -> Result<SizeInfo, CaskError> {
        let size_storer = self.size_storer.lock();
        match size_storer.as_ref() {
            Some(size_storer) => size_storer.load(&uri(ident)),
            None => Ok(SizeInfo::default()),
        }
    }

    // ---- ident lifecycle -----------------------------------------------

    pub fn create_record_store(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
    ) -> Result<(), CaskError> {
        ensure_ident_path(&self.path, ident)?;
        let config = generate_record_store_config(
            &self.config.canonical_name,
            ns,
            options,
            &self.config.record_store_options,
        )?;
        let table_uri = uri(ident);
        debug!(ns, uri = table_uri, config, "creating record store");
        let conn = self.conn()?;
        let session = conn.open_session();
        session
            .create(&table_uri, &config)
            .map_err(map_create_err)?;
        Ok(())
    }

    pub fn create_sorted_index(
        &self,
        ns: &str,
        ident: &str,
        desc: &IndexDescriptor,
    ) -> Result<(), CaskError> {
        ensure_ident_path(&self.path, ident)?;
        let config = generate_index_config(
            &self.config.canonical_name,
            ns,
            desc,
            &self.config.index_options,
        )?;
        let table_uri = uri(ident);
        debug!(ns, uri = table_uri, config, "creating sorted index");
        let conn = self.conn()?;
        let session = conn.open_session();
        session
            .create(&table_uri, &config)
            .map_err(map_create_err)?;
        Ok(())
    }

    /// Busy drops are queued for retry and reported as success; the ident
    /// disappears once a queue drain gets the table exclusively.
    pub fn drop_ident(&self, ident: &str) -> Result<(), CaskError> {
        let table_uri = uri(ident);
        self.cache.close_all_cursors(&table_uri);

        let conn = self.conn()?;
        let session = conn.open_session();
        let result = session.drop(&table_uri, "force,checkpoint_wait=false");
        debug!(uri = table_uri, ok = result.is_ok(), "drop ident");
        match result {
            Ok(()) => {
                if let Some(size_storer) = self.size_storer.lock().as_ref() {
                    size_storer.remove(&table_uri)?;
                }
                Ok(())
            }
            Err(StoreError::Busy(_)) => {
                self.drop_queue.enqueue_front(table_uri);
                self.cache
                    .close_cursors_for_queued_drops(&self.drop_queue.snapshot());
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(CaskError::Fatal(format!("drop of {table_uri} failed: {e}"))),
        }
    }

    /// Throttled probe; also piggybacks a periodic best-effort size sync.
    pub fn have_drops_queued(&self) -> bool {
        if !self.config.read_only {
            let mut tracker = self.size_sync_tracker.lock();
            if tracker.elapsed() >= SIZE_SYNC_INTERVAL {
                *tracker = Instant::now();
                drop(tracker);
                let _ = self.sync_size_info(false);
            }
        }
        self.drop_queue.have_drops_queued()
    }

    pub fn drop_some_queued_idents(&self) -> Result<(), CaskError> {
        let conn = self.conn()?;
        let session = conn.open_session();
        self.drop_queue.drop_some_queued_idents(&session)
    }

    pub fn queued_drops(&self) -> Vec<String> {
        self.drop_queue.snapshot()
    }

    pub fn has_ident(&self, ident: &str) -> Result<bool, CaskError> {
        let conn = self.conn()?;
        let session = conn.open_session();
        session.has_uri(&uri(ident)).map_err(CaskError::from)
    }

    pub fn all_idents(&self) -> Result<Vec<String>, CaskError> {
        let conn = self.conn()?;
        let session = conn.open_session();
        Ok(session
            .metadata_entries()
            .map_err(CaskError::from)?
            .into_iter()
            .filter_map(|(entry_uri, _)| {
                crate::ident::ident_from_uri(&entry_uri).map(str::to_string)
            })
            .filter(|ident| ident != SIZE_STORER_IDENT)
            .collect())
    }

    pub fn ident_size(&self, ident: &str) -> Result<u64, CaskError> {
        let path = data_file_path(&self.path, ident);
        Ok(std::fs::metadata(&path)
            .map_err(|_| CaskError::NotFound(format!("data file for ident {ident}")))?
            .len())
    }

    pub fn data_file_path_for_ident(&self, ident: &str) -> Option<PathBuf> {
        let path = data_file_path(&self.path, ident);
        path.exists().then_some(path)
    }

    /// Rename hook: flush sizes so the renamed ident starts from accurate
    /// counts.
    pub fn ok_to_rename(&self, _from_ns: &str, _to_ns: &str, _ident: &str) -> Result<(), CaskError> {
        self.sync_size_info(false)
    }

    /// Verify-then-salvage for a single ident, called from repair paths.
    pub fn repair_ident(&self, ident: &str) -> Result<(), CaskError> {
        let table_uri = uri(ident);
        self.cache.close_all_cursors(&table_uri);
        ensure_ident_path(&self.path, ident)?;
        self.salvage_if_needed(&table_uri)
    }

    fn salvage_if_needed(&self, table_uri: &str) -> Result<(), CaskError> {
        let conn = self.conn()?;
        let session = conn.open_session();
        match session.verify(table_uri) {
            Ok(()) => {
                info!(uri = table_uri, "verify succeeded, not salvaging");
                return Ok(());
            }
            Err(StoreError::Busy(_)) => {
                // The table is in use; nothing is repairable right now, and
                // that is only a problem if other errors follow.
                warn!(uri = table_uri, "verify returned busy, the table is being accessed");
                return Ok(());
            }
            Err(StoreError::NotFound(_)) => {
                warn!(
                    uri = table_uri,
                    "data file is missing, attempting to drop and re-create the table"
                );
                return self.rebuild_ident(&session, table_uri);
            }
            Err(e) => {
                info!(uri = table_uri, error = %e, "verify failed, running a salvage operation");
            }
        }

        match session.salvage(table_uri) {
            Ok(()) => {
                self.record_repair_event(&format!("salvaged data for {table_uri}"));
                Err(CaskError::DataModifiedByRepair(format!(
                    "salvaged data for {table_uri}"
                )))
            }
            Err(e) => {
                warn!(
                    uri = table_uri,
                    error = %e,
                    "salvage failed, the file will be moved aside and the ident rebuilt"
                );
                self.rebuild_ident(&session, table_uri)
            }
        }
    }

    /// Moves the data file aside as `.corrupt`, then re-creates the ident
    /// empty from its saved metadata.
    fn rebuild_ident(&self, session: &Session, table_uri: &str) -> Result<(), CaskError> {
        if !self.config.repair {
            return Err(CaskError::Fatal(format!(
                "cannot rebuild {table_uri} outside repair mode"
            )));
        }
        let ident = crate::ident::ident_from_uri(table_uri)
            .ok_or_else(|| CaskError::Internal(format!("not a table uri: {table_uri}")))?;

        if let Some(file_path) = self.data_file_path_for_ident(ident) {
            let corrupt = file_path.with_extension("wt.corrupt");
            warn!(
                from = %file_path.display(),
                to = %corrupt.display(),
                "moving data file to backup"
            );
            fsync_rename(&file_path, &corrupt)?;
        }

        warn!(ident, "rebuilding ident");
        // Reads the saved create config from the metadata table; safe after
        // moving the file because the data file itself is never consulted.
        let create_config = session
            .table_create_config(table_uri)
            .map_err(CaskError::from)?;
        session
            .drop(table_uri, "force,checkpoint_wait=false")
            .map_err(CaskError::from)?;
        session
            .create(table_uri, &create_config)
            .map_err(CaskError::from)?;
        info!(uri = table_uri, "successfully re-created ident");
        self.record_repair_event(&format!("re-created empty data file for {table_uri}"));
        Err(CaskError::DataModifiedByRepair(format!(
            "re-created empty data file for {table_uri}"
        )))
    }

    /// Adopts a data file that exists on disk without a metadata entry:
    /// parks the orphan, creates a fresh record store under the same ident,
    /// swaps the orphan back in, and salvages it.
    pub fn recover_orphaned_ident(
        &self,
        ns: &str,
        ident: &str,
        options: &RecordStoreOptions,
    ) -> Result<(), CaskError> {
        if !self.config.repair {
            return Err(CaskError::Fatal(
                "orphan recovery requires repair mode".into(),
            ));
        }
        let Some(ident_file) = self.data_file_path_for_ident(ident) else {
            return Err(CaskError::NotFound(format!(
                "data file for ident {ident} not found"
            )));
        };

        let tmp_file = ident_file.with_extension("wt.tmp");
        info!(
            from = %ident_file.display(),
            to = %tmp_file.display(),
            "renaming data file to temporary file"
        );
        fsync_rename(&ident_file, &tmp_file)?;

        info!(ns, ident, "creating new record store for orphan recovery");
        self.create_record_store(ns, ident, options)?;

        info!(file = %ident_file.display(), "moving orphaned data file back");
        std::fs::remove_file(&ident_file)?;
        fsync_parent_dir(&ident_file)?;
        fsync_rename(&tmp_file, &ident_file)?;

        info!(ident, "salvaging ident");
        let conn = self.conn()?;
        let session = conn.open_session();
        let table_uri = uri(ident);
        match session.salvage(&table_uri) {
            Ok(()) => {
                self.record_repair_event(&format!("salvaged data for ident {ident}"));
                Err(CaskError::DataModifiedByRepair(format!(
                    "salvaged data for ident {ident}"
                )))
            }
            Err(e) => {
                warn!(error = %e, "could not salvage data, rebuilding ident");
                self.rebuild_ident(&session, &table_uri)
            }
        }
    }

    /// Deletes the encryption key for a dropped database. Called from
    /// commit paths, so failures are logged rather than surfaced.
    pub fn drop_database_keys(&self, db: &str) {
        if let Some(keystore) = self.keystore() {
            if let Err(e) = keystore.delete_key(db) {
                error!(db, error = %e, "failed to delete encryption key for dropped database");
            }
        }
    }

    // ---- backup --------------------------------------------------------

    /// Pins a backup cursor so the file set stays stable while an external
    /// tool copies files. Fails while another backup is active.
    pub fn begin_backup(&self) -> Result<(), CaskError> {
        let mut pin = self.backup_pin.lock();
        if pin.is_some() {
            return Err(CaskError::Busy("a backup is already active".into()));
        }
        let conn = self.conn()?;
        let session = conn.open_session();
        let cursor = session.open_backup_cursor().map_err(CaskError::from)?;
        *pin = Some(BackupPin {
            _session: session,
            _cursor: cursor,
        });
        Ok(())
    }

    pub fn end_backup(&self) {
        self.backup_pin.lock().take();
    }

    /// Streams a consistent snapshot of the engine (and keystore) into a
    /// local directory. The destination must already exist.
    pub fn hot_backup(&self, dest: &Path) -> Result<BackupReport, CaskError> {
        if !dest.is_dir() {
            return Err(CaskError::InvalidPath(format!(
                "backup destination {} is not a directory",
                dest.display()
            )));
        }
        let conn = self.conn()?;
        let keystore = self.keystore();
        let files = backup::populate_file_list(
            &conn,
            &self.path,
            dest,
            keystore.as_ref(),
            &self.write_barrier,
        )?;
        backup::copy_to_local(&files)?;
        Ok(BackupReport {
            backup_id: uuid::Uuid::new_v4().to_string(),
            files,
        })
    }

    /// Streams the same snapshot to an S3-compatible object store under
    /// `params.prefix`.
    pub fn hot_backup_to_object_store(
        &self,
        client: &dyn ObjectStore,
        params: &ObjectStoreParams,
    ) -> Result<BackupReport, CaskError> {
        let conn = self.conn()?;
        let keystore = self.keystore();
        let files = backup::populate_file_list(
            &conn,
            &self.path,
            Path::new(&params.prefix),
            keystore.as_ref(),
            &self.write_barrier,
        )?;
        backup::object_store::stream_to_object_store(client, params, &files)?;
        Ok(BackupReport {
            backup_id: uuid::Uuid::new_v4().to_string(),
            files,
        })
    }

    // ---- statistics ----------------------------------------------------

    pub fn status(&self) -> Result<EngineStatus, CaskError> {
        let conn = self.conn()?;
        let oldest_open_reader = match conn.query_timestamp("get=oldest_reader") {
            Ok(raw) => u64::from_str_radix(&raw, 16).ok(),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(CaskError::from(e)),
        };
        let all_committed = conn
            .query_timestamp("get=all_committed")
            .map_err(CaskError::from)
            .and_then(|raw| {
                u64::from_str_radix(&raw, 16)
                    .map_err(|e| CaskError::Internal(format!("bad all_committed {raw}: {e}")))
            })?;
        let last_stable_checkpoint = if self.supports_recover_to_stable() {
            match self.timestamps.last_stable_checkpoint() {
                0 if self.recovery_timestamp != 0 => Some(self.recovery_timestamp),
                0 => None,
                ts => Some(ts),
            }
        } else {
            None
        };
        Ok(EngineStatus {
            write_tickets: self.write_tickets.stats(),
            read_tickets: self.read_tickets.stats(),
            recovery_timestamp: self.recovery_timestamp,
            last_stable_checkpoint_timestamp: last_stable_checkpoint,
            oldest_open_reader_timestamp: oldest_open_reader,
            all_committed_timestamp: all_committed,
            checkpoint_write_conflicts: self
                .checkpointer
                .lock()
                .as_ref()
                .map(Checkpointer::write_conflict_count)
                .unwrap_or(0),
            queued_drops: self.drop_queue.len(),
        })
    }

    // ---- shutdown ------------------------------------------------------

    /// Clean shutdown. Idempotent: the second call is a no-op. After it
    /// returns, no background thread is running and the engine handle is
    /// gone.
    pub fn clean_shutdown(&self) -> Result<(), CaskError> {
        if self.conn.lock().is_none() {
            return Ok(());
        }
        info!("engine shutting down");

        if !self.config.read_only {
            self.sync_size_info(true)?;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            debug!("shutting down session sweeper thread");
            sweeper.shutdown();
        }
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.shutdown();
        }
        if let Some(checkpointer) = self.checkpointer.lock().take() {
            checkpointer.shutdown();
            debug!(
                stable = self.timestamps.stable(),
                initial_data = self.timestamps.initial_data(),
                "shutdown timestamps"
            );
        }

        *self.size_storer.lock() = None;
        self.backup_pin.lock().take();
        self.cache.mark_shutting_down();

        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };

        let should_downgrade = self.file_version.should_downgrade(
            self.config.read_only,
            &self.config.replica,
            self.recovery_timestamp != 0,
        );
        if !should_downgrade {
            let close_config = if self.config.enable_majority_read_concern {
                "leak_memory=true,use_timestamp=true"
            } else {
                "leak_memory=true,use_timestamp=false"
            };
            conn.close(close_config).map_err(CaskError::from)?;
        } else {
            info!("downgrading engine data files");
            // Close with an unstable checkpoint and reopen: this clears any
            // leftover cursors that would block the downgrade. Then enable
            // logging on every table before lowering the format.
            conn.close("leak_memory=true,use_timestamp=false")
                .map_err(CaskError::from)?;
            drop(conn);

            let reopened =
                Connection::open(&self.path, &self.open_config).map_err(CaskError::from)?;
            let session = reopened.open_session();
            for (entry_uri, _) in session.metadata_entries().map_err(CaskError::from)? {
                if entry_uri.starts_with(crate::ident::TABLE_URI_PREFIX) {
                    session
                        .set_table_logging(&entry_uri, true)
                        .map_err(CaskError::from)?;
                }
            }
            let downgrade_config = self.file_version.downgrade_config(self.config.replica.fcv);
            debug!(config = downgrade_config, "downgrade compatibility configuration");
            reopened
                .reconfigure(downgrade_config)
                .map_err(CaskError::from)?;
            reopened
                .close("leak_memory=true,use_timestamp=false")
                .map_err(CaskError::from)?;
        }

        *self.keystore.lock() = None;
        Ok(())
    }
}

impl Drop for CaskEngine {
    fn drop(&mut self) {
        if let Err(e) = self.clean_shutdown() {
            error!(error = %e, "engine shutdown failed");
        }
    }
}

/// Trial-opens with successively lower compatibility floors, salvaging the
/// metadata as a last resort in repair mode.
fn open_store(
    path: &Path,
    open_config: &str,
    repair: bool,
) -> Result<(Arc<Connection>, FileVersion), CaskError> {
    let attempts = [
        (COMPAT_CURRENT, StartupVersion::Current),
        (COMPAT_PREV1, StartupVersion::Release30),
        (COMPAT_PREV2, StartupVersion::Release29),
    ];

    let mut corruption: Option<String> = None;
    for (compat, startup) in attempts {
        let config = format!("{open_config},compatibility=(require_min=\"{compat}\")");
        match Connection::open(path, &config) {
            Ok(conn) => return Ok((conn, FileVersion { startup })),
            Err(StoreError::VersionMismatch { required, on_disk }) => {
                debug!(required, on_disk, "compatibility floor not satisfied, retrying lower");
            }
            Err(StoreError::MetadataCorruption(reason)) => {
                warn!(reason, "engine metadata corruption detected");
                corruption = Some(reason);
                break;
            }
            Err(e) => {
                return Err(CaskError::Fatal(format!(
                    "engine failed to start: {e}"
                )));
            }
        }
    }

    let Some(reason) = corruption else {
        return Err(CaskError::Fatal(
            "failed to start up the engine under any compatibility version".into(),
        ));
    };
    if !repair {
        return Err(CaskError::Fatal(format!(
            "engine metadata is unrecoverable outside repair mode: {reason}"
        )));
    }

    warn!("attempting to salvage engine metadata");
    let config = format!("{open_config},salvage=true");
    match Connection::open(path, &config) {
        Ok(conn) => Ok((
            conn,
            FileVersion {
                startup: StartupVersion::Current,
            },
        )),
        Err(e) => Err(CaskError::Fatal(format!(
            "failed to salvage engine metadata: {e}"
        ))),
    }
}

fn map_create_err(e: StoreError) -> CaskError {
    match e {
        StoreError::AlreadyExists(what) => {
            CaskError::InvalidOptions(format!("{what} already exists"))
        }
        StoreError::InvalidConfig(reason) => CaskError::InvalidOptions(reason),
        StoreError::Io(e) => CaskError::Io(e),
        other => CaskError::from(other),
    }
}

fn generate_record_store_config(
    canonical_name: &str,
    ns: &str,
    options: &RecordStoreOptions,
    extra: &str,
) -> Result<String, CaskError> {
    if options.capped && options.capped_max_size < 0 {
        return Err(CaskError::InvalidOptions(
            "capped_max_size must be non-negative".into(),
        ));
    }
    let mut config = String::from(
        "type=file,memory_page_max=10m,split_pct=90,leaf_value_max=64MB,checksum=on,",
    );
    config.push_str("key_format=q,value_format=u,");
    config.push_str(&format!(
        "app_metadata=(formatVersion=1,engine={canonical_name},ns={ns}"
    ));
    if options.capped {
        let max_size = if options.capped_max_size > 0 {
            options.capped_max_size
        } else {
            4096
        };
        config.push_str(&format!(",capped=true,cappedMaxSize={max_size}"));
        if options.capped_max_docs > 0 {
            config.push_str(&format!(",cappedMaxDocs={}", options.capped_max_docs));
        }
    }
    config.push_str("),");
    config.push_str(extra);
    config.push_str(&options.storage_config);
    Ok(config)
}

fn generate_index_config(
    canonical_name: &str,
    ns: &str,
    desc: &IndexDescriptor,
    extra: &str,
) -> Result<String, CaskError> {
    if desc.name.is_empty() {
        return Err(CaskError::InvalidOptions("index name cannot be empty".into()));
    }
    let mut config =
        String::from("type=file,internal_page_max=16k,leaf_page_max=16k,checksum=on,");
    config.push_str("key_format=u,value_format=u,");
    config.push_str(&format!(
        "app_metadata=(formatVersion=8,engine={canonical_name},ns={ns},name={},unique={},key={}),",
        desc.name, desc.unique, desc.key_pattern
    ));
    config.push_str(extra);
    config.push_str(&desc.storage_config);
    Ok(config)
}

fn fsync_rename(from: &Path, to: &Path) -> Result<(), CaskError> {
    std::fs::rename(from, to)?;
    fsync_parent_dir(to)
}

/// Directory fsync so a rename survives a crash. Directories cannot be
/// synced on every platform; best effort elsewhere.
fn fsync_parent_dir(path: &Path) -> Result<(), CaskError> {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        std::fs::File::open(parent)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
