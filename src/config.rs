use crate::error::CaskError;
use crate::keystore::SecretStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Cipher used by the engine's encryption extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Aes256Cbc,
    Aes256Gcm,
}

impl CipherMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CipherMode::Aes256Cbc => "AES256-CBC",
            CipherMode::Aes256Gcm => "AES256-GCM",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CaskError> {
        match value {
            "AES256-CBC" => Ok(CipherMode::Aes256Cbc),
            "AES256-GCM" => Ok(CipherMode::Aes256Gcm),
            other => Err(CaskError::InvalidOptions(format!(
                "unknown cipher mode: {other}"
            ))),
        }
    }
}

/// Where the keystore master key comes from.
#[derive(Clone)]
pub enum MasterKeySource {
    /// Locally sealed key file holding 32 bytes as hex.
    File(PathBuf),
    /// External secret store (vault-style).
    Store(Arc<dyn SecretStore>),
}

impl std::fmt::Debug for MasterKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterKeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            MasterKeySource::Store(_) => f.write_str("Store(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub cipher_mode: CipherMode,
    /// Perform a master key rotation at startup and terminate with
    /// `CaskError::RotationFinished` so the operator can inspect the result.
    pub rotate_master_key: bool,
    pub master_key: MasterKeySource,
}

/// Feature-compatibility state of the catalog above the adapter. Drives the
/// downgrade-on-shutdown decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FcvState {
    /// The compatibility document has not been read yet.
    #[default]
    Unset,
    /// Fully downgraded to the previous major release.
    FullyDowngraded,
    Latest,
}

/// Replication role of the node hosting this engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaState {
    pub arbiter: bool,
    pub using_repl_sets: bool,
    pub fcv: FcvState,
}

/// Runtime configuration for a [`CaskEngine`](crate::engine::CaskEngine).
#[derive(Debug, Clone)]
pub struct CaskConfig {
    /// Canonical engine name embedded in table create configs.
    pub canonical_name: String,
    pub cache_size_mb: u64,
    /// Journaling on. Mutually exclusive with `read_only`.
    pub durable: bool,
    pub read_only: bool,
    /// Repair mode: salvage metadata on corruption, allow orphan recovery.
    pub repair: bool,
    pub directory_per_db: bool,
    /// Enables stable checkpointing and snapshot history retention.
    pub enable_majority_read_concern: bool,
    pub session_close_idle_time_secs: u32,
    pub concurrent_write_transactions: u32,
    pub concurrent_read_transactions: u32,
    pub checkpoint_delay_secs: u64,
    /// 0 means the built-in default of 100ms.
    pub journal_commit_interval_ms: u64,
    /// Extra config appended verbatim to the engine open string.
    pub extra_open_config: String,
    pub record_store_options: String,
    pub index_options: String,
    pub encryption: Option<EncryptionConfig>,
    pub replica: ReplicaState,
}

impl Default for CaskConfig {
    fn default() -> Self {
        Self {
            canonical_name: "cask".into(),
            cache_size_mb: 1024,
            durable: true,
            read_only: false,
            repair: false,
            directory_per_db: false,
            enable_majority_read_concern: true,
            session_close_idle_time_secs: if cfg!(debug_assertions) { 5 } else { 300 },
            concurrent_write_transactions: 128,
            concurrent_read_transactions: 128,
            checkpoint_delay_secs: 60,
            journal_commit_interval_ms: 0,
            extra_open_config: String::new(),
            record_store_options: String::new(),
            index_options: String::new(),
            encryption: None,
            replica: ReplicaState::default(),
        }
    }
}

impl CaskConfig {
    pub fn validate(&self) -> Result<(), CaskError> {
        if self.concurrent_write_transactions < 1 || self.concurrent_read_transactions < 1 {
            return Err(CaskError::InvalidOptions(
                "concurrent transaction limits must be at least 1".into(),
            ));
        }
        if self.cache_size_mb < 1 {
            return Err(CaskError::InvalidOptions(
                "cache_size_mb must be at least 1".into(),
            ));
        }
        if self.read_only && self.durable {
            return Err(CaskError::InvalidOptions(
                "a read-only engine cannot run with journaling enabled".into(),
            ));
        }
        if self.read_only && self.repair {
            return Err(CaskError::InvalidOptions(
                "repair mode requires a writable engine".into(),
            ));
        }
        Ok(())
    }

    pub fn journal_commit_interval(&self) -> std::time::Duration {
        let ms = if self.journal_commit_interval_ms == 0 {
            crate::background::flusher::DEFAULT_JOURNAL_DELAY_MS
        } else {
            self.journal_commit_interval_ms
        };
        std::time::Duration::from_millis(ms)
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.durable = false;
        self
    }

    pub fn repair(mut self) -> Self {
        self.repair = true;
        self
    }
}
