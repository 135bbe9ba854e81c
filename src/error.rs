use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaskErrorCode {
    Io,
    InvalidPath,
    InvalidOptions,
    Busy,
    NotFound,
    DataModifiedByRepair,
    UnrecoverableRollback,
    MemoryLimit,
    ShutdownInProgress,
    WriteConflict,
    RotationFinished,
    Internal,
    Fatal,
}

impl CaskErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaskErrorCode::Io => "io",
            CaskErrorCode::InvalidPath => "invalid_path",
            CaskErrorCode::InvalidOptions => "invalid_options",
            CaskErrorCode::Busy => "busy",
            CaskErrorCode::NotFound => "not_found",
            CaskErrorCode::DataModifiedByRepair => "data_modified_by_repair",
            CaskErrorCode::UnrecoverableRollback => "unrecoverable_rollback",
            CaskErrorCode::MemoryLimit => "memory_limit",
            CaskErrorCode::ShutdownInProgress => "shutdown_in_progress",
            CaskErrorCode::WriteConflict => "write_conflict",
            CaskErrorCode::RotationFinished => "rotation_finished",
            CaskErrorCode::Internal => "internal",
            CaskErrorCode::Fatal => "fatal",
        }
    }
}

/// Errors surfaced by the engine adapter.
///
/// `Busy` and `WriteConflict` are transient and handled internally (queued
/// drops, retried checkpoints); they only appear in return values of the
/// low-level helpers that produce them.
#[derive(Debug, Error)]
pub enum CaskError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("resource busy: {0}")]
    Busy(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("data modified by repair: {0}")]
    DataModifiedByRepair(String),
    #[error("unrecoverable rollback: {0}")]
    UnrecoverableRollback(String),
    #[error("memory limit exceeded: {0}")]
    MemoryLimit(String),
    #[error("shutdown in progress")]
    ShutdownInProgress,
    #[error("write conflict")]
    WriteConflict,
    #[error("master key rotation finished successfully")]
    RotationFinished,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("fatal storage error: {0}")]
    Fatal(String),
}

impl From<crate::store::StoreError> for CaskError {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match e {
            StoreError::Io(e) => CaskError::Io(e),
            StoreError::Busy(what) => CaskError::Busy(what),
            StoreError::NotFound(what) => CaskError::NotFound(what),
            StoreError::AlreadyExists(what) => {
                CaskError::InvalidOptions(format!("{what} already exists"))
            }
            StoreError::MetadataCorruption(reason) => {
                CaskError::Fatal(format!("engine metadata corruption: {reason}"))
            }
            StoreError::VersionMismatch { required, on_disk } => CaskError::Fatal(format!(
                "on-disk format {on_disk} does not satisfy require_min {required}"
            )),
            StoreError::Corrupt(what) => CaskError::Internal(format!("table data corrupt: {what}")),
            StoreError::Unsalvageable(what) => {
                CaskError::Internal(format!("unsalvageable: {what}"))
            }
            StoreError::InvalidConfig(reason) => CaskError::InvalidOptions(reason),
            StoreError::BackupInProgress => {
                CaskError::Busy("a backup cursor is already open".into())
            }
            StoreError::RollbackUnavailable(reason) => CaskError::UnrecoverableRollback(reason),
            StoreError::ConnectionClosed => CaskError::ShutdownInProgress,
            StoreError::ReadOnly => {
                CaskError::InvalidOptions("engine is opened read-only".into())
            }
        }
    }
}

impl CaskError {
    pub fn code(&self) -> CaskErrorCode {
        match self {
            CaskError::Io(_) => CaskErrorCode::Io,
            CaskError::InvalidPath(_) => CaskErrorCode::InvalidPath,
            CaskError::InvalidOptions(_) => CaskErrorCode::InvalidOptions,
            CaskError::Busy(_) => CaskErrorCode::Busy,
            CaskError::NotFound(_) => CaskErrorCode::NotFound,
            CaskError::DataModifiedByRepair(_) => CaskErrorCode::DataModifiedByRepair,
            CaskError::UnrecoverableRollback(_) => CaskErrorCode::UnrecoverableRollback,
            CaskError::MemoryLimit(_) => CaskErrorCode::MemoryLimit,
            CaskError::ShutdownInProgress => CaskErrorCode::ShutdownInProgress,
            CaskError::WriteConflict => CaskErrorCode::WriteConflict,
            CaskError::RotationFinished => CaskErrorCode::RotationFinished,
            CaskError::Internal(_) => CaskErrorCode::Internal,
            CaskError::Fatal(_) => CaskErrorCode::Fatal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, CaskError::ShutdownInProgress)
    }
}
