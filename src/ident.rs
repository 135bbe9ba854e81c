//! Ident string handling: URI mapping, nested directory creation, data file
//! paths.

use crate::error::CaskError;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const TABLE_URI_PREFIX: &str = "table:";

/// Maps an ident to its engine URI.
pub fn uri(ident: &str) -> String {
    format!("{TABLE_URI_PREFIX}{ident}")
}

/// Inverse of [`uri`]. Returns `None` for non-table URIs.
pub fn ident_from_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(TABLE_URI_PREFIX)
}

/// Path of the data file backing `ident` under the engine root.
pub fn data_file_path(root: &Path, ident: &str) -> PathBuf {
    root.join(format!("{ident}.wt"))
}

/// Creates the nested directories implied by `/`-separated ident segments.
/// The engine's create call expects every parent directory to pre-exist.
pub fn ensure_ident_path(root: &Path, ident: &str) -> Result<(), CaskError> {
    let mut start = 0;
    while let Some(idx) = ident[start..].find('/') {
        let dir = &ident[..start + idx];
        let subdir = root.join(dir);
        if !subdir.exists() {
            debug!(directory = dir, "creating ident subdirectory");
            match std::fs::create_dir(&subdir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(CaskError::Io(e)),
            }
        }
        start += idx + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{data_file_path, ensure_ident_path, ident_from_uri, uri};

    #[test]
    fn uri_roundtrip() {
        assert_eq!(uri("c1"), "table:c1");
        assert_eq!(ident_from_uri("table:c1"), Some("c1"));
        assert_eq!(ident_from_uri("metadata:"), None);
    }

    #[test]
    fn nested_ident_creates_each_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        ensure_ident_path(dir.path(), "db1/coll/index-1").expect("ensure");
        assert!(dir.path().join("db1").is_dir());
        assert!(dir.path().join("db1/coll").is_dir());
        // The final segment names the file, not a directory.
        assert!(!dir.path().join("db1/coll/index-1").exists());
    }

    #[test]
    fn plain_ident_touches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        ensure_ident_path(dir.path(), "c1").expect("ensure");
        assert_eq!(
            std::fs::read_dir(dir.path()).expect("read_dir").count(),
            0
        );
    }

    #[test]
    fn existing_directories_are_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("db1")).expect("mkdir");
        ensure_ident_path(dir.path(), "db1/coll").expect("ensure");
        assert_eq!(
            data_file_path(dir.path(), "db1/coll"),
            dir.path().join("db1/coll.wt")
        );
    }
}
