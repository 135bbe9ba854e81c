//! Object-store destination for hot backups. The SDK is abstracted behind
//! [`ObjectStore`]; the pipeline only needs bucket management, prefix
//! listing, and sized uploads.

use crate::backup::BackupFile;
use crate::error::CaskError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use tracing::{debug, info};

pub const BACKUP_CONTENT_TYPE: &str = "application/octet-stream";

/// Connection parameters for an S3-compatible endpoint.
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreParams {
    pub endpoint: String,
    pub scheme: String,
    pub region: String,
    pub profile: String,
    pub bucket: String,
    /// Key prefix the backup lands under; must be empty apart from its own
    /// marker object.
    pub prefix: String,
    pub use_virtual_addressing: bool,
}

/// Abstract blob uploader. Transport failures surface as
/// [`CaskError::Internal`]; bucket and prefix problems become
/// `InvalidPath` in the pipeline.
pub trait ObjectStore: Send + Sync {
    fn list_buckets(&self) -> Result<Vec<String>, CaskError>;
    fn create_bucket(&self, bucket: &str) -> Result<(), CaskError>;
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CaskError>;
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        content_length: u64,
        content_type: &str,
    ) -> Result<(), CaskError>;
}

/// Streams the populated file list into the object store, creating the
/// bucket when missing and refusing a non-empty target prefix. Partial
/// uploads are not rolled back; the caller retries to a fresh prefix.
pub(crate) fn stream_to_object_store(
    client: &dyn ObjectStore,
    params: &ObjectStoreParams,
    files: &[BackupFile],
) -> Result<(), CaskError> {
    let buckets = client
        .list_buckets()
        .map_err(|e| CaskError::Internal(format!("cannot list buckets on storage server: {e}")))?;
    let bucket_exists = buckets.iter().any(|b| b == &params.bucket);

    if !bucket_exists {
        client.create_bucket(&params.bucket).map_err(|e| {
            CaskError::InvalidPath(format!(
                "cannot create '{}' bucket for the backup: {e}",
                params.bucket
            ))
        })?;
        info!(bucket = params.bucket, "created bucket for backup");
    } else {
        let objects = client
            .list_objects(&params.bucket, &params.prefix)
            .map_err(|e| {
                CaskError::InvalidPath(format!("cannot list objects in the target location: {e}"))
            })?;
        let marker = format!("{}/", params.prefix);
        if objects.iter().any(|key| key != &marker) {
            return Err(CaskError::InvalidPath(format!(
                "target location is not empty: {}/{}",
                params.bucket, params.prefix
            )));
        }
    }

    for file in files {
        let key = file.dst.to_string_lossy().replace('\\', "/");
        debug!(src = %file.src.display(), key, "uploading backup file");
        let source = std::fs::File::open(&file.src).map_err(|e| {
            CaskError::InvalidPath(format!(
                "cannot open file '{}' for backup: {e}",
                file.src.display()
            ))
        })?;
        let mut body = source.take(file.size);
        client
            .put_object(
                &params.bucket,
                &key,
                &mut body,
                file.size,
                BACKUP_CONTENT_TYPE,
            )
            .map_err(|e| {
                CaskError::Internal(format!("cannot backup '{}': {e}", file.src.display()))
            })?;
    }
    info!(
        files = files.len(),
        bucket = params.bucket,
        "hot backup streamed to object store"
    );
    Ok(())
}

/// In-process object store, for embedders and tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.get(key).cloned())
    }

    pub fn insert_object(&self, bucket: &str, key: &str, body: Vec<u8>) {
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.lock().get(bucket).map(BTreeMap::len).unwrap_or(0)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list_buckets(&self) -> Result<Vec<String>, CaskError> {
        Ok(self.buckets.lock().keys().cloned().collect())
    }

    fn create_bucket(&self, bucket: &str) -> Result<(), CaskError> {
        self.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CaskError> {
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .map(|b| {
                b.keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        content_length: u64,
        _content_type: &str,
    ) -> Result<(), CaskError> {
        let mut buf = Vec::with_capacity(content_length as usize);
        body.read_to_end(&mut buf)
            .map_err(|e| CaskError::Internal(e.to_string()))?;
        if buf.len() as u64 != content_length {
            return Err(CaskError::Internal(format!(
                "body length {} does not match content length {content_length}",
                buf.len()
            )));
        }
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{stream_to_object_store, MemoryObjectStore, ObjectStore, ObjectStoreParams};
    use crate::backup::BackupFile;
    use crate::error::CaskErrorCode;

    fn params() -> ObjectStoreParams {
        ObjectStoreParams {
            endpoint: "127.0.0.1:9000".into(),
            scheme: "http".into(),
            bucket: "backups".into(),
            prefix: "run-1".into(),
            ..ObjectStoreParams::default()
        }
    }

    fn one_file(dir: &std::path::Path) -> Vec<BackupFile> {
        let src = dir.join("c1.wt");
        std::fs::write(&src, b"table bytes").expect("write");
        vec![BackupFile {
            src,
            dst: std::path::PathBuf::from("run-1/c1.wt"),
            size: 11,
        }]
    }

    #[test]
    fn creates_bucket_and_uploads_with_declared_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = MemoryObjectStore::default();
        stream_to_object_store(&client, &params(), &one_file(dir.path())).expect("stream");
        assert_eq!(
            client.object("backups", "run-1/c1.wt").expect("object"),
            b"table bytes"
        );
    }

    #[test]
    fn rejects_non_empty_target_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = MemoryObjectStore::default();
        client.create_bucket("backups").expect("bucket");
        client.insert_object("backups", "run-1/stale", b"old".to_vec());
        let err = stream_to_object_store(&client, &params(), &one_file(dir.path()))
            .expect_err("non-empty");
        assert_eq!(err.code(), CaskErrorCode::InvalidPath);
    }

    #[test]
    fn prefix_marker_alone_does_not_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = MemoryObjectStore::default();
        client.create_bucket("backups").expect("bucket");
        client.insert_object("backups", "run-1/", Vec::new());
        stream_to_object_store(&client, &params(), &one_file(dir.path())).expect("stream");
    }
}
