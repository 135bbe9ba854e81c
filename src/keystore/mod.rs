//! Encryption keystore: a secondary store instance dedicated to per-database
//! key material, registered with the main engine as an encryption extension.

pub mod extension;

use crate::config::{CipherMode, EncryptionConfig, MasterKeySource};
use crate::error::CaskError;
use crate::store::Connection;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const KEYDB_DIR: &str = "key.db";
pub const KEYDB_ROTATION_DIR: &str = "key.db.rotation";
pub const KEYDB_BACKUP_DIR: &str = "key.db.rotated";
const KEYDB_LEGACY_DIR: &str = "keydb";

const KEYS_URI: &str = "table:keys";
/// Reserved record holding a digest of the master key so a wrong key is
/// detected before any data key is handed out.
const MASTER_FINGERPRINT_ID: &str = "\u{0}master-fingerprint";

/// External secret store holding the master key (vault-style).
pub trait SecretStore: Send + Sync {
    fn get_master_key(&self) -> Result<Option<[u8; 32]>, CaskError>;
    fn put_master_key(&self, key: &[u8; 32]) -> Result<(), CaskError>;
}

/// In-process secret store, for embedders and tests.
#[derive(Default)]
pub struct MemorySecretStore {
    key: Mutex<Option<[u8; 32]>>,
}

impl SecretStore for MemorySecretStore {
    fn get_master_key(&self) -> Result<Option<[u8; 32]>, CaskError> {
        Ok(*self.key.lock())
    }

    fn put_master_key(&self, key: &[u8; 32]) -> Result<(), CaskError> {
        *self.key.lock() = Some(*key);
        Ok(())
    }
}

pub struct KeyStore {
    conn: Arc<Connection>,
    dir: PathBuf,
    master: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl KeyStore {
    /// Opens (or creates) the keystore database under `dir`, sealed with
    /// `master`.
    pub fn open(dir: &Path, master: Zeroizing<[u8; 32]>) -> Result<Arc<Self>, CaskError> {
        let conn = Connection::open(dir, "create,log=(enabled=true,path=journal)")
            .map_err(CaskError::from)?;
        let session = conn.open_session();
        if !session.has_uri(KEYS_URI).map_err(CaskError::from)? {
            session
                .create(KEYS_URI, "key_format=S,value_format=u")
                .map_err(CaskError::from)?;
        }
        let store = Arc::new(Self {
            conn,
            dir: dir.to_path_buf(),
            master,
        });
        store.verify_master_fingerprint()?;
        Ok(store)
    }

    fn verify_master_fingerprint(&self) -> Result<(), CaskError> {
        let session = self.conn.open_session();
        let fingerprint = Sha256::digest(self.master.as_slice()).to_vec();
        match session
            .get(KEYS_URI, MASTER_FINGERPRINT_ID)
            .map_err(CaskError::from)?
        {
            Some(stored) if stored == fingerprint => Ok(()),
            Some(_) => Err(CaskError::Fatal(
                "keystore master key does not match the key that sealed this keystore".into(),
            )),
            None => {
                session
                    .put(KEYS_URI, MASTER_FINGERPRINT_ID, &fingerprint)
                    .map_err(CaskError::from)?;
                self.checkpoint()
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Looks up the key for `id`, minting and sealing a fresh one when it
    /// does not exist yet.
    pub fn get_key_by_id(&self, id: &str) -> Result<Zeroizing<[u8; 32]>, CaskError> {
        let session = self.conn.open_session();
        if let Some(sealed) = session.get(KEYS_URI, id).map_err(CaskError::from)? {
            return self.unseal(&sealed);
        }
        let mut key = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(key.as_mut());
        let sealed = self.seal(&key)?;
        session.put(KEYS_URI, id, &sealed).map_err(CaskError::from)?;
        self.checkpoint()?;
        info!(id, "minted new database key");
        Ok(key)
    }

    /// Removes the key for `id`. Missing ids are not an error.
    pub fn delete_key(&self, id: &str) -> Result<bool, CaskError> {
        let session = self.conn.open_session();
        let removed = session.remove(KEYS_URI, id).map_err(CaskError::from)?;
        if removed {
            self.checkpoint()?;
        }
        Ok(removed)
    }

    pub fn key_ids(&self) -> Result<Vec<String>, CaskError> {
        let session = self.conn.open_session();
        Ok(session
            .scan(KEYS_URI)
            .map_err(CaskError::from)?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| id != MASTER_FINGERPRINT_ID)
            .collect())
    }

    /// Re-seals every key from `other` under this keystore's master key.
    pub fn clone_keys_from(&self, other: &KeyStore) -> Result<(), CaskError> {
        let session = self.conn.open_session();
        for id in other.key_ids()? {
            let other_session = other.conn.open_session();
            let sealed = other_session
                .get(KEYS_URI, &id)
                .map_err(CaskError::from)?
                .ok_or_else(|| CaskError::NotFound(format!("keystore entry {id}")))?;
            let key = other.unseal(&sealed)?;
            let resealed = self.seal(&key)?;
            session
                .put(KEYS_URI, &id, &resealed)
                .map_err(CaskError::from)?;
        }
        self.checkpoint()
    }

    pub fn store_master_key(&self, secrets: &dyn SecretStore) -> Result<(), CaskError> {
        secrets.put_master_key(&self.master)
    }

    /// Unstable checkpoint of the keystore; timestamps never apply to key
    /// material.
    pub fn checkpoint(&self) -> Result<(), CaskError> {
        let session = self.conn.open_session();
        session
            .checkpoint("use_timestamp=false")
            .map_err(CaskError::from)
    }

    pub fn close(&self) -> Result<(), CaskError> {
        self.conn.close("use_timestamp=false").map_err(CaskError::from)
    }

    /// Extension entry registered with the main engine's open config.
    pub fn extension_config(cipher: CipherMode) -> String {
        format!(
            "local=(entry=keystore_encryption_init,early_load=true,config=(cipher={}))",
            cipher.as_str()
        )
    }

    fn seal(&self, key: &[u8; 32]) -> Result<Vec<u8>, CaskError> {
        let cipher = Aes256Gcm::new_from_slice(self.master.as_slice())
            .map_err(|e| CaskError::Internal(format!("invalid master key: {e}")))?;
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), key.as_slice())
            .map_err(|e| CaskError::Internal(format!("key sealing failed: {e}")))?;
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Zeroizing<[u8; 32]>, CaskError> {
        if sealed.len() < 12 {
            return Err(CaskError::Internal("sealed key blob too small".into()));
        }
        let cipher = Aes256Gcm::new_from_slice(self.master.as_slice())
            .map_err(|e| CaskError::Internal(format!("invalid master key: {e}")))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&sealed[..12]), &sealed[12..])
            .map_err(|e| CaskError::Internal(format!("key unsealing failed: {e}")))?;
        let bytes: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| CaskError::Internal("sealed key has wrong length".into()))?;
        Ok(Zeroizing::new(bytes))
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "keystore close failed");
        }
    }
}

fn resolve_master_key(
    source: &MasterKeySource,
    generate_if_absent: bool,
) -> Result<Zeroizing<[u8; 32]>, CaskError> {
    match source {
        MasterKeySource::File(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                CaskError::InvalidPath(format!("cannot read master key file {}: {e}", path.display()))
            })?;
            parse_hex_key(raw.trim())
        }
        MasterKeySource::Store(secrets) => match secrets.get_master_key()? {
            Some(key) => Ok(Zeroizing::new(key)),
            None if generate_if_absent => {
                let mut key = Zeroizing::new([0u8; 32]);
                rand::rngs::OsRng.fill_bytes(key.as_mut());
                secrets.put_master_key(&key)?;
                info!("generated initial master key and published it to the secret store");
                Ok(key)
            }
            None => Err(CaskError::InvalidOptions(
                "secret store holds no master key".into(),
            )),
        },
    }
}

fn parse_hex_key(raw: &str) -> Result<Zeroizing<[u8; 32]>, CaskError> {
    if raw.len() != 64 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CaskError::InvalidOptions(
            "master key file must hold 32 bytes as hex".into(),
        ));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    for (i, chunk) in raw.as_bytes().chunks_exact(2).enumerate() {
        let hex = std::str::from_utf8(chunk).expect("ascii checked above");
        key[i] = u8::from_str_radix(hex, 16).expect("hex checked above");
    }
    Ok(key)
}

/// Engine-init entry point: resolves the keystore directory (migrating a
/// legacy layout when found), opens the keystore, and performs a master key
/// rotation when requested. A finished rotation terminates with the
/// distinguished `RotationFinished` error so the operator inspects the
/// result before restarting.
pub fn bootstrap(
    engine_root: &Path,
    encryption: &EncryptionConfig,
    directory_per_db: bool,
) -> Result<Arc<KeyStore>, CaskError> {
    let keydb_path = engine_root.join(KEYDB_DIR);
    let mut just_created = false;

    if !keydb_path.exists() {
        let legacy_path = engine_root.join(KEYDB_LEGACY_DIR);
        if !legacy_path.exists() {
            std::fs::create_dir(&keydb_path)?;
            just_created = true;
        } else if !directory_per_db {
            info!(
                from = %legacy_path.display(),
                to = %keydb_path.display(),
                "migrating legacy keystore directory"
            );
            std::fs::rename(&legacy_path, &keydb_path)?;
        } else {
            // With per-db directories the legacy path may hold user data for
            // a database literally named like the old keystore directory;
            // move everything except collection/index data files.
            info!(
                from = %legacy_path.display(),
                to = %keydb_path.display(),
                "migrating legacy keystore directory, filtering user data"
            );
            let mut empty_dirs = Vec::new();
            let mut copied_files = Vec::new();
            copy_keydb_files(
                &legacy_path,
                &keydb_path,
                &mut empty_dirs,
                &mut copied_files,
            )?;
            for file in copied_files {
                std::fs::remove_file(&file)?;
            }
            for dir in empty_dirs {
                std::fs::remove_dir(&dir)?;
            }
        }
    }

    let master = resolve_master_key(&encryption.master_key, true);
    let store = master.and_then(|master| KeyStore::open(&keydb_path, master));
    let store = match store {
        Ok(store) => store,
        Err(e) => {
            if just_created {
                let _ = std::fs::remove_dir_all(&keydb_path);
            }
            return Err(e);
        }
    };

    if encryption.rotate_master_key {
        let secrets = match &encryption.master_key {
            MasterKeySource::Store(secrets) => Arc::clone(secrets),
            MasterKeySource::File(_) => {
                return Err(CaskError::InvalidOptions(
                    "master key rotation requires an external secret store".into(),
                ))
            }
        };
        let rotation_path = engine_root.join(KEYDB_ROTATION_DIR);
        if rotation_path.exists() {
            return Err(CaskError::InvalidOptions(format!(
                "cannot do master key rotation: rotation directory {} already exists",
                rotation_path.display()
            )));
        }
        std::fs::create_dir(&rotation_path)?;

        let mut new_master = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(new_master.as_mut());
        let rotation_store = KeyStore::open(&rotation_path, new_master)?;
        rotation_store.clone_keys_from(&store)?;
        rotation_store.store_master_key(secrets.as_ref())?;

        // Close both instances before the directory swap.
        drop(store);
        drop(rotation_store);

        let backup_path = engine_root.join(KEYDB_BACKUP_DIR);
        if backup_path.exists() {
            std::fs::remove_dir_all(&backup_path)?;
        }
        std::fs::rename(&keydb_path, &backup_path)?;
        std::fs::rename(&rotation_path, &keydb_path)?;
        info!("master key rotation finished");
        return Err(CaskError::RotationFinished);
    }

    Ok(store)
}

/// Recursive filter-copy for the per-db legacy migration. Returns through
/// `empty_dirs`/`copied_files` what the caller must delete afterwards; a
/// directory is empty once nothing excluded remains inside it.
fn copy_keydb_files(
    from: &Path,
    to: &Path,
    empty_dirs: &mut Vec<PathBuf>,
    copied_files: &mut Vec<PathBuf>,
) -> Result<bool, CaskError> {
    let exclude = regex::Regex::new(r"/(collection|index)[-/][^/]+\.wt$")
        .expect("static migration filter");
    copy_keydb_files_inner(from, to, empty_dirs, copied_files, &exclude)
}

fn copy_keydb_files_inner(
    from: &Path,
    to: &Path,
    empty_dirs: &mut Vec<PathBuf>,
    copied_files: &mut Vec<PathBuf>,
    exclude: &regex::Regex,
) -> Result<bool, CaskError> {
    let mut empty = true;
    let mut checked_to = false;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            let child_empty = copy_keydb_files_inner(
                &path,
                &to.join(entry.file_name()),
                empty_dirs,
                copied_files,
                exclude,
            )?;
            if !child_empty {
                empty = false;
            }
        } else {
            let normalized = path.to_string_lossy().replace('\\', "/");
            if exclude.is_match(&normalized) {
                empty = false;
            } else {
                if !checked_to {
                    checked_to = true;
                    if !to.exists() {
                        std::fs::create_dir_all(to)?;
                    }
                }
                std::fs::copy(&path, to.join(entry.file_name()))?;
                copied_files.push(path);
            }
        }
    }
    if empty {
        empty_dirs.push(from.to_path_buf());
    }
    Ok(empty)
}
