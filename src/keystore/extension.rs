//! The small ABI the engine's encryption extension consumes: pseudo-random
//! fill, IV generation, key-by-id lookup, and key deletion.

use crate::config::CipherMode;
use crate::error::CaskError;
use crate::keystore::KeyStore;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

pub const GCM_IV_LEN: usize = 12;
pub const CBC_IV_LEN: usize = 16;

pub struct KeystoreExtension {
    store: Arc<KeyStore>,
    cipher: CipherMode,
    /// GCM IVs are a random 4-byte prefix plus a counter; a repeated IV
    /// under the same key would void the authentication guarantee.
    iv_prefix: [u8; 4],
    iv_counter: AtomicU64,
}

impl KeystoreExtension {
    pub fn new(store: Arc<KeyStore>, cipher: CipherMode) -> Self {
        let mut iv_prefix = [0u8; 4];
        rand::rngs::OsRng.fill_bytes(&mut iv_prefix);
        Self {
            store,
            cipher,
            iv_prefix,
            iv_counter: AtomicU64::new(1),
        }
    }

    pub fn cipher(&self) -> CipherMode {
        self.cipher
    }

    pub fn fill_pseudo_random(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }

    /// Writes an IV appropriate for the configured cipher and returns its
    /// length. CBC takes random IVs; GCM takes never-repeating ones.
    pub fn generate_iv(&self, buf: &mut [u8]) -> Result<usize, CaskError> {
        match self.cipher {
            CipherMode::Aes256Cbc => {
                if buf.len() < CBC_IV_LEN {
                    return Err(CaskError::InvalidOptions(
                        "CBC IV buffer must hold 16 bytes".into(),
                    ));
                }
                rand::rngs::OsRng.fill_bytes(&mut buf[..CBC_IV_LEN]);
                Ok(CBC_IV_LEN)
            }
            CipherMode::Aes256Gcm => {
                if buf.len() < GCM_IV_LEN {
                    return Err(CaskError::InvalidOptions(
                        "GCM IV buffer must hold 12 bytes".into(),
                    ));
                }
                let counter = self.iv_counter.fetch_add(1, Ordering::SeqCst);
                buf[..4].copy_from_slice(&self.iv_prefix);
                buf[4..GCM_IV_LEN].copy_from_slice(&counter.to_be_bytes());
                Ok(GCM_IV_LEN)
            }
        }
    }

    pub fn key_by_id(&self, id: &str) -> Result<Zeroizing<[u8; 32]>, CaskError> {
        self.store.get_key_by_id(id)
    }

    pub fn drop_key(&self, id: &str) -> Result<bool, CaskError> {
        self.store.delete_key(id)
    }
}
