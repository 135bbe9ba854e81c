use caskdb::{
    CaskConfig, CaskEngine, CaskError, CipherMode, EncryptionConfig, MasterKeySource,
    MemorySecretStore, SecretStore,
};
use std::sync::Arc;

fn config(secrets: Arc<MemorySecretStore>, rotate: bool) -> CaskConfig {
    CaskConfig::default().with_encryption(EncryptionConfig {
        cipher_mode: CipherMode::Aes256Cbc,
        rotate_master_key: rotate,
        master_key: MasterKeySource::Store(secrets),
    })
}

#[test]
fn master_key_rotation_reseals_keys_and_terminates_distinctly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let secrets = Arc::new(MemorySecretStore::default());

    // First startup mints the master key and one database key.
    let db_key = {
        let engine =
            CaskEngine::open(dir.path(), config(Arc::clone(&secrets), false)).expect("open");
        let key = engine
            .keystore()
            .expect("keystore")
            .get_key_by_id("db1")
            .expect("mint");
        engine.clean_shutdown().expect("shutdown");
        key
    };
    let old_master = secrets.get_master_key().expect("get").expect("present");

    // Rotation startup terminates with the distinguished error.
    let err = CaskEngine::open(dir.path(), config(Arc::clone(&secrets), true))
        .expect_err("rotation terminates");
    assert!(matches!(err, CaskError::RotationFinished));

    assert!(dir.path().join("key.db").is_dir());
    assert!(dir.path().join("key.db.rotated").is_dir());
    assert!(!dir.path().join("key.db.rotation").exists());
    let new_master = secrets.get_master_key().expect("get").expect("present");
    assert_ne!(old_master, new_master, "rotation must publish a fresh master key");

    // Restart without the flag: the database key is still decryptable and
    // unchanged under the new master key.
    let engine = CaskEngine::open(dir.path(), config(Arc::clone(&secrets), false)).expect("open");
    let key_after = engine
        .keystore()
        .expect("keystore")
        .get_key_by_id("db1")
        .expect("lookup");
    assert_eq!(*db_key, *key_after);
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn rotation_refuses_a_leftover_rotation_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let secrets = Arc::new(MemorySecretStore::default());
    {
        let engine =
            CaskEngine::open(dir.path(), config(Arc::clone(&secrets), false)).expect("open");
        engine.clean_shutdown().expect("shutdown");
    }
    std::fs::create_dir(dir.path().join("key.db.rotation")).expect("leftover");
    let err = CaskEngine::open(dir.path(), config(secrets, true)).expect_err("refused");
    assert_eq!(err.code(), caskdb::CaskErrorCode::InvalidOptions);
}

#[test]
fn rotation_requires_an_external_secret_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_file = dir.path().join("master.key");
    std::fs::write(&key_file, "a".repeat(64)).expect("key file");
    let engine_dir = tempfile::tempdir().expect("engine dir");
    let config = CaskConfig::default().with_encryption(EncryptionConfig {
        cipher_mode: CipherMode::Aes256Gcm,
        rotate_master_key: true,
        master_key: MasterKeySource::File(key_file),
    });
    let err = CaskEngine::open(engine_dir.path(), config).expect_err("refused");
    assert_eq!(err.code(), caskdb::CaskErrorCode::InvalidOptions);
}

#[test]
fn file_sealed_master_key_works_across_restarts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key_file = dir.path().join("master.key");
    std::fs::write(&key_file, "0f".repeat(32)).expect("key file");
    let engine_dir = tempfile::tempdir().expect("engine dir");
    let make_config = || {
        CaskConfig::default().with_encryption(EncryptionConfig {
            cipher_mode: CipherMode::Aes256Gcm,
            rotate_master_key: false,
            master_key: MasterKeySource::File(key_file.clone()),
        })
    };

    let db_key = {
        let engine = CaskEngine::open(engine_dir.path(), make_config()).expect("open");
        let key = engine
            .keystore()
            .expect("keystore")
            .get_key_by_id("db1")
            .expect("mint");
        engine.clean_shutdown().expect("shutdown");
        key
    };
    let engine = CaskEngine::open(engine_dir.path(), make_config()).expect("reopen");
    assert_eq!(
        *db_key,
        *engine
            .keystore()
            .expect("keystore")
            .get_key_by_id("db1")
            .expect("lookup")
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn dropping_a_database_deletes_its_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let secrets = Arc::new(MemorySecretStore::default());
    let engine = CaskEngine::open(dir.path(), config(secrets, false)).expect("open");
    let keystore = engine.keystore().expect("keystore");
    keystore.get_key_by_id("db1").expect("mint");
    assert_eq!(keystore.key_ids().expect("ids"), vec!["db1".to_string()]);
    engine.drop_database_keys("db1");
    assert!(keystore.key_ids().expect("ids").is_empty());
    drop(keystore);
    engine.clean_shutdown().expect("shutdown");
}
