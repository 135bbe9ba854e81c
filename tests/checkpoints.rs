use caskdb::store::CheckpointKind;
use caskdb::{CaskConfig, CaskEngine, RecordStoreOptions};

fn open_engine(dir: &std::path::Path, config: CaskConfig) -> std::sync::Arc<CaskEngine> {
    let engine = CaskEngine::open(dir, config).expect("open engine");
    engine
        .create_record_store("db1.c1", "c1", &RecordStoreOptions::default())
        .expect("create");
    engine
}

#[test]
fn incomplete_dataset_takes_unstable_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_engine(dir.path(), CaskConfig::default());
    engine.set_initial_data_timestamp(1);
    engine.set_stable_timestamp(500).expect("stable");

    engine.checkpoint_once().expect("tick");

    let history = engine.connection().expect("conn").checkpoint_history();
    assert_eq!(history.last(), Some(&CheckpointKind::Unstable));
    let status = engine.status().expect("status");
    assert_eq!(status.last_stable_checkpoint_timestamp, None);
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn stable_behind_initial_data_skips_the_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_engine(dir.path(), CaskConfig::default());
    engine.set_initial_data_timestamp(100);
    engine.set_stable_timestamp(50).expect("stable");

    let before = engine.connection().expect("conn").checkpoint_history().len();
    engine.checkpoint_once().expect("tick");
    let after = engine.connection().expect("conn").checkpoint_history().len();
    assert_eq!(before, after, "skipped tick must not checkpoint");
    assert_eq!(
        engine.status().expect("status").last_stable_checkpoint_timestamp,
        None
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn steady_state_takes_a_stable_checkpoint_and_publishes_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_engine(dir.path(), CaskConfig::default());
    engine.set_initial_data_timestamp(100);
    engine.set_stable_timestamp(150).expect("stable");

    engine.checkpoint_once().expect("tick");

    let history = engine.connection().expect("conn").checkpoint_history();
    assert!(history.contains(&CheckpointKind::Stable(150)));
    assert_eq!(
        engine.status().expect("status").last_stable_checkpoint_timestamp,
        Some(150)
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn majority_read_concern_off_pins_last_stable_to_infinity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = CaskConfig::default();
    config.enable_majority_read_concern = false;
    let engine = open_engine(dir.path(), config);
    engine.set_initial_data_timestamp(100);
    // Stable posts are ignored without history retention.
    engine.set_stable_timestamp(150).expect("ignored");
    assert_eq!(engine.timestamps().stable(), 0);

    engine.checkpoint_once().expect("tick");

    let history = engine.connection().expect("conn").checkpoint_history();
    assert_eq!(history.last(), Some(&CheckpointKind::Unstable));
    // Published internally as infinity so oplog truncation is size-driven;
    // the status surface reports no stable checkpoint support at all.
    assert_eq!(engine.timestamps().last_stable_checkpoint(), u64::MAX);
    assert_eq!(
        engine.status().expect("status").last_stable_checkpoint_timestamp,
        None
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn keystore_gets_an_unstable_checkpoint_after_each_pass() {
    let dir = tempfile::tempdir().expect("tempdir");
    let secrets = std::sync::Arc::new(caskdb::MemorySecretStore::default());
    let config = CaskConfig::default().with_encryption(caskdb::EncryptionConfig {
        cipher_mode: caskdb::CipherMode::Aes256Gcm,
        rotate_master_key: false,
        master_key: caskdb::MasterKeySource::Store(secrets),
    });
    let engine = open_engine(dir.path(), config);
    engine.set_initial_data_timestamp(100);
    engine.set_stable_timestamp(150).expect("stable");

    let keystore = engine.keystore().expect("keystore");
    let meta_before =
        std::fs::metadata(keystore.dir().join("cask.meta")).expect("meta").modified();
    std::thread::sleep(std::time::Duration::from_millis(10));
    engine.checkpoint_once().expect("tick");
    let meta_after =
        std::fs::metadata(keystore.dir().join("cask.meta")).expect("meta").modified();
    if let (Ok(before), Ok(after)) = (meta_before, meta_after) {
        assert!(after >= before, "keystore metadata must have been rewritten");
    }
    drop(keystore);
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn write_conflict_counter_starts_at_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_engine(dir.path(), CaskConfig::default());
    engine.checkpoint_once().expect("tick");
    assert_eq!(
        engine.status().expect("status").checkpoint_write_conflicts,
        0
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn set_stable_twice_is_observably_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open_engine(dir.path(), CaskConfig::default());
    engine.set_initial_data_timestamp(10);
    engine.set_stable_timestamp(100).expect("first");
    let conn = engine.connection().expect("conn");
    let stable_after_first = conn.stable_timestamp();
    let oldest_after_first = conn.oldest_timestamp();
    engine.set_stable_timestamp(100).expect("second");
    assert_eq!(conn.stable_timestamp(), stable_after_first);
    assert_eq!(conn.oldest_timestamp(), oldest_after_first);
    engine.clean_shutdown().expect("shutdown");
}
