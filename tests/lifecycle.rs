use caskdb::store::{Connection, StoreError};
use caskdb::{CaskConfig, CaskEngine, FcvState, RecordStoreOptions, SizeInfo, StartupVersion};

#[test]
fn shutdown_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
    engine.clean_shutdown().expect("first shutdown");
    engine.clean_shutdown().expect("second shutdown is a no-op");
    assert!(engine.connection().is_err(), "engine handle must be gone");
}

#[test]
fn reopen_preserves_idents_and_negotiates_current_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
        engine
            .create_record_store("db1.c1", "c1", &RecordStoreOptions::default())
            .expect("create");
        engine.clean_shutdown().expect("shutdown");
    }
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("reopen");
    assert_eq!(engine.startup_version(), StartupVersion::Current);
    assert!(engine.has_ident("c1").expect("has"));
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn downgraded_files_negotiate_to_the_previous_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
        engine.clean_shutdown().expect("shutdown");
    }
    {
        let conn = Connection::open(dir.path(), "").expect("raw open");
        conn.reconfigure("compatibility=(release=3.0)").expect("downgrade");
        conn.close("use_timestamp=false").expect("close");
    }
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("reopen");
    assert_eq!(engine.startup_version(), StartupVersion::Release30);
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn fully_downgraded_standalone_downgrades_data_files_on_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
        engine
            .create_record_store("db1.c1", "c1", &RecordStoreOptions::default())
            .expect("create");
        engine.clean_shutdown().expect("shutdown");
    }

    // Standalone, fully downgraded compatibility, no recovery timestamp:
    // the shutdown must lower the on-disk format.
    let mut config = CaskConfig::default();
    config.replica.fcv = FcvState::FullyDowngraded;
    let engine = CaskEngine::open(dir.path(), config).expect("open");
    assert_eq!(engine.recovery_timestamp(), 0);
    engine.clean_shutdown().expect("downgrading shutdown");

    // The on-disk format now refuses the current compatibility floor but
    // accepts the previous one.
    let err = Connection::open(dir.path(), "compatibility=(require_min=\"3.1.0\")")
        .expect_err("downgraded files");
    assert!(matches!(err, StoreError::VersionMismatch { .. }));
    Connection::open(dir.path(), "compatibility=(require_min=\"3.0.0\")")
        .expect("previous floor")
        .close("")
        .expect("close");

    // A later startup discovers the downgraded files as the previous
    // version and, with the same policy inputs, keeps them there.
    let mut config = CaskConfig::default();
    config.replica.fcv = FcvState::FullyDowngraded;
    let engine = CaskEngine::open(dir.path(), config).expect("reopen");
    assert_eq!(engine.startup_version(), StartupVersion::Release30);
    assert!(engine.has_ident("c1").expect("has"));
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn journal_to_nojournal_transition_removes_the_journal() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("durable open");
        engine.clean_shutdown().expect("shutdown");
    }
    assert!(dir.path().join("journal").is_dir());

    let mut config = CaskConfig::default();
    config.durable = false;
    let engine = CaskEngine::open(dir.path(), config).expect("nojournal open");
    assert!(
        !dir.path().join("journal").exists(),
        "journal must be removed after recovery"
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn corrupt_metadata_is_fatal_without_repair_and_salvaged_with_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
        engine
            .create_record_store("db1.c1", "c1", &RecordStoreOptions::default())
            .expect("create");
        engine.clean_shutdown().expect("shutdown");
    }
    std::fs::write(dir.path().join("cask.meta"), b"scrambled").expect("corrupt");

    let err = CaskEngine::open(dir.path(), CaskConfig::default()).expect_err("fatal");
    assert_eq!(err.code(), caskdb::CaskErrorCode::Fatal);

    let engine = CaskEngine::open(dir.path(), CaskConfig::default().repair()).expect("salvage");
    assert!(engine.has_ident("c1").expect("has"));
    assert!(engine
        .repair_events()
        .iter()
        .any(|e| e.contains("metadata salvaged")));
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn recovery_timestamp_seeds_the_clocks_after_a_stable_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
        engine.set_initial_data_timestamp(10);
        engine.set_stable_timestamp(100).expect("stable");
        engine.checkpoint_once().expect("checkpoint");
        engine.clean_shutdown().expect("shutdown");
    }
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("reopen");
    assert_eq!(engine.recovery_timestamp(), 100);
    assert_eq!(engine.timestamps().initial_data(), 100);
    assert_eq!(engine.timestamps().stable(), 100);
    let status = engine.status().expect("status");
    assert_eq!(status.recovery_timestamp, 100);
    assert_eq!(status.last_stable_checkpoint_timestamp, Some(100));
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn recover_to_stable_restarts_the_checkpoint_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
    engine.set_initial_data_timestamp(100);
    engine.set_stable_timestamp(150).expect("stable");
    engine.checkpoint_once().expect("checkpoint");
    assert_eq!(
        engine.status().expect("status").last_stable_checkpoint_timestamp,
        Some(150)
    );

    let recovered = engine.recover_to_stable().expect("rollback");
    assert_eq!(recovered, 150);
    // The published checkpoint timestamp resets across a rollback.
    assert_eq!(engine.timestamps().last_stable_checkpoint(), 0);

    // The pipeline is running again: a pass takes a stable checkpoint.
    engine.checkpoint_once().expect("tick after restart");
    assert_eq!(
        engine.status().expect("status").last_stable_checkpoint_timestamp,
        Some(150)
    );
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn recover_to_stable_discards_post_checkpoint_size_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
    engine
        .create_record_store("db1.c1", "c1", &RecordStoreOptions::default())
        .expect("create");
    engine.set_initial_data_timestamp(100);
    engine.set_stable_timestamp(150).expect("stable");

    let checkpointed = SizeInfo {
        num_records: 7,
        data_size: 512,
    };
    engine.store_ident_size("c1", checkpointed);
    engine.sync_size_info(false).expect("write sizes through");
    engine.checkpoint_once().expect("stable checkpoint");

    // A newer size that only ever reaches the in-process buffer.
    let newer = SizeInfo {
        num_records: 99,
        data_size: 4096,
    };
    engine.store_ident_size("c1", newer);
    assert_eq!(engine.load_ident_size("c1").expect("load"), newer);

    assert_eq!(engine.recover_to_stable().expect("rollback"), 150);
    // The rollback discarded the newer size along with its buffer; loads
    // see the checkpointed value again.
    assert_eq!(engine.load_ident_size("c1").expect("load"), checkpointed);
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn recover_to_stable_refuses_an_unstable_dataset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = CaskEngine::open(dir.path(), CaskConfig::default()).expect("open");
    engine.set_initial_data_timestamp(100);
    engine.set_stable_timestamp(50).expect("behind the watermark");
    let err = engine.recover_to_stable().expect_err("unrecoverable");
    assert_eq!(err.code(), caskdb::CaskErrorCode::UnrecoverableRollback);
    engine.clean_shutdown().expect("shutdown");
}

#[test]
fn ticket_resize_is_visible_in_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = CaskConfig::default();
    config.concurrent_write_transactions = 4;
    config.concurrent_read_transactions = 8;
    let engine = CaskEngine::open(dir.path(), config).expect("open");

    let ticket = engine.write_tickets().acquire();
    let status = engine.status().expect("status");
    assert_eq!(status.write_tickets.used, 1);
    assert_eq!(status.write_tickets.capacity, 4);
    assert_eq!(status.read_tickets.available, 8);
    drop(ticket);

    engine.resize_write_tickets(16).expect("resize");
    assert_eq!(engine.status().expect("status").write_tickets.capacity, 16);
    assert!(engine.resize_write_tickets(0).is_err());
    engine.clean_shutdown().expect("shutdown");
}
