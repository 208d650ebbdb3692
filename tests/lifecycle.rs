//! End-to-end transaction lifecycle over both storage backends.

use std::sync::Arc;

use arf::storage::{Fs, Memory, Storage};
use arf::unit::builtin;
use arf::{ArfSpec, Indexer, Options, TransactionComposer};

fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

fn base_spec() -> Arc<ArfSpec> {
    Arc::new(ArfSpec::base())
}

/// Write three generations of the same strand and check that exactly one
/// survives, for any storage backend.
fn create_rewrite_discard<S: Storage>(storage: S) {
    let mut ix = Indexer::new(storage.clone());

    // Generation one: create strand 5 and write a block.
    storage.append(&builtin::tx_scope_marker(0, 1)).unwrap();
    storage.append(&builtin::strand_select(5)).unwrap();
    storage.append(&builtin::strand_create(1024)).unwrap();
    storage.append(&builtin::strand_select(5)).unwrap();
    storage
        .append(&builtin::strand_write(0, b"first".to_vec()))
        .unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    {
        let subjects = ix.committed().iter(ix.mapper()).unwrap();
        assert_eq!(subjects.len(), 2);
    }

    // Generation two: overwrite the same block.
    storage.append(&builtin::tx_scope_marker(1, 2)).unwrap();
    storage.append(&builtin::strand_select(5)).unwrap();
    storage
        .append(&builtin::strand_write(0, b"second".to_vec()))
        .unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    {
        let subjects = ix.committed().iter(ix.mapper()).unwrap();
        assert_eq!(subjects.len(), 2);
        let write = subjects
            .iter()
            .find(|s| s.subject().typeid() == builtin::STRAND_WRITE)
            .unwrap();
        assert_eq!(
            write.subject().piece("data").unwrap().as_bytes().unwrap(),
            b"second"
        );
    }

    // Generation three: discard a strand group covering strand 5.
    storage.append(&builtin::tx_scope_marker(2, 3)).unwrap();
    storage.append(&builtin::strand_group_select(4, 2)).unwrap();
    storage.append(&builtin::strand_discard()).unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    let subjects = ix.committed().iter(ix.mapper()).unwrap();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0].subject().typeid(), builtin::STRAND_DISCARD);
}

#[test]
fn lifecycle_on_memory() {
    enable_logging();
    create_rewrite_discard(Memory::new(base_spec()));
}

#[test]
fn lifecycle_on_file() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let storage = Fs::open(dir.path().join("arf.log"), base_spec(), Options::default()).unwrap();
    create_rewrite_discard(storage);
}

#[test]
fn released_transactions_vanish() {
    enable_logging();
    let storage = Memory::new(base_spec());
    let mut ix = Indexer::new(storage.clone());

    storage.append(&builtin::tx_scope_marker(0, 1)).unwrap();
    storage.append(&builtin::strand_select(9)).unwrap();
    storage.append(&builtin::strand_create(256)).unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    storage.append(&builtin::tx_scope_marker(1, 2)).unwrap();
    storage.append(&builtin::strand_select(7)).unwrap();
    storage
        .append(&builtin::strand_write(0, b"z".to_vec()))
        .unwrap();
    storage.append(&builtin::tx_scope_finalize(false)).unwrap();
    ix.sync().unwrap();

    // The committed strand 9 content is unchanged, the released scope gone.
    let subjects = ix.committed().iter(ix.mapper()).unwrap();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0].strand().unwrap(), Some(9));
    assert!(ix.open_scopes().is_empty());
    assert_eq!(ix.open_transactions().len(), 0);
    for id in [6, 7, 8] {
        assert!(!storage.contains(id));
    }
}

#[test]
fn file_log_survives_reopen_mid_history() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arf.log");
    let spec = base_spec();

    {
        let storage = Fs::open(&path, spec.clone(), Options::default()).unwrap();
        let mut ix = Indexer::new(storage.clone());
        storage.append(&builtin::tx_scope_marker(0, 1)).unwrap();
        storage.append(&builtin::strand_select(11)).unwrap();
        storage.append(&builtin::strand_create(512)).unwrap();
        storage.append(&builtin::tx_scope_finalize(true)).unwrap();
        ix.sync().unwrap();
    }

    // A fresh indexer over the reopened file reconstructs the same state,
    // then applies another transaction on top.
    let storage = Fs::open(&path, spec, Options::default()).unwrap();
    let mut ix = Indexer::new(storage.clone());
    ix.sync().unwrap();
    {
        let subjects = ix.committed().iter(ix.mapper()).unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].strand().unwrap(), Some(11));
    }

    storage.append(&builtin::tx_scope_marker(1, 2)).unwrap();
    storage.append(&builtin::strand_select(11)).unwrap();
    storage.append(&builtin::strand_create(4096)).unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    let subjects = ix.committed().iter(ix.mapper()).unwrap();
    assert_eq!(subjects.len(), 1);
    assert_eq!(
        subjects[0].subject().piece_int("size_bytes").unwrap(),
        4096
    );
}

#[test]
fn composed_transaction_commits_cleanly() {
    enable_logging();
    let storage = Memory::new(base_spec());
    let mut ix = Indexer::new(storage.clone());

    storage.append(&builtin::tx_scope_marker(0, 1)).unwrap();
    storage.append(&builtin::strand_select(42)).unwrap();
    storage.append(&builtin::strand_create(100)).unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    // Compose a conflicting transaction off-storage first.
    let mut composer = TransactionComposer::new(&ix).unwrap();
    let txs = composer.txs();
    composer.push(&builtin::strand_select(42)).unwrap();
    composer.push(&builtin::strand_create(200)).unwrap();
    let (_, occlusions) = composer.compose(&ix).unwrap();
    assert_eq!(occlusions.len(), 1);

    // The caller accepts the preview and writes the transaction for real.
    storage.append(&builtin::tx_scope_marker(1, txs)).unwrap();
    storage.append(&builtin::strand_select(42)).unwrap();
    storage.append(&builtin::strand_create(200)).unwrap();
    storage.append(&builtin::tx_scope_finalize(true)).unwrap();
    ix.sync().unwrap();

    let subjects = ix.committed().iter(ix.mapper()).unwrap();
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0].txs(), txs);
    assert_eq!(
        subjects[0].subject().piece_int("size_bytes").unwrap(),
        200
    );
}
