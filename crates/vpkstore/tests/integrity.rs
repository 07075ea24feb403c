//! Hash tree and signature checks against tampered files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vpkstore::{
    FsFileProvider, ImmediateHasher, PackedStore, SignatureCheck, SigningKeys, StoreConfig,
};

fn dir_path(root: &Path) -> PathBuf {
    root.join("pak01_dir.vpk")
}

fn chunk_path(root: &Path, chunk: u16) -> PathBuf {
    root.join(format!("pak01_{chunk:03}.vpk"))
}

fn config() -> StoreConfig {
    StoreConfig::default().with_write_chunk_size(64 * 1024)
}

fn open(root: &Path) -> PackedStore {
    PackedStore::open_with(
        dir_path(root),
        config(),
        Arc::new(FsFileProvider::new()),
        Arc::new(ImmediateHasher::new()),
    )
    .unwrap()
}

fn build(root: &Path, keys: Option<&SigningKeys>) {
    let mut store = PackedStore::create_with(
        dir_path(root),
        config(),
        Arc::new(FsFileProvider::new()),
        Arc::new(ImmediateHasher::new()),
    )
    .unwrap();
    if let Some(keys) = keys {
        store
            .set_keys_for_signing(&keys.private_key_bytes(), &keys.public_key_bytes())
            .unwrap();
    }
    store
        .add_file("models/x.mdl", 0, &vec![0x5A; 10_000], false, None)
        .unwrap();
    store
        .add_file("materials/x.vmt", 0, &vec![0x3C; 200], false, None)
        .unwrap();
    store.write().unwrap();
}

fn flip_byte(path: &Path, offset: usize) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[offset] ^= 0x01;
    std::fs::write(path, bytes).unwrap();
}

/// Offset of the base name `x` of `models/x.mdl` inside the directory file.
fn model_name_offset(root: &Path) -> usize {
    let bytes = std::fs::read(dir_path(root)).unwrap();
    let needle = b"models\0x\0";
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap();
    at + b"models\0".len()
}

#[test]
fn test_unmodified_store_passes() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), None);

    let store = open(tmp.path());
    assert!(store.test_directory_hash());
    assert!(store.test_master_chunk_hash());
    assert!(store.hashes().is_consistent());
    assert_eq!(store.check_signature(None), SignatureCheck::NotSigned);
}

#[test]
fn test_flipped_chunk_byte_fails_chunk_hash() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), None);
    flip_byte(&chunk_path(tmp.path(), 0), 5000);

    let store = open(tmp.path());
    assert!(!store.test_master_chunk_hash());
    assert!(store.test_directory_hash());
}

#[test]
fn test_flipped_directory_byte_fails_directory_hash_only() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), None);
    flip_byte(&dir_path(tmp.path()), model_name_offset(tmp.path()));

    let store = open(tmp.path());
    assert!(store.open_file("models/y.mdl").is_some());
    assert!(!store.test_directory_hash());
    assert!(store.test_master_chunk_hash());
}

#[test]
fn test_rehash_after_tampering_accepts_new_state() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), None);
    flip_byte(&chunk_path(tmp.path(), 0), 10);

    let mut store = open(tmp.path());
    assert!(!store.test_master_chunk_hash());
    store.hash_chunk_file(0).unwrap();
    store.hash_metadata().unwrap();
    assert!(store.test_master_chunk_hash());
}

#[test]
fn test_hash_everything_refreshes_both_levels() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), None);
    flip_byte(&chunk_path(tmp.path(), 0), 0);

    let mut store = open(tmp.path());
    let before = store.hashes();
    let after = store.hash_everything().unwrap();
    assert_eq!(after.directory, before.directory);
    assert_ne!(after.chunk_hashes, before.chunk_hashes);
    assert!(after.is_consistent());
    assert!(store.test_directory_hash());
    assert!(store.test_master_chunk_hash());
}

#[test]
fn test_signature_outcomes() {
    let tmp = tempfile::tempdir().unwrap();
    let keys = SigningKeys::from_seed([42; 32]);
    let other = SigningKeys::from_seed([43; 32]);
    build(tmp.path(), Some(&keys));

    let store = open(tmp.path());
    assert!(store.is_signed());
    assert_eq!(store.signature_public_key(), Some(&keys.public_key_bytes()[..]));
    assert!(store.check_signature(None).is_valid());
    assert_eq!(
        store.check_signature(Some(&keys.public_key_bytes())),
        SignatureCheck::ValidSignature
    );
    assert_eq!(
        store.check_signature(Some(&other.public_key_bytes())),
        SignatureCheck::WrongKey
    );
}

#[test]
fn test_corrupted_signed_byte_is_detected_at_check_time() {
    let tmp = tempfile::tempdir().unwrap();
    let keys = SigningKeys::from_seed([7; 32]);
    build(tmp.path(), Some(&keys));

    let store = open(tmp.path());
    assert_eq!(store.check_signature(None), SignatureCheck::ValidSignature);

    flip_byte(&dir_path(tmp.path()), model_name_offset(tmp.path()));
    assert_eq!(store.check_signature(None), SignatureCheck::InvalidSignature);
}

#[test]
fn test_missing_directory_file_fails_check() {
    let tmp = tempfile::tempdir().unwrap();
    let keys = SigningKeys::from_seed([9; 32]);
    build(tmp.path(), Some(&keys));

    let store = open(tmp.path());
    std::fs::remove_file(dir_path(tmp.path())).unwrap();
    assert_eq!(store.check_signature(None), SignatureCheck::Failed);
    // A key mismatch is decided from the loaded block alone.
    let other = SigningKeys::from_seed([10; 32]);
    assert_eq!(
        store.check_signature(Some(&other.public_key_bytes())),
        SignatureCheck::WrongKey
    );
}

#[test]
fn test_corrupted_chunk_is_reported_by_service() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), None);
    flip_byte(&chunk_path(tmp.path(), 0), 100);

    let store = open(tmp.path());
    assert_eq!(store.pack_file_load_error_summary(), "No pack file load errors.");

    // The read is served; verification only reports.
    let data = store.read_file("models/x.mdl").unwrap();
    assert_eq!(data.len(), 10_000);
    assert_eq!(data[100], 0x5B);

    assert_eq!(store.service(), 1);
    let summary = store.pack_file_load_error_summary();
    assert!(summary.contains("chunk 000 fraction 0"), "{summary}");
    let stats = store.cache_stats();
    assert_eq!(stats.hash_failures, 1);
    assert_eq!(stats.retries, 1);
}
