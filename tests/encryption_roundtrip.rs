//! Encrypted stores: reopen with the right key, survive the wrong one.

use std::fs;

use confstore::{Store, StoreOptions};
use serde_json::json;
use tempfile::tempdir;

fn encrypted_options(dir: &std::path::Path, key: &str) -> StoreOptions {
    StoreOptions::builder()
        .cwd(dir)
        .encryption_key(key)
        .clear_invalid_config(true)
        .build()
}

#[test]
fn encrypted_round_trip_with_matching_key() {
    let dir = tempdir().unwrap();
    {
        let store = Store::open(encrypted_options(dir.path(), "secret")).unwrap();
        store.set("a.b", 42).unwrap();
    }

    // The raw file must not leak plaintext.
    let raw = fs::read(dir.path().join("config.json")).unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());
    assert_eq!(raw[16], b':');

    let reopened = Store::open(encrypted_options(dir.path(), "secret")).unwrap();
    assert_eq!(reopened.get("a.b").unwrap(), Some(json!(42)));
}

#[test]
fn wrong_key_takes_the_corrupt_config_path() {
    let dir = tempdir().unwrap();
    {
        let store = Store::open(encrypted_options(dir.path(), "secret")).unwrap();
        store.set("a.b", 42).unwrap();
    }

    // Wrong key: absent value, not a thrown error.
    let wrong = Store::open(encrypted_options(dir.path(), "hunter2")).unwrap();
    assert_eq!(wrong.get("a.b").unwrap(), None);
}

#[test]
fn adding_a_key_encrypts_an_existing_plaintext_store() {
    let dir = tempdir().unwrap();
    {
        let store = Store::open(StoreOptions::builder().cwd(dir.path()).build()).unwrap();
        store.set("migrate_me", true).unwrap();
    }

    // Decryption of plaintext is a pass-through, so the old content is
    // still readable; the next write seals it.
    let store = Store::open(encrypted_options(dir.path(), "secret")).unwrap();
    assert_eq!(store.get("migrate_me").unwrap(), Some(json!(true)));
    store.set("sealed", 1).unwrap();

    let raw = fs::read(dir.path().join("config.json")).unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());
}

#[test]
fn defaults_still_apply_under_encryption() {
    let dir = tempdir().unwrap();
    let store = Store::open(
        StoreOptions::builder()
            .cwd(dir.path())
            .encryption_key("secret")
            .defaults(&json!({"windowBounds": {"width": 800, "height": 600}}))
            .build(),
    )
    .unwrap();
    assert_eq!(
        store.get("windowBounds.width").unwrap(),
        Some(json!(800))
    );
}
