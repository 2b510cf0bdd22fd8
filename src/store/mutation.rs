//! Public document operations and change subscriptions.
//!
//! Every mutation follows the same shape: clone the document, apply the
//! edit to the clone, validate, persist atomically, then swap the clone
//! in and fire one notification pass. A failed validation or write
//! therefore never leaves a partially-applied document behind.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::INTERNAL_KEY;
use crate::error::{Result, StoreError};
use crate::events::{ChangeCallback, Subscription};
use crate::paths::{self, KeyPath};

use super::lifecycle::Store;

impl Store {
    /// Get the value at `key`, or `None` when absent.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let inner = self.lock_inner();
        let path = parse_key(key, inner.dot_notation)?;
        Ok(paths::get_path(&inner.doc, &path).cloned())
    }

    /// Get the value at `key`, falling back to `default`.
    pub fn get_or<T: Serialize>(&self, key: &str, default: T) -> Result<Value> {
        match self.get(key)? {
            Some(value) => Ok(value),
            None => to_value(default),
        }
    }

    /// Whether `key` resolves to a value.
    pub fn has(&self, key: &str) -> Result<bool> {
        let inner = self.lock_inner();
        let path = parse_key(key, inner.dot_notation)?;
        Ok(paths::has_path(&inner.doc, &path))
    }

    /// Set `key` to `value`, persisting atomically.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = to_value(value)?;
        self.mutate(|doc, dot| {
            let path = parse_key(key, dot)?;
            paths::set_path(doc, &path, value);
            Ok(())
        })
    }

    /// Set several keys in one persisted write.
    pub fn set_entries(&self, entries: Map<String, Value>) -> Result<()> {
        self.mutate(|doc, dot| {
            for (key, value) in entries {
                let path = parse_key(&key, dot)?;
                paths::set_path(doc, &path, value);
            }
            Ok(())
        })
    }

    /// Delete `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.mutate(|doc, dot| {
            let path = parse_key(key, dot)?;
            Ok(paths::delete_path(doc, &path))
        })
    }

    /// Restore the given keys to their declared defaults (schema defaults
    /// overlaid with option defaults); keys without a default are
    /// deleted.
    pub fn reset(&self, keys: &[&str]) -> Result<()> {
        let base = self.lock_inner().base_defaults.clone();
        self.mutate(|doc, dot| {
            for key in keys {
                let path = parse_key(key, dot)?;
                match paths::get_path(&base, &path).cloned() {
                    Some(default) => paths::set_path(doc, &path, default),
                    None => {
                        paths::delete_path(doc, &path);
                    }
                }
            }
            Ok(())
        })
    }

    /// Drop everything back to the declared defaults. The internal
    /// namespace (migration watermark) is preserved.
    pub fn clear(&self) -> Result<()> {
        let base = self.lock_inner().base_defaults.clone();
        self.mutate(move |doc, _| {
            let internal = doc.get(INTERNAL_KEY).cloned();
            *doc = base;
            if let Some(internal) = internal {
                doc.insert(INTERNAL_KEY.to_owned(), internal);
            }
            Ok(())
        })
    }

    /// Snapshot of the whole document.
    #[must_use]
    pub fn store(&self) -> Map<String, Value> {
        self.lock_inner().doc.clone()
    }

    /// Replace the whole document. The input may not carry the reserved
    /// internal key; the store's own internal namespace is carried over.
    pub fn set_store(&self, new_doc: Map<String, Value>) -> Result<()> {
        if new_doc.contains_key(INTERNAL_KEY) {
            return Err(reserved_key_error());
        }
        self.mutate(move |doc, _| {
            let internal = doc.get(INTERNAL_KEY).cloned();
            *doc = new_doc;
            if let Some(internal) = internal {
                doc.insert(INTERNAL_KEY.to_owned(), internal);
            }
            Ok(())
        })
    }

    /// `(key, value)` pairs of the document, internal namespace excluded.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.lock_inner()
            .doc
            .iter()
            .filter(|(key, _)| key.as_str() != INTERNAL_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Number of top-level keys, internal namespace excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.lock_inner();
        let internal = usize::from(inner.doc.contains_key(INTERNAL_KEY));
        inner.doc.len() - internal
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to changes of the value at `key`. The callback receives
    /// `(new, old)` and only fires when a deep comparison differs.
    pub fn on_did_change(&self, key: &str, callback: ChangeCallback) -> Result<Subscription> {
        let inner = self.lock_inner();
        let path = parse_key(key, inner.dot_notation)?;
        let current = paths::get_path(&inner.doc, &path).cloned();
        let accessor = Box::new(move |doc: &Map<String, Value>| paths::get_path(doc, &path).cloned());
        drop(inner);
        Ok(self
            .lock_bus()
            .subscribe(accessor, current, callback))
    }

    /// Subscribe to any change of the document. Old/new are the whole
    /// document (internal namespace included).
    pub fn on_did_any_change(&self, callback: ChangeCallback) -> Subscription {
        let current = Some(Value::Object(self.lock_inner().doc.clone()));
        let accessor =
            Box::new(|doc: &Map<String, Value>| Some(Value::Object(doc.clone())));
        self.lock_bus().subscribe(accessor, current, callback)
    }

    /// Remove a listener; returns whether it was still registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.lock_bus().unsubscribe(subscription)
    }

    /// Clone-edit-validate-persist-swap. The notification pass runs after
    /// the document lock is released so callbacks can read the store.
    fn mutate<R>(
        &self,
        edit: impl FnOnce(&mut Map<String, Value>, bool) -> Result<R>,
    ) -> Result<R> {
        let (result, doc) = {
            let mut inner = self.lock_inner();
            let mut candidate = inner.doc.clone();
            let result = edit(&mut candidate, inner.dot_notation)?;
            if candidate == inner.doc {
                return Ok(result);
            }
            inner.validate(&candidate)?;
            inner.write_document(&candidate)?;
            inner.doc = candidate;
            inner.refresh_signature();
            (result, inner.doc.clone())
        };
        self.notify(&doc);
        Ok(result)
    }

    /// Run one notification pass with the bus lock released, so callbacks
    /// may subscribe, unsubscribe, or mutate the store.
    pub(crate) fn notify(&self, doc: &Map<String, Value>) {
        let mut pass = self.lock_bus().begin_notify();
        crate::events::run_pass(&mut pass, doc);
        self.lock_bus().finish_notify(pass);
    }

    fn lock_bus(&self) -> std::sync::MutexGuard<'_, crate::events::ChangeBus> {
        self.bus.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse a caller-supplied key: dot notation (or literal) plus the
/// reserved-namespace guard. Runs before any disk I/O.
fn parse_key(key: &str, dot_notation: bool) -> Result<KeyPath> {
    let path = if dot_notation {
        KeyPath::parse(key)?
    } else {
        KeyPath::literal(key)?
    };
    if path.head() == INTERNAL_KEY {
        return Err(reserved_key_error());
    }
    Ok(path)
}

fn reserved_key_error() -> StoreError {
    StoreError::InvalidKey {
        reason: format!("`{INTERNAL_KEY}` is reserved for internal use"),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| StoreError::Serialization {
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreOptions;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_in(dir: &std::path::Path) -> Store {
        Store::open(StoreOptions::builder().cwd(dir).build()).unwrap()
    }

    #[test]
    fn set_get_has_delete() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());

        store.set("theme", "dark").unwrap();
        assert_eq!(store.get("theme").unwrap(), Some(json!("dark")));
        assert!(store.has("theme").unwrap());
        assert!(store.delete("theme").unwrap());
        assert!(!store.has("theme").unwrap());
        assert!(!store.delete("theme").unwrap());
    }

    #[test]
    fn nested_keys_via_dot_notation() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());

        store.set("window.bounds.width", 1280).unwrap();
        assert_eq!(
            store.get("window.bounds.width").unwrap(),
            Some(json!(1280))
        );
        assert_eq!(
            store.get("window").unwrap(),
            Some(json!({"bounds": {"width": 1280}}))
        );
    }

    #[test]
    fn literal_mode_treats_dots_as_part_of_the_key() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreOptions::builder()
                .cwd(dir.path())
                .access_properties_by_dot_notation(false)
                .build(),
        )
        .unwrap();
        store.set("a.b", 1).unwrap();
        assert_eq!(store.get("a.b").unwrap(), Some(json!(1)));
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn reserved_and_unsafe_keys_are_rejected_without_mutation() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.set("kept", 1).unwrap();
        let before = store.store();

        for key in ["__internal__.x", "__internal__", "__proto__.y"] {
            let err = store.set(key, 1).unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "{key}");
        }
        assert_eq!(store.store(), before);
    }

    #[test]
    fn entries_len_and_iteration_skip_internal() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        let keys: Vec<String> = store.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn set_entries_is_one_write() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        let mut entries = Map::new();
        entries.insert("a".into(), json!(1));
        entries.insert("nested.b".into(), json!(2));
        store.set_entries(entries).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!(1)));
        assert_eq!(store.get("nested.b").unwrap(), Some(json!(2)));
    }

    #[test]
    fn reset_restores_defaults_and_deletes_undeclared() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreOptions::builder()
                .cwd(dir.path())
                .defaults(&json!({"theme": "light"}))
                .build(),
        )
        .unwrap();
        store.set("theme", "dark").unwrap();
        store.set("extra", 1).unwrap();
        store.reset(&["theme", "extra"]).unwrap();
        assert_eq!(store.get("theme").unwrap(), Some(json!("light")));
        assert_eq!(store.get("extra").unwrap(), None);
    }

    #[test]
    fn clear_returns_to_defaults() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            StoreOptions::builder()
                .cwd(dir.path())
                .defaults(&json!({"theme": "light"}))
                .build(),
        )
        .unwrap();
        store.set("theme", "dark").unwrap();
        store.set("extra", 1).unwrap();
        store.clear().unwrap();
        assert_eq!(store.get("theme").unwrap(), Some(json!("light")));
        assert!(!store.has("extra").unwrap());
    }

    #[test]
    fn whole_document_replace_preserves_internal_state() {
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.set("old", 1).unwrap();

        let mut replacement = Map::new();
        replacement.insert("new".into(), json!(true));
        store.set_store(replacement).unwrap();
        assert!(!store.has("old").unwrap());
        assert_eq!(store.get("new").unwrap(), Some(json!(true)));

        let mut bad = Map::new();
        bad.insert(INTERNAL_KEY.to_owned(), json!({}));
        assert!(store.set_store(bad).is_err());
    }

    #[test]
    fn unchanged_set_does_not_fire_events() {
        use std::sync::{Arc, Mutex};
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        store.set("a", 1).unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        store
            .on_did_change(
                "a",
                Box::new(move |new, old| {
                    sink.lock().unwrap().push((new.cloned(), old.cloned()));
                }),
            )
            .unwrap();

        store.set("a", 1).unwrap(); // same value, no event
        store.set("a", 2).unwrap();
        store.delete("a").unwrap();

        let events = fired.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (Some(json!(2)), Some(json!(1))),
                (None, Some(json!(2))),
            ]
        );
    }

    #[test]
    fn callbacks_may_unsubscribe_themselves() {
        use std::sync::{Arc, Mutex};
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let fired = Arc::new(Mutex::new(0u32));
        let handle = store.clone();
        let slot_in = Arc::clone(&slot);
        let fired_in = Arc::clone(&fired);
        let sub = store
            .on_did_change(
                "a",
                Box::new(move |_, _| {
                    *fired_in.lock().unwrap() += 1;
                    if let Some(sub) = slot_in.lock().unwrap().take() {
                        assert!(handle.unsubscribe(sub));
                    }
                }),
            )
            .unwrap();
        *slot.lock().unwrap() = Some(sub);

        store.set("a", 1).unwrap(); // fires once and removes itself
        store.set("a", 2).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn callbacks_may_mutate_the_store() {
        use std::sync::{Arc, Mutex};
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());

        let handle = store.clone();
        let seen = Arc::new(Mutex::new(None));
        let seen_in = Arc::clone(&seen);
        store
            .on_did_change(
                "a",
                Box::new(move |new, _| {
                    handle.set("mirror", new.cloned()).unwrap();
                    *seen_in.lock().unwrap() = new.cloned();
                }),
            )
            .unwrap();

        store.set("a", 7).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(json!(7)));
        assert_eq!(store.get("mirror").unwrap(), Some(json!(7)));
    }

    #[test]
    fn any_change_listener_sees_document_snapshots() {
        use std::sync::{Arc, Mutex};
        let dir = tempdir().unwrap();
        let store = open_in(dir.path());
        let count = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&count);
        let sub = store.on_did_any_change(Box::new(move |_, _| {
            *sink.lock().unwrap() += 1;
        }));
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        assert!(store.unsubscribe(sub));
        store.set("c", 3).unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
