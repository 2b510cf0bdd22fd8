//! External-change watcher.
//!
//! A polling thread compares the file's `(mtime, len)` against the
//! signature recorded at the store's last own write or reload; on a
//! mismatch it reloads the document and runs one notification pass. The
//! thread holds only weak references and exits when the last store clone
//! is dropped.

use std::fs;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use serde_json::{Map, Value};

use crate::constants::WATCH_POLL_INTERVAL;
use crate::events::ChangeBus;

use super::lifecycle::{Store, StoreInner};

pub(super) fn spawn(store: &Store) {
    let inner: Weak<Mutex<StoreInner>> = Arc::downgrade(&store.inner);
    let bus: Weak<Mutex<ChangeBus>> = Arc::downgrade(&store.bus);
    let spawned = thread::Builder::new()
        .name("confstore-watch".into())
        .spawn(move || {
            loop {
                thread::sleep(WATCH_POLL_INTERVAL);
                let Some(inner) = inner.upgrade() else { break };
                let Some(bus) = bus.upgrade() else { break };
                if let Some(doc) = poll_once(&inner) {
                    let mut pass = bus
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .begin_notify();
                    crate::events::run_pass(&mut pass, &doc);
                    bus.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .finish_notify(pass);
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not spawn watcher thread");
    }
}

/// One poll tick: reload the document if the file changed underneath us.
/// Returns the new document when subscribers should be notified.
fn poll_once(inner: &Mutex<StoreInner>) -> Option<Map<String, Value>> {
    let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
    let current = fs::metadata(&guard.path)
        .ok()
        .and_then(|meta| Some((meta.modified().ok()?, meta.len())));
    if current == guard.signature {
        return None;
    }
    guard.signature = current;
    match guard.read_document() {
        Ok(new_doc) => {
            if new_doc == guard.doc {
                return None;
            }
            tracing::debug!(path = %guard.path.display(), "file changed externally, reloading");
            guard.doc = new_doc;
            Some(guard.doc.clone())
        }
        Err(err) => {
            tracing::warn!(path = %guard.path.display(), error = %err, "external change was unreadable, keeping current document");
            None
        }
    }
}
