//! Host-bridge interface.
//!
//! The process hosting the store exposes it to other contexts through a
//! synchronous request/response channel carrying exactly three
//! operations: `get`, `set`, `delete`. A background service thread owns a
//! store handle; any number of cloned [`BridgeClient`]s issue blocking
//! requests without holding their own file handles.

use std::sync::mpsc::{Sender, channel};
use std::thread;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::Store;

enum Request {
    Get {
        key: String,
        reply: Sender<Result<Option<Value>>>,
    },
    Set {
        key: String,
        value: Value,
        reply: Sender<Result<()>>,
    },
    Delete {
        key: String,
        reply: Sender<Result<bool>>,
    },
}

/// Clonable handle to the bridge service thread.
#[derive(Clone)]
pub struct BridgeClient {
    tx: Sender<Request>,
}

/// Start the service thread for `store` and hand back a client. The
/// thread exits once every client clone is dropped.
pub fn serve(store: Store) -> BridgeClient {
    let (tx, rx) = channel::<Request>();
    let spawned = thread::Builder::new()
        .name("confstore-bridge".into())
        .spawn(move || {
            while let Ok(request) = rx.recv() {
                // A dropped reply receiver just means the client gave up
                // waiting; nothing to do about it.
                match request {
                    Request::Get { key, reply } => {
                        let _ = reply.send(store.get(&key));
                    }
                    Request::Set { key, value, reply } => {
                        let _ = reply.send(store.set(&key, value));
                    }
                    Request::Delete { key, reply } => {
                        let _ = reply.send(store.delete(&key));
                    }
                }
            }
            tracing::debug!("bridge service thread stopping");
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not spawn bridge thread");
    }
    BridgeClient { tx }
}

impl BridgeClient {
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let (reply, response) = channel();
        self.tx
            .send(Request::Get {
                key: key.to_owned(),
                reply,
            })
            .map_err(|_| closed())?;
        response.recv().map_err(|_| closed())?
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let (reply, response) = channel();
        self.tx
            .send(Request::Set {
                key: key.to_owned(),
                value,
                reply,
            })
            .map_err(|_| closed())?;
        response.recv().map_err(|_| closed())?
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        let (reply, response) = channel();
        self.tx
            .send(Request::Delete {
                key: key.to_owned(),
                reply,
            })
            .map_err(|_| closed())?;
        response.recv().map_err(|_| closed())?
    }
}

fn closed() -> StoreError {
    StoreError::BridgeClosed {
        reason: "service thread stopped".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreOptions;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn request_response_triple_round_trips() {
        let dir = tempdir().unwrap();
        let store = Store::open(StoreOptions::builder().cwd(dir.path()).build()).unwrap();
        let client = serve(store.clone());

        client.set("session.user", json!("ada")).unwrap();
        assert_eq!(client.get("session.user").unwrap(), Some(json!("ada")));
        // Bridge writes are visible to the direct handle and vice versa.
        assert_eq!(store.get("session.user").unwrap(), Some(json!("ada")));
        store.set("session.role", json!("admin")).unwrap();
        assert_eq!(client.get("session.role").unwrap(), Some(json!("admin")));

        assert!(client.delete("session.user").unwrap());
        assert_eq!(client.get("session.user").unwrap(), None);
    }

    #[test]
    fn clients_can_be_shared_across_threads() {
        let dir = tempdir().unwrap();
        let store = Store::open(StoreOptions::builder().cwd(dir.path()).build()).unwrap();
        let client = serve(store);

        let mut handles = Vec::new();
        for i in 0..4 {
            let client = client.clone();
            handles.push(std::thread::spawn(move || {
                client.set(&format!("worker{i}"), json!(i)).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for i in 0..4 {
            assert_eq!(client.get(&format!("worker{i}")).unwrap(), Some(json!(i)));
        }
    }

    #[test]
    fn reserved_keys_fail_across_the_bridge_too() {
        let dir = tempdir().unwrap();
        let store = Store::open(StoreOptions::builder().cwd(dir.path()).build()).unwrap();
        let client = serve(store);
        assert!(client.set("__internal__.x", json!(1)).is_err());
    }
}
