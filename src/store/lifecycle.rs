//! Store construction and the read/persist plumbing.
//!
//! Responsibilities:
//! - Resolve the file path and read the existing document (decrypt,
//!   deserialize, corrupt-config handling).
//! - Materialize schema defaults and option defaults into a fresh or
//!   partial document, validate, and write back when anything changed.
//! - Run pending migrations against the caller's project version.
//! - Spawn the external-change watcher when asked to.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde_json::{Map, Value};

use crate::context::DurabilityContext;
use crate::crypto;
use crate::error::{Result, StoreError};
use crate::events::ChangeBus;
use crate::migrations::{self, Migrations};
use crate::schema::SchemaGate;
use crate::types::options::{default_deserialize, default_serialize};
use crate::types::{DeserializeFn, SerializeFn, StoreOptions};
use crate::writer::{self, WriteOptions};

/// `(mtime, len)` of the file at the last point this process wrote or
/// reloaded it; the watcher uses it to skip our own writes.
pub(crate) type FileSignature = Option<(SystemTime, u64)>;

pub(crate) struct StoreInner {
    pub(crate) doc: Map<String, Value>,
    pub(crate) path: PathBuf,
    pub(crate) ctx: DurabilityContext,
    pub(crate) serialize: SerializeFn,
    pub(crate) deserialize: DeserializeFn,
    pub(crate) encryption_key: Option<String>,
    pub(crate) dot_notation: bool,
    pub(crate) clear_invalid: bool,
    /// Schema defaults overlaid with option defaults; what `reset` and
    /// `clear` restore.
    pub(crate) base_defaults: Map<String, Value>,
    pub(crate) gate: Option<SchemaGate>,
    pub(crate) write_opts: WriteOptions,
    pub(crate) read_timeout: Duration,
    pub(crate) signature: FileSignature,
}

impl StoreInner {
    /// Serialize, optionally encrypt, and atomically write `doc`.
    pub(crate) fn write_document(&self, doc: &Map<String, Value>) -> Result<()> {
        let mut bytes = (self.serialize)(doc).map_err(|reason| StoreError::Serialization {
            reason,
        })?;
        if let Some(key) = &self.encryption_key {
            bytes = crypto::encrypt(&bytes, key);
        }
        writer::write_file_atomic(&self.ctx, &self.path, &bytes, &self.write_opts)
    }

    pub(crate) fn refresh_signature(&mut self) {
        self.signature = std::fs::metadata(&self.path)
            .ok()
            .and_then(|meta| Some((meta.modified().ok()?, meta.len())));
    }

    /// Read the document back off disk. `None` file → empty document.
    pub(crate) fn read_document(&self) -> Result<Map<String, Value>> {
        read_document(
            &self.ctx,
            &self.path,
            self.read_timeout,
            self.encryption_key.as_deref(),
            &self.deserialize,
            self.clear_invalid,
        )
    }

    pub(crate) fn validate(&self, doc: &Map<String, Value>) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.validate(doc)?;
        }
        Ok(())
    }
}

/// Durable key-value configuration store over a single JSON document.
///
/// Cheap to clone; all clones share one document, one change bus, and one
/// durability context, and every mutation is serialized through the
/// per-path queue so concurrent `set`s from different threads land whole.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Mutex<StoreInner>>,
    pub(crate) bus: Arc<Mutex<ChangeBus>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.path();
        f.debug_struct("Store").field("path", &path).finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store described by `options`.
    ///
    /// Order of operations: read and decode the existing file, overlay it
    /// on the declared defaults, validate, persist if anything changed,
    /// then run migrations. Any failure leaves the on-disk file as it
    /// was, except migrations, which persist each fully-completed step.
    pub fn open(options: StoreOptions) -> Result<Self> {
        let path = options.resolved_path()?;
        let ctx = options.context.clone().unwrap_or_default();

        let gate = match &options.schema {
            Some(schema) => Some(SchemaGate::compile(schema)?),
            None => None,
        };
        let mut base_defaults = gate
            .as_ref()
            .map(|gate| gate.defaults().clone())
            .unwrap_or_default();
        for (key, value) in &options.defaults {
            base_defaults.insert(key.clone(), value.clone());
        }

        let serialize: SerializeFn = options
            .serialize
            .clone()
            .unwrap_or_else(|| Arc::new(default_serialize));
        let deserialize: DeserializeFn = options
            .deserialize
            .clone()
            .unwrap_or_else(|| Arc::new(default_deserialize));

        let disk_doc = read_document(
            &ctx,
            &path,
            options.write_timeout,
            options.encryption_key.as_deref(),
            &deserialize,
            options.clear_invalid_config,
        )?;

        // File content wins over defaults, shallowly, like the original.
        let mut doc = base_defaults.clone();
        for (key, value) in &disk_doc {
            doc.insert(key.clone(), value.clone());
        }

        let mut inner = StoreInner {
            doc,
            path,
            ctx,
            serialize,
            deserialize,
            encryption_key: options.encryption_key.clone(),
            dot_notation: options.access_properties_by_dot_notation,
            clear_invalid: options.clear_invalid_config,
            base_defaults,
            gate,
            write_opts: WriteOptions {
                mode: Some(options.config_file_mode),
                owner: None,
                fsync: options.fsync,
                timeout: options.write_timeout,
            },
            read_timeout: options.write_timeout,
            signature: None,
        };

        inner.validate(&inner.doc)?;
        if inner.doc != disk_doc {
            inner.write_document(&inner.doc)?;
        }

        run_migrations(&mut inner, &options.migrations, options.project_version.as_deref())?;
        inner.refresh_signature();

        let store = Self {
            inner: Arc::new(Mutex::new(inner)),
            bus: Arc::new(Mutex::new(ChangeBus::default())),
        };
        if options.watch {
            super::watch::spawn(&store);
        }
        Ok(store)
    }

    /// The resolved path of the backing file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.lock_inner().path.clone()
    }

    pub(crate) fn lock_inner(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn run_migrations(
    inner: &mut StoreInner,
    migrations: &Migrations,
    project_version: Option<&str>,
) -> Result<()> {
    if migrations.is_empty() {
        return Ok(());
    }
    let Some(target) = project_version else {
        return Err(StoreError::InvalidVersion {
            key: "project_version".into(),
            reason: "required when migrations are supplied".into(),
        });
    };
    // The document is moved out for the run so the persist callback can
    // borrow the write plumbing (gate included) from `inner`.
    let dot = inner.dot_notation;
    let mut doc = std::mem::take(&mut inner.doc);
    let outcome = migrations::run(&mut doc, migrations, target, dot, |snapshot| {
        // Transforms mutate the raw document, so the gate runs here: a
        // violating transform fails its persist and rolls back.
        inner.validate(snapshot)?;
        let mut bytes =
            (inner.serialize)(snapshot).map_err(|reason| StoreError::Serialization { reason })?;
        if let Some(key) = &inner.encryption_key {
            bytes = crypto::encrypt(&bytes, key);
        }
        writer::write_file_atomic(&inner.ctx, &inner.path, &bytes, &inner.write_opts)
    });
    inner.doc = doc;
    outcome
}

fn read_document(
    ctx: &DurabilityContext,
    path: &std::path::Path,
    timeout: Duration,
    encryption_key: Option<&str>,
    deserialize: &DeserializeFn,
    clear_invalid: bool,
) -> Result<Map<String, Value>> {
    let Some(raw) = writer::read_file(ctx, path, timeout)? else {
        return Ok(Map::new());
    };
    let bytes = match encryption_key {
        // Format auto-detected inside; a failed decrypt hands the bytes
        // back and falls through to the corrupt path below.
        Some(key) => crypto::decrypt(&raw, key),
        None => raw,
    };
    let parsed = (deserialize)(&bytes);
    match parsed {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => invalid_config(path, format!("expected object, got {}", type_of(&other)), clear_invalid),
        Err(reason) => invalid_config(path, reason, clear_invalid),
    }
}

fn invalid_config(
    path: &std::path::Path,
    reason: String,
    clear_invalid: bool,
) -> Result<Map<String, Value>> {
    if clear_invalid {
        tracing::warn!(path = %path.display(), %reason, "invalid config, starting from an empty document");
        Ok(Map::new())
    } else {
        Err(StoreError::InvalidConfig {
            path: path.to_path_buf(),
            reason,
        })
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
