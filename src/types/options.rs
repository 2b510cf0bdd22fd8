//! Builder-style construction options for a [`crate::Store`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::{DEFAULT_FILE_MODE, DEFAULT_RETRY_TIMEOUT};
use crate::context::DurabilityContext;
use crate::error::Result;
use crate::migrations::Migrations;
use crate::writer::FsyncMode;

/// Pluggable document encoder. String errors keep custom codecs decoupled
/// from the crate's error type.
pub type SerializeFn =
    Arc<dyn Fn(&Map<String, Value>) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// Pluggable document decoder. A returned error takes the corrupt-config
/// path, the same as a JSON parse failure.
pub type DeserializeFn =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Value, String> + Send + Sync>;

/// Everything a store can be configured with. Defaults give a plain
/// `config.json` in the supplied directory: no schema, no encryption, no
/// migrations, dot notation on.
#[derive(Clone)]
pub struct StoreOptions {
    /// Full path to the config file. Wins over `name`/`cwd` when set.
    pub path: Option<PathBuf>,
    /// Basename (without extension) used when `path` is not given.
    pub name: String,
    /// Directory holding the file when `path` is not given. The caller
    /// resolves OS app-data conventions; falls back to the current dir.
    pub cwd: Option<PathBuf>,
    pub file_extension: String,
    /// Seed values merged under whatever the file already contains.
    pub defaults: Map<String, Value>,
    /// JSON Schema for the whole document.
    pub schema: Option<Value>,
    /// Enables the encryption envelope for reads and writes.
    pub encryption_key: Option<String>,
    pub serialize: Option<SerializeFn>,
    pub deserialize: Option<DeserializeFn>,
    pub config_file_mode: u32,
    /// Treat an unparseable file as an empty document instead of failing.
    pub clear_invalid_config: bool,
    pub access_properties_by_dot_notation: bool,
    /// Poll the file for external changes and fire change events.
    pub watch: bool,
    pub migrations: Migrations,
    /// Target watermark for the migration engine.
    pub project_version: Option<String>,
    pub fsync: FsyncMode,
    /// Retry deadline for each filesystem operation chain.
    pub write_timeout: Duration,
    /// Shared durability context; one per store unless injected.
    pub context: Option<DurabilityContext>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: None,
            name: "config".to_owned(),
            cwd: None,
            file_extension: "json".to_owned(),
            defaults: Map::new(),
            schema: None,
            encryption_key: None,
            serialize: None,
            deserialize: None,
            config_file_mode: DEFAULT_FILE_MODE,
            clear_invalid_config: false,
            access_properties_by_dot_notation: true,
            watch: false,
            migrations: Migrations::new(),
            project_version: None,
            fsync: FsyncMode::Sync,
            write_timeout: DEFAULT_RETRY_TIMEOUT,
            context: None,
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("cwd", &self.cwd)
            .field("file_extension", &self.file_extension)
            .field("schema", &self.schema.is_some())
            .field("encrypted", &self.encryption_key.is_some())
            .field("clear_invalid_config", &self.clear_invalid_config)
            .field("watch", &self.watch)
            .field("migrations", &self.migrations)
            .field("project_version", &self.project_version)
            .finish_non_exhaustive()
    }
}

impl StoreOptions {
    /// Start a fluent builder for `StoreOptions`.
    #[must_use]
    pub fn builder() -> StoreOptionsBuilder {
        StoreOptionsBuilder::default()
    }

    /// The file path this configuration resolves to.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };
        Ok(cwd.join(format!("{}.{}", self.name, self.file_extension)))
    }
}

#[derive(Debug, Default)]
pub struct StoreOptionsBuilder {
    inner: StoreOptions,
}

impl StoreOptionsBuilder {
    #[must_use]
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.inner.path = Some(path.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.inner.name = name.into();
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.inner.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn file_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.inner.file_extension = extension.into();
        self
    }

    /// Seed defaults from any serializable value; non-object values are
    /// ignored (the document is always an object).
    #[must_use]
    pub fn defaults<T: Serialize>(mut self, defaults: &T) -> Self {
        if let Ok(Value::Object(map)) = serde_json::to_value(defaults) {
            self.inner.defaults = map;
        }
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: Value) -> Self {
        self.inner.schema = Some(schema);
        self
    }

    #[must_use]
    pub fn encryption_key<S: Into<String>>(mut self, key: S) -> Self {
        self.inner.encryption_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn serialize_with(mut self, serialize: SerializeFn) -> Self {
        self.inner.serialize = Some(serialize);
        self
    }

    #[must_use]
    pub fn deserialize_with(mut self, deserialize: DeserializeFn) -> Self {
        self.inner.deserialize = Some(deserialize);
        self
    }

    #[must_use]
    pub fn config_file_mode(mut self, mode: u32) -> Self {
        self.inner.config_file_mode = mode;
        self
    }

    #[must_use]
    pub fn clear_invalid_config(mut self, enabled: bool) -> Self {
        self.inner.clear_invalid_config = enabled;
        self
    }

    #[must_use]
    pub fn access_properties_by_dot_notation(mut self, enabled: bool) -> Self {
        self.inner.access_properties_by_dot_notation = enabled;
        self
    }

    #[must_use]
    pub fn watch(mut self, enabled: bool) -> Self {
        self.inner.watch = enabled;
        self
    }

    #[must_use]
    pub fn migrations(mut self, migrations: Migrations) -> Self {
        self.inner.migrations = migrations;
        self
    }

    #[must_use]
    pub fn project_version<S: Into<String>>(mut self, version: S) -> Self {
        self.inner.project_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn fsync(mut self, mode: FsyncMode) -> Self {
        self.inner.fsync = mode;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.inner.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn context(mut self, context: DurabilityContext) -> Self {
        self.inner.context = Some(context);
        self
    }

    #[must_use]
    pub fn build(self) -> StoreOptions {
        self.inner
    }
}

/// Default codec: pretty-printed JSON, tab-indented, trailing newline.
pub(crate) fn default_serialize(doc: &Map<String, Value>) -> std::result::Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut serializer).map_err(|e| e.to_string())?;
    buf.push(b'\n');
    Ok(buf)
}

pub(crate) fn default_deserialize(bytes: &[u8]) -> std::result::Result<Value, String> {
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}
