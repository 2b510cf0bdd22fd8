//! Forward-compatible data migrations keyed by semver.
//!
//! The watermark (`__internal__.migrations.version`) records the last
//! fully applied step. Transforms run in ascending order; each success
//! persists the watermark and refreshes the rollback snapshot, so a
//! retried migration resumes after the last step that completed rather
//! than from zero. A failing transform restores (and re-persists) the
//! snapshot and surfaces the failing version.

use std::sync::Arc;

use semver::{Version, VersionReq};
use serde_json::{Map, Value};

use crate::constants::{INITIAL_VERSION, MIGRATION_KEY};
use crate::error::{Result, StoreError};
use crate::paths::{self, KeyPath};

/// One migration transform. Runs against a [`MigrationView`] of the
/// document; returning an error rolls the whole migration back.
pub type MigrationFn = Arc<dyn Fn(&mut MigrationView<'_>) -> Result<()> + Send + Sync>;

/// Ordered map of version key → transform. Keys are exact semver versions
/// or range expressions; insertion order breaks ties among ranges.
#[derive(Clone, Default)]
pub struct Migrations {
    entries: Vec<(String, MigrationFn)>,
}

impl std::fmt::Debug for Migrations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.entries.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Migrations").field("keys", &keys).finish()
    }
}

impl Migrations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(
        mut self,
        version: impl Into<String>,
        transform: impl Fn(&mut MigrationView<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.entries.push((version.into(), Arc::new(transform)));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable window onto the document handed to transforms. Mirrors the
/// store's key operations but skips the reserved-namespace guard last:
/// transforms are engine-side code, yet they still may not touch
/// `__internal__` (the engine owns the watermark).
pub struct MigrationView<'doc> {
    doc: &'doc mut Map<String, Value>,
    dot_notation: bool,
}

impl MigrationView<'_> {
    fn parse(&self, key: &str) -> Result<KeyPath> {
        let path = if self.dot_notation {
            KeyPath::parse(key)?
        } else {
            KeyPath::literal(key)?
        };
        if path.head() == crate::constants::INTERNAL_KEY {
            return Err(StoreError::InvalidKey {
                reason: "migrations may not modify the internal namespace".into(),
            });
        }
        Ok(path)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.parse(key)?;
        Ok(paths::get_path(self.doc, &path).cloned())
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        let path = self.parse(key)?;
        Ok(paths::has_path(self.doc, &path))
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let path = self.parse(key)?;
        paths::set_path(self.doc, &path, value.into());
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let path = self.parse(key)?;
        Ok(paths::delete_path(self.doc, &path))
    }
}

enum VersionKey {
    Exact(Version),
    Range(VersionReq),
}

fn parse_key(key: &str) -> Result<VersionKey> {
    if let Ok(version) = Version::parse(key) {
        return Ok(VersionKey::Exact(version));
    }
    VersionReq::parse(key)
        .map(VersionKey::Range)
        .map_err(|err| StoreError::InvalidVersion {
            key: key.to_owned(),
            reason: err.to_string(),
        })
}

/// Read the watermark out of the document, defaulting to `0.0.0`.
#[must_use]
pub fn read_watermark(doc: &Map<String, Value>) -> String {
    doc.get("__internal__")
        .and_then(|v| v.get("migrations"))
        .and_then(|v| v.get("version"))
        .and_then(Value::as_str)
        .unwrap_or(INITIAL_VERSION)
        .to_owned()
}

fn write_watermark(doc: &mut Map<String, Value>, version: &str) {
    // MIGRATION_KEY is a constant without escapes, parse cannot fail.
    if let Ok(path) = KeyPath::parse(MIGRATION_KEY) {
        paths::set_path(doc, &path, Value::String(version.to_owned()));
    }
}

/// Should the transform keyed by `key` run for a migration from watermark
/// `from` to `target`?
///
/// Exact keys run when `from <= key <= target`. Range keys run when the
/// range is satisfied by `target` and not already satisfied by a
/// non-initial `from`. A watermark that is itself a range string (left
/// behind by a range-keyed project version) drops the lower bound rather
/// than failing; this preserves the source engine's observable quirks.
fn should_run(key: &VersionKey, from: &str, target: &str) -> bool {
    let from_exact = Version::parse(from).ok();
    let target_exact = Version::parse(target).ok();
    match key {
        VersionKey::Exact(version) => {
            let lower = from_exact.as_ref().is_none_or(|from| version >= from);
            let upper = target_exact.as_ref().is_some_and(|target| version <= target);
            lower && upper
        }
        VersionKey::Range(range) => {
            if from != INITIAL_VERSION
                && from_exact.as_ref().is_some_and(|from| range.matches(from))
            {
                return false;
            }
            target_exact
                .as_ref()
                .is_some_and(|target| range.matches(target))
        }
    }
}

/// Run the engine over `doc`. `persist` is invoked after every watermark
/// movement (including the rollback restore) so the on-disk state always
/// tracks the in-memory one; a persist failure after a transform (schema
/// rejection, write error) rolls back exactly like a failing transform.
pub(crate) fn run(
    doc: &mut Map<String, Value>,
    migrations: &Migrations,
    project_version: &str,
    dot_notation: bool,
    mut persist: impl FnMut(&Map<String, Value>) -> Result<()>,
) -> Result<()> {
    let from = read_watermark(doc);

    let mut ordered: Vec<(&String, &MigrationFn)> = Vec::new();
    let mut exact_slots: Vec<usize> = Vec::new();
    let mut exact_versions: Vec<Version> = Vec::new();
    for (raw, transform) in &migrations.entries {
        let key = parse_key(raw)?;
        if !should_run(&key, &from, project_version) {
            continue;
        }
        if let VersionKey::Exact(version) = key {
            exact_slots.push(ordered.len());
            exact_versions.push(version);
        }
        ordered.push((raw, transform));
    }
    // Exact keys order ascending among themselves; range keys keep their
    // insertion positions. Done as a permutation of the exact slots only,
    // since exact and range keys have no order relative to each other.
    let mut by_version: Vec<usize> = (0..exact_slots.len()).collect();
    by_version.sort_by(|&a, &b| exact_versions[a].cmp(&exact_versions[b]));
    let originals: Vec<(&String, &MigrationFn)> =
        exact_slots.iter().map(|&slot| ordered[slot]).collect();
    for (&dest, &src) in exact_slots.iter().zip(&by_version) {
        ordered[dest] = originals[src];
    }

    let mut snapshot = doc.clone();
    let mut last_applied = from.clone();
    for (raw, transform) in ordered {
        tracing::info!(from = %last_applied, version = %raw, "running migration");
        let applied = {
            let mut view = MigrationView {
                doc: &mut *doc,
                dot_notation,
            };
            transform(&mut view)
        };
        let step = applied.and_then(|()| {
            write_watermark(doc, raw);
            persist(doc)
        });
        if let Err(err) = step {
            *doc = snapshot;
            // The restore's own write overwrites any intermediate
            // watermark already on disk.
            persist(doc)?;
            return Err(StoreError::Migration {
                from,
                to: project_version.to_owned(),
                version: raw.clone(),
                reason: err.to_string(),
            });
        }
        snapshot = doc.clone();
        last_applied = raw.clone();
    }

    // Pin the watermark to the exact project version so future
    // comparisons are well-defined; a range-shaped project version leaves
    // the last transform key in place.
    if Version::parse(project_version).is_ok() && last_applied != project_version {
        write_watermark(doc, project_version);
        persist(doc)?;
    }
    Ok(())
}
