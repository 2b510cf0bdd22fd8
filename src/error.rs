//! Error types for the confstore crate.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// All failure modes surfaced by the store.
///
/// Transient filesystem errors are retried internally and only reach the
/// caller as [`StoreError::Io`] after the retry deadline expires. Nothing
/// here is fatal to the process; every variant returns control to the
/// caller.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error, already past the retry deadline if it was transient.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The file exists but its content does not deserialize to a JSON object.
    /// Only raised when `clear_invalid_config` is off.
    #[error("invalid config at {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    /// Serialization of the document failed (custom codecs can fail).
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// A key targeted the reserved internal namespace or used an unsafe
    /// path segment (`__proto__`, `prototype`, `constructor`).
    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    /// The schema rejected the document. `details` aggregates every
    /// field-level violation as `` `<path>` <message>; ... ``.
    #[error("config schema violation: {details}")]
    SchemaViolation { details: String },

    /// The supplied JSON Schema itself failed to compile.
    #[error("invalid schema: {reason}")]
    InvalidSchema { reason: String },

    /// A version key in the migrations map is neither an exact semver
    /// version nor a parseable range.
    #[error("invalid migration version key `{key}`: {reason}")]
    InvalidVersion { key: String, reason: String },

    /// A migration transform failed. The document has been restored to the
    /// last fully-migrated snapshot before this was raised.
    #[error("migration from {from} to {to} failed at `{version}`: {reason}")]
    Migration {
        from: String,
        to: String,
        version: String,
        reason: String,
    },

    /// The host bridge service thread is gone.
    #[error("bridge disconnected: {reason}")]
    BridgeClosed { reason: String },
}

impl StoreError {
    /// True when a failed write left the document untouched, i.e. the
    /// caller can safely retry with corrected input.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidKey { .. } | StoreError::SchemaViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: StoreError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.to_string().contains("i/o error"));
    }

    #[test]
    fn schema_violation_message_carries_details() {
        let err = StoreError::SchemaViolation {
            details: "`/windowBounds/width` expected number; `/theme` expected string".into(),
        };
        assert!(err.to_string().contains("`/theme` expected string"));
        assert!(err.is_validation());
    }

    #[test]
    fn migration_error_names_failing_version() {
        let err = StoreError::Migration {
            from: "0.0.0".into(),
            to: "2.0.0".into(),
            version: "1.5.0".into(),
            reason: "rename failed".into(),
        };
        assert!(err.to_string().contains("`1.5.0`"));
        assert!(!err.is_validation());
    }
}
