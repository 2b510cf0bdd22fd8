#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions)]
//
// Strategic lint exceptions, allowed project-wide for pragmatic reasons:
//
// Documentation lints: internal/self-documenting functions don't need
// extensive docs; public APIs should still have proper documentation.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Return value wrapping: some functions use Result for consistency even
// when they currently can't fail, so error conditions can be added
// without breaking the API.
#![allow(clippy::unnecessary_wraps)]
//
// Config structs naturally have many flags, and builders take owned
// values intentionally.
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Crash-safe, single-file configuration store.
//!
//! A `confstore` [`Store`] keeps one JSON document on disk and guarantees
//! that every write either fully lands or fully fails, across process
//! crashes, concurrent writers in the same process, and transient
//! filesystem errors. On top of the atomic write path it offers optional
//! transparent encryption, schema-gated writes, semver-keyed migrations,
//! and change notification.
//!
//! ```no_run
//! use confstore::{Store, StoreOptions};
//! use serde_json::json;
//!
//! # fn main() -> confstore::Result<()> {
//! let store = Store::open(
//!     StoreOptions::builder()
//!         .cwd("/path/to/app-data")
//!         .defaults(&json!({"windowBounds": {"width": 800, "height": 600}}))
//!         .build(),
//! )?;
//! store.set("windowBounds.width", 1280)?;
//! assert_eq!(store.get("windowBounds.width")?, Some(json!(1280)));
//! # Ok(())
//! # }
//! ```

/// The confstore crate version (matches `Cargo.toml`).
pub const CONFSTORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bridge;
pub mod constants;
pub mod context;
pub mod crypto;
pub mod error;
pub mod events;
pub mod migrations;
pub mod paths;
pub mod retry;
pub mod schema;
pub mod store;
pub mod types;
pub mod writer;

pub use bridge::{BridgeClient, serve};
pub use context::{DescriptorPermit, DescriptorThrottle, DurabilityContext, PathQueue, PathTicket};
pub use error::{Result, StoreError};
pub use events::{ChangeCallback, Subscription};
pub use migrations::{MigrationView, Migrations};
pub use paths::KeyPath;
pub use retry::{ErrorClass, RetryPolicy, with_retry};
pub use schema::SchemaGate;
pub use store::Store;
pub use types::{DeserializeFn, SerializeFn, StoreOptions, StoreOptionsBuilder};
pub use writer::{FsyncMode, WriteOptions, read_file, write_file_atomic};
