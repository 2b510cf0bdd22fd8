//! Public types exposed by the `confstore` crate.

pub mod options;

pub use options::{DeserializeFn, SerializeFn, StoreOptions, StoreOptionsBuilder};
