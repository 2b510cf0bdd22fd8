//! The `Store` handle: construction, the read path, and all public
//! document operations.

pub mod lifecycle;
pub mod mutation;
mod watch;

pub use lifecycle::Store;
