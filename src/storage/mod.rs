//! Contact storage.
//!
//! [`ContactStore`] is the contract the resolver depends on;
//! [`InMemoryContactStore`] is the reference backend used for embedding and tests.

pub mod memory;
mod traits;

pub use memory::InMemoryContactStore;
pub use traits::{ContactStore, StorageError};
