//! Storage collaborator
//!
//! The worker touches durable state only through the small operation set
//! of the [`StorageBackend`] trait: systems by port, metric
//! value/trend updates, history append/compaction, alarm lifecycle
//! writes, siren and settings reads.

pub mod backend;
pub mod error;
pub mod memory;

#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;

#[cfg(feature = "storage-sqlite")]
pub use sqlite::SqliteBackend;
