//! Named, versioned response caching.
//!
//! This module provides the persistence side of the engine:
//! - Cache entries keyed by canonical request signature
//! - Namespaces as versioned generations with purge-on-activation
//! - SQLite-backed storage, with an in-memory store for tests

mod registry;
mod storage;

pub use registry::{CacheRegistry, NamespaceHandle};
pub use storage::{CacheEntry, CacheStore, MemoryStore, SqliteStore};
