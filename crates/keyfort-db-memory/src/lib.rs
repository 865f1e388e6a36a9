//! # keyfort-db-memory
//!
//! In-memory [`SessionStore`](keyfort_storage::SessionStore) backend.
//!
//! Used by the test suites and by single-node deployments that do not need
//! durability. All state lives behind one `tokio::sync::RwLock`, which makes
//! the conditional operations (counter compare-and-set, newest-key guard)
//! trivially atomic.

mod storage;

pub use storage::MemoryStore;
