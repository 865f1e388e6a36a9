//! # keyfort-storage
//!
//! Storage abstraction layer for the Keyfort session service.
//!
//! This crate defines the storage port — the [`SessionStore`] capability
//! trait the core calls for all durable reads and writes — together with the
//! persisted record types and the [`StorageError`] taxonomy.
//!
//! # Implementations
//!
//! Storage implementations are provided in separate crates:
//!
//! - `keyfort-db-memory` — in-memory backend for tests and single-node use

pub mod error;
pub mod traits;
pub mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{SessionStore, StorageResult};
pub use types::{
    CodePurpose, KeyAlgorithm, KeyMaterial, RefreshRetryWindow, SessionRecord, ShortLivedCode,
    SigningKeyRecord,
};
