//! Local key/value persistence.
//!
//! This module defines the [`KeyStore`] trait the SDK persists every cached
//! record through, the [`StorageKey`] builders that name those records, and
//! two implementations: [`MemoryKeyStore`] and [`SqliteKeyStore`].
//!
//! # Architecture
//!
//! ```text
//! Context
//!     └── Arc<dyn KeyStore>
//!             ├── MemoryKeyStore (process lifetime)
//!             └── SqliteKeyStore (rusqlite, single kv table)
//! ```
//!
//! Records are whole JSON documents. Every mutation reads, modifies and
//! writes a full record, so two writers of the same record race with
//! last-writer-wins semantics.

mod memory;
mod names;
mod sqlite;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryKeyStore;
pub use names::StorageKey;
pub use sqlite::SqliteKeyStore;

/// Asynchronous key/value store for cached key material.
///
/// Implementations must be `Send + Sync`; the SDK shares one store between
/// every session of a client.
///
/// # Example
///
/// ```ignore
/// use keyweave_core::store::KeyStore;
///
/// struct PlatformStore { /* ... */ }
///
/// #[async_trait::async_trait]
/// impl KeyStore for PlatformStore {
///     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> { /* ... */ }
///     // ... other methods
/// }
/// ```
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Returns
    ///
    /// `Ok(Some(bytes))` if found, `Ok(None)` if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deletes `key`. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    async fn delete(&self, key: &str) -> Result<()>;
}
