//! Local store adapter
//!
//! The state machine only needs a byte-keyed associative store with a durability
//! flush and a full scan. `LocalStore` is that contract; `FileStore` is the
//! log-structured implementation the server runs on.

use std::io;
use std::path::Path;

use thiserror::Error;

mod datafile;
mod file_store;

pub use file_store::FileStore;

/// A key/value pair yielded by a full scan.
pub type Item = (Vec<u8>, Vec<u8>);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,
    #[error("store is already closed")]
    Closed,
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupted data file: {0}")]
    Corrupted(String),
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Contract the replicated state machine consumes.
///
/// Iteration order is unspecified, but a store must iterate a given dataset in
/// the same order for as long as it stays open.
pub trait LocalStore: Send + Sync + Sized {
    /// Opens the store rooted at `dir`, creating it if absent.
    fn open(dir: &Path) -> Result<Self>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Returns `StoreError::KeyNotFound` when the key is absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Deleting a missing key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Blocks until every accepted write is durable.
    fn sync(&self) -> Result<()>;

    /// Full scan over live pairs. The iterator ending is the "iteration done" signal;
    /// any `Err` item is a real failure.
    fn items(&self) -> Box<dyn Iterator<Item = Result<Item>> + '_>;

    fn close(self) -> Result<()>;
}
