//! The narrow key/value contract the Storage Engine exposes to the rest of
//! the system. Deliberately thin so it can be backed by any embedded store;
//! this crate defines only the trait, the concrete `sled`-backed
//! implementation lives in `infrastructure`.

use crate::error::DomainError;
use std::ops::ControlFlow;

/// A single read/write unit of work. Implementations guarantee the writes
/// made through a `Transaction` are applied atomically.
pub trait Transaction {
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), DomainError>;
    fn delete(&mut self, key: &str) -> Result<(), DomainError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DomainError>;
}

/// The embedded key/value store contract used by the Message Log, Command
/// Tracker, Event Processor, and Device Registry for durable state.
pub trait KvStore: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), DomainError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DomainError>;
    fn delete(&self, key: &str) -> Result<(), DomainError>;
    fn exists(&self, key: &str) -> Result<bool, DomainError> {
        Ok(self.get(key)?.is_some())
    }

    /// Runs `f` against a transaction; `f`'s writes are committed only if it
    /// returns `Ok`.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), DomainError>,
    ) -> Result<(), DomainError>;

    /// Iterates keys in `[start, end)` in ascending byte order, calling `f`
    /// for each; `f` returning `ControlFlow::Break(())` stops iteration
    /// early without an error (used by range scans with a result limit).
    fn iterate_range(
        &self,
        start: &str,
        end: &str,
        f: &mut dyn FnMut(&str, &[u8]) -> ControlFlow<()>,
    ) -> Result<(), DomainError>;

    /// Registers a secondary index: whenever a key under `prefix` is
    /// written, `project` computes the index key it should be reachable
    /// under. Concrete stores are free to implement this eagerly or lazily.
    fn register_index(
        &self,
        name: &str,
        prefix: &str,
        project: Box<dyn Fn(&str, &[u8]) -> Option<String> + Send + Sync>,
    ) -> Result<(), DomainError>;
}
