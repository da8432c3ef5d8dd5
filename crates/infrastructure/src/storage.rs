//! `sled`-backed implementation of `domain::storage::KvStore`.

use dashmap::DashMap;
use domain::error::DomainError;
use domain::storage::{KvStore, Transaction};
use std::ops::ControlFlow;

pub struct SledTransaction<'a> {
    db: &'a sled::Db,
    batch: sled::Batch,
}

impl<'a> Transaction for SledTransaction<'a> {
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), DomainError> {
        self.batch.insert(key.as_bytes(), value);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), DomainError> {
        self.batch.remove(key.as_bytes());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DomainError> {
        self.db
            .get(key.as_bytes())
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| DomainError::Storage(e.to_string()))
    }
}

type IndexProjection = Box<dyn Fn(&str, &[u8]) -> Option<String> + Send + Sync>;

/// Implements the Storage Engine contract over an embedded `sled::Db`.
/// Secondary indexes are maintained as separate `sled::Tree`s, populated
/// eagerly on every `set`/`transaction` commit whose key falls under the
/// index's registered prefix.
pub struct SledStore {
    db: sled::Db,
    indexes: DashMap<String, (String, IndexProjection)>,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self, DomainError> {
        let db = sled::open(path).map_err(|e| DomainError::Storage(e.to_string()))?;
        Ok(SledStore {
            db,
            indexes: DashMap::new(),
        })
    }

    fn apply_indexes(&self, key: &str, value: &[u8]) -> Result<(), DomainError> {
        for entry in self.indexes.iter() {
            let (prefix, project) = entry.value();
            if !key.starts_with(prefix.as_str()) {
                continue;
            }
            if let Some(index_key) = project(key, value) {
                let tree = self
                    .db
                    .open_tree(format!("idx:{}", entry.key()))
                    .map_err(|e| DomainError::Storage(e.to_string()))?;
                tree.insert(index_key.as_bytes(), key.as_bytes())
                    .map_err(|e| DomainError::Storage(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl KvStore for SledStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), DomainError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| DomainError::Storage(e.to_string()))?;
        self.apply_indexes(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DomainError> {
        self.db
            .get(key.as_bytes())
            .map(|opt| opt.map(|v| v.to_vec()))
            .map_err(|e| DomainError::Storage(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), DomainError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| DomainError::Storage(e.to_string()))?;
        Ok(())
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn Transaction) -> Result<(), DomainError>,
    ) -> Result<(), DomainError> {
        let mut tx = SledTransaction {
            db: &self.db,
            batch: sled::Batch::default(),
        };
        f(&mut tx)?;
        self.db
            .apply_batch(tx.batch)
            .map_err(|e| DomainError::Storage(e.to_string()))?;
        Ok(())
    }

    fn iterate_range(
        &self,
        start: &str,
        end: &str,
        f: &mut dyn FnMut(&str, &[u8]) -> ControlFlow<()>,
    ) -> Result<(), DomainError> {
        for item in self.db.range(start.as_bytes()..end.as_bytes()) {
            let (k, v) = item.map_err(|e| DomainError::Storage(e.to_string()))?;
            let key = std::str::from_utf8(&k).map_err(|e| DomainError::Storage(e.to_string()))?;
            if f(key, &v).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn register_index(
        &self,
        name: &str,
        prefix: &str,
        project: Box<dyn Fn(&str, &[u8]) -> Option<String> + Send + Sync>,
    ) -> Result<(), DomainError> {
        self.indexes
            .insert(name.to_string(), (prefix.to_string(), project));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (SledStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
        (store, dir)
    }

    #[test]
    fn set_and_get_round_trip() {
        let (store, _dir) = open_tmp();
        store.set("k1", b"v1").unwrap();
        assert_eq!(store.get("k1").unwrap(), Some(b"v1".to_vec()));
        assert!(store.exists("k1").unwrap());
    }

    #[test]
    fn delete_removes_key() {
        let (store, _dir) = open_tmp();
        store.set("k1", b"v1").unwrap();
        store.delete("k1").unwrap();
        assert_eq!(store.get("k1").unwrap(), None);
    }

    #[test]
    fn transaction_commits_atomically() {
        let (store, _dir) = open_tmp();
        store
            .transaction(&mut |tx| {
                tx.set("a", b"1")?;
                tx.set("b", b"2")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn iterate_range_respects_bounds_and_order() {
        let (store, _dir) = open_tmp();
        for (k, v) in [("a:1", "1"), ("a:2", "2"), ("a:3", "3"), ("b:1", "4")] {
            store.set(k, v.as_bytes()).unwrap();
        }
        let mut seen = Vec::new();
        store
            .iterate_range("a:", "a;", &mut |k, v| {
                seen.push((k.to_string(), v.to_vec()));
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, "a:1");
    }

    #[test]
    fn iterate_range_can_stop_early() {
        let (store, _dir) = open_tmp();
        for i in 0..5 {
            store.set(&format!("k:{i}"), b"x").unwrap();
        }
        let mut count = 0;
        store
            .iterate_range("k:", "k;", &mut |_, _| {
                count += 1;
                if count == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(count, 2);
    }
}
