//! Tagged key storage.
//!
//! The minimal storage surface the node's background services need:
//! querying keys by an integer tag expression and batch-deleting them. The
//! in-memory implementation backs tests and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

pub mod expiry;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid query expression: {0}")]
    InvalidQuery(String),

    #[error("store: {0}")]
    Store(String),
}

/// A single store mutation. Only deletes are needed here.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Key to delete.
    pub key: String,
}

/// Iterator over matching keys.
pub type KeyIterator = Box<dyn Iterator<Item = Result<String, StoreError>> + Send>;

/// A store of keys with integer tags.
pub trait Store: Send + Sync {
    /// Query keys by a tag expression of the form `tag<=value`.
    fn query(&self, expression: &str) -> Result<KeyIterator, StoreError>;

    /// Apply a batch of delete operations.
    fn batch(&self, operations: &[Operation]) -> Result<(), StoreError>;
}

/// Parse a `tag<=value` expression.
fn parse_query(expression: &str) -> Result<(&str, i64), StoreError> {
    let (tag, value) = expression
        .split_once("<=")
        .ok_or_else(|| StoreError::InvalidQuery(expression.to_string()))?;

    let value = value
        .parse()
        .map_err(|_| StoreError::InvalidQuery(expression.to_string()))?;

    Ok((tag, value))
}

/// In-memory tagged store.
#[derive(Default)]
pub struct MemStore {
    entries: RwLock<HashMap<String, HashMap<String, i64>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key with its tags.
    pub fn put(&self, key: impl Into<String>, tags: &[(&str, i64)]) {
        let tags = tags
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        self.entries
            .write()
            .expect("entries lock")
            .insert(key.into(), tags);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().expect("entries lock").contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("entries lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemStore {
    fn query(&self, expression: &str) -> Result<KeyIterator, StoreError> {
        let (tag, bound) = parse_query(expression)?;

        let entries = self.entries.read().expect("entries lock");
        let matches: Vec<Result<String, StoreError>> = entries
            .iter()
            .filter(|(_, tags)| tags.get(tag).is_some_and(|value| *value <= bound))
            .map(|(key, _)| Ok(key.clone()))
            .collect();

        Ok(Box::new(matches.into_iter()))
    }

    fn batch(&self, operations: &[Operation]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("entries lock");
        for op in operations {
            entries.remove(&op.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_tag_bound() {
        let store = MemStore::new();
        store.put("a", &[("expires", 100)]);
        store.put("b", &[("expires", 200)]);
        store.put("c", &[("other", 50)]);

        let mut keys: Vec<String> = store
            .query("expires<=150")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        keys.sort();

        assert_eq!(keys, vec!["a".to_string()]);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let store = MemStore::new();
        assert!(matches!(
            store.query("expires>150"),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            store.query("expires<=abc"),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn batch_deletes_keys() {
        let store = MemStore::new();
        store.put("a", &[("expires", 100)]);
        store.put("b", &[("expires", 200)]);

        store
            .batch(&[Operation {
                key: "a".to_string(),
            }])
            .unwrap();

        assert!(!store.contains("a"));
        assert!(store.contains("b"));
    }
}
