use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use super::backend::{BackendError, Item, StorageBackend};

type Table = HashMap<String, BTreeMap<u64, String>>;

/// In-memory key-sorted backend.
///
/// Intended for tests/dev. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> BackendError {
    BackendError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Item>, BackendError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;

        let Some(partition) = tables.get(table).and_then(|t| t.get(partition_key)) else {
            return Ok(vec![]);
        };

        Ok(partition
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(sort_key, body)| Item {
                partition_key: partition_key.to_string(),
                sort_key: *sort_key,
                body: body.clone(),
            })
            .collect())
    }

    async fn latest(&self, table: &str, partition_key: &str) -> Result<Option<Item>, BackendError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;

        Ok(tables
            .get(table)
            .and_then(|t| t.get(partition_key))
            .and_then(|p| p.last_key_value())
            .map(|(sort_key, body)| Item {
                partition_key: partition_key.to_string(),
                sort_key: *sort_key,
                body: body.clone(),
            }))
    }

    async fn partitions(&self, table: &str) -> Result<Vec<String>, BackendError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;

        let mut keys: Vec<String> = tables
            .get(table)
            .map(|t| {
                t.iter()
                    .filter(|(_, p)| !p.is_empty())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn put_all_absent(&self, table: &str, items: Vec<Item>) -> Result<(), BackendError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let table = tables.entry(table.to_string()).or_default();

        // Check everything first so a failed batch leaves no trace.
        for item in &items {
            let taken = table
                .get(&item.partition_key)
                .is_some_and(|p| p.contains_key(&item.sort_key));
            if taken {
                return Err(BackendError::ConditionFailed {
                    partition_key: item.partition_key.clone(),
                    sort_key: item.sort_key,
                });
            }
        }

        for item in items {
            table
                .entry(item.partition_key)
                .or_default()
                .insert(item.sort_key, item.body);
        }

        Ok(())
    }
}
