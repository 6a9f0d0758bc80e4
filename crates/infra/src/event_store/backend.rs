//! Durable storage boundary underneath the event store.
//!
//! The event store only needs two capabilities from a backend:
//!
//! - read the items of one partition ordered by sort key
//! - a conditional put that refuses to overwrite an existing sort key
//! - a scan of the partition keys present in a table (used to rebuild read models)
//!
//! Event streams map onto this as `partition = aggregate id`, `sort key = version`.
//! The conditional put is the only serialization point between racing writers.

use async_trait::async_trait;
use thiserror::Error;

/// One stored row of a partitioned, key-sorted table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub partition_key: String,
    pub sort_key: u64,
    pub body: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A conditional put found the sort key already present.
    #[error("item {partition_key}/{sort_key} already exists")]
    ConditionFailed { partition_key: String, sort_key: u64 },

    /// I/O or connectivity failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The request can never succeed (e.g. an invalid table name).
    #[error("invalid request: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Items of `partition_key` with `sort_key > after`, ascending, at most `limit`.
    async fn query(
        &self,
        table: &str,
        partition_key: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Item>, BackendError>;

    /// The item with the greatest sort key in `partition_key`, if any.
    async fn latest(&self, table: &str, partition_key: &str) -> Result<Option<Item>, BackendError>;

    /// Every partition key holding at least one item, ascending.
    async fn partitions(&self, table: &str) -> Result<Vec<String>, BackendError>;

    /// Insert every item, or none of them if any `(partition_key, sort_key)` exists.
    async fn put_all_absent(&self, table: &str, items: Vec<Item>) -> Result<(), BackendError>;
}
