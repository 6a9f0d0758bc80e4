//! Event store on top of a key-sorted `StorageBackend`.
//!
//! ## Layout
//!
//! One backend table holds every stream. An event is one item:
//! `partition_key = aggregate id`, `sort_key = version`, `body = StoredEvent` as JSON.
//!
//! ## Optimistic Concurrency
//!
//! `append()`:
//! 1. Reads the stream head (latest item) to learn the current version
//! 2. Validates it against `expected_version`
//! 3. Writes versions `current + 1 ..` with a conditional, all-or-nothing put
//!
//! Two writers that both pass step 2 race in step 3; the backend's "sort key must
//! not exist" condition lets exactly one of them win. No lock is held in-process.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tracing::{instrument, warn};

use userserver_core::{AggregateId, ExpectedVersion};

use super::backend::{BackendError, Item, StorageBackend};
use super::r#trait::{EventStore, EventStoreError, EventStream, StoredEvent, UncommittedEvent};

/// Event store persisting streams as items of a partitioned table.
#[derive(Debug)]
pub struct KeyedEventStore<B> {
    backend: Arc<B>,
    table: String,
    page_size: usize,
}

impl<B> KeyedEventStore<B>
where
    B: StorageBackend,
{
    /// Items fetched per backend round-trip while streaming.
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    pub fn new(backend: Arc<B>, table: impl Into<String>) -> Self {
        Self {
            backend,
            table: table.into(),
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current version of a stream (0 if it has no events).
    pub async fn current_version(&self, aggregate_id: &AggregateId) -> Result<u64, EventStoreError> {
        Ok(self.head(aggregate_id).await?.map(|e| e.version).unwrap_or(0))
    }

    async fn head(&self, aggregate_id: &AggregateId) -> Result<Option<StoredEvent>, EventStoreError> {
        self.backend
            .latest(&self.table, aggregate_id.as_str())
            .await
            .map_err(from_backend)?
            .map(|item| decode(&item))
            .transpose()
    }
}

#[async_trait]
impl<B> EventStore for KeyedEventStore<B>
where
    B: StorageBackend,
{
    #[instrument(
        skip(self, events),
        fields(
            aggregate_id = %aggregate_id,
            expected_version = %expected_version,
            event_count = events.len()
        ),
        err
    )]
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_type = events[0].aggregate_type.clone();
        if let Some(idx) = events.iter().position(|e| e.aggregate_type != aggregate_type) {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }

        let head = self.head(aggregate_id).await?;
        let current = head.as_ref().map(|e| e.version).unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency {
                aggregate_id: aggregate_id.clone(),
                expected: expected_version,
                actual: current,
            });
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = &head {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, version)| StoredEvent {
                event_id: e.event_id,
                aggregate_id: aggregate_id.clone(),
                aggregate_type: e.aggregate_type,
                version,
                event_type: e.event_type,
                schema_version: e.schema_version,
                occurred_at: e.occurred_at,
                issued_by: e.issued_by,
                payload: e.payload,
            })
            .collect();

        let items = committed
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>, _>>()?;

        match self.backend.put_all_absent(&self.table, items).await {
            Ok(()) => Ok(committed),
            Err(BackendError::ConditionFailed { .. }) => {
                // Lost the race: someone appended between our head read and our put.
                let actual = match self.current_version(aggregate_id).await {
                    Ok(actual) => actual,
                    Err(e) => {
                        warn!(error = %e, "could not re-read stream head after a lost race");
                        current + 1
                    }
                };
                Err(EventStoreError::Concurrency {
                    aggregate_id: aggregate_id.clone(),
                    expected: expected_version,
                    actual,
                })
            }
            Err(e) => Err(from_backend(e)),
        }
    }

    fn load_stream_after(&self, aggregate_id: &AggregateId, after: u64) -> EventStream {
        let backend = self.backend.clone();
        let table = self.table.clone();
        let partition = aggregate_id.clone();
        let page_size = self.page_size;

        // `Some(after)` = fetch the page after this version, `None` = exhausted.
        let pages = stream::try_unfold(Some(after), move |cursor| {
            let backend = backend.clone();
            let table = table.clone();
            let partition = partition.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };

                let items = backend
                    .query(&table, partition.as_str(), after, page_size)
                    .await
                    .map_err(from_backend)?;
                if items.is_empty() {
                    return Ok(None);
                }

                let next = if items.len() < page_size {
                    None
                } else {
                    items.last().map(|i| i.sort_key)
                };
                let events = items.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
                Ok(Some((events, next)))
            }
        });

        let aggregate_id = aggregate_id.clone();
        let mut expected = after + 1;

        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, EventStoreError>)))
            .try_flatten()
            .map(move |res| {
                res.and_then(|event| {
                    if event.aggregate_id != aggregate_id {
                        return Err(EventStoreError::Corrupted(format!(
                            "stream {aggregate_id} contains an event of {}",
                            event.aggregate_id
                        )));
                    }
                    if event.version != expected {
                        return Err(EventStoreError::Corrupted(format!(
                            "stream {aggregate_id}: expected version {expected}, found {}",
                            event.version
                        )));
                    }
                    expected += 1;
                    Ok(event)
                })
            })
            .boxed()
    }

    #[instrument(skip(self), err)]
    async fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EventStoreError> {
        self.backend
            .partitions(&self.table)
            .await
            .map_err(from_backend)?
            .into_iter()
            .map(|key| {
                AggregateId::parse(key.as_str()).map_err(|e| {
                    EventStoreError::Corrupted(format!("partition '{key}' is not an aggregate id: {e}"))
                })
            })
            .collect()
    }
}

fn encode(event: &StoredEvent) -> Result<Item, EventStoreError> {
    let body = serde_json::to_string(event)
        .map_err(|e| EventStoreError::InvalidAppend(format!("event serialization failed: {e}")))?;

    Ok(Item {
        partition_key: event.aggregate_id.to_string(),
        sort_key: event.version,
        body,
    })
}

fn decode(item: &Item) -> Result<StoredEvent, EventStoreError> {
    let event: StoredEvent = serde_json::from_str(&item.body).map_err(|e| {
        EventStoreError::Corrupted(format!(
            "undecodable item {}/{}: {e}",
            item.partition_key, item.sort_key
        ))
    })?;

    if event.version != item.sort_key {
        return Err(EventStoreError::Corrupted(format!(
            "item {}/{} holds version {}",
            item.partition_key, item.sort_key, event.version
        )));
    }

    Ok(event)
}

fn from_backend(err: BackendError) -> EventStoreError {
    match err {
        BackendError::Unavailable(msg) => EventStoreError::StorageUnavailable(msg),
        BackendError::Invalid(msg) => EventStoreError::InvalidAppend(msg),
        // Only the append path issues conditional puts and it handles this itself.
        BackendError::ConditionFailed {
            partition_key,
            sort_key,
        } => EventStoreError::InvalidAppend(format!(
            "unexpected write condition failure on {partition_key}/{sort_key}"
        )),
    }
}
