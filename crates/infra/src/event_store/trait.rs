use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use userserver_core::{AggregateId, ExpectedVersion, PrincipalId};
use userserver_events::EventEnvelope;

/// An event ready to be appended to a stream (not yet assigned a version).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: Created by an aggregate's `handle()` method
/// 2. **UncommittedEvent**: Serialized and wrapped with metadata
/// 3. **StoredEvent**: Persisted with its assigned stream version
/// 4. **EventEnvelope**: Published to the event bus for subscribers
///
/// Use `UncommittedEvent::from_typed()` to build one from a typed domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_type: String,

    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub issued_by: Option<PrincipalId>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream.
///
/// ## Versions
///
/// Versions are assigned by the event store during append and are:
/// - **Contiguous**: the first event of a stream is version 1, each next one is last + 1
/// - **Stream-scoped**: versions are per aggregate
/// - **Immutable**: once assigned, versions never change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream.
    pub version: u64,

    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub issued_by: Option<PrincipalId>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id.clone(),
            self.aggregate_type.clone(),
            self.version,
            self.event_type.clone(),
            self.schema_version,
            self.occurred_at,
            self.issued_by.clone(),
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to domain errors (validation,
/// invariants).
///
/// ## Error Categories
///
/// - **Concurrency**: the stream is not at the expected version (someone else appended)
/// - **StorageUnavailable**: backend I/O failed; safe to retry with backoff
/// - **AggregateTypeMismatch**: append would mix aggregate types in one stream
/// - **InvalidAppend**: the request itself is malformed
/// - **Corrupted**: stored data violates stream invariants (gaps, undecodable items)
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed for {aggregate_id}: expected {expected}, found {actual}")]
    Concurrency {
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("corrupted stream: {0}")]
    Corrupted(String),
}

/// Lazy, finite stream of stored events in ascending version order.
pub type EventStream = BoxStream<'static, Result<StoredEvent, EventStoreError>>;

/// Append-only, per-aggregate event store.
///
/// ## Design Principles
///
/// - **No storage assumptions**: implementations sit on top of any key-sorted store
/// - **Optimistic locking**: via `ExpectedVersion` (no locks held across load-decide-append)
/// - **Append-only**: events cannot be modified or deleted
///
/// ## Append Semantics
///
/// `append()`:
/// - Checks optimistic concurrency (stream version must match expected)
/// - Assigns versions `current + 1 ..= current + n`
/// - Persists events atomically (all or nothing)
/// - Is a successful no-op for an empty batch
///
/// ## Load Semantics
///
/// `load_stream()`:
/// - Yields every event of the aggregate in version order
/// - Yields nothing (not an error) for an aggregate without events
/// - Reads lazily; each call starts a fresh read, so it can be restarted at will
/// - Observes every append that returned success before the call (read-your-writes)
///
/// `load_stream_after()` is the same read starting past a known version; read
/// models use it to fetch only the events they missed.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to an aggregate stream.
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Open a read over the full stream of an aggregate.
    fn load_stream(&self, aggregate_id: &AggregateId) -> EventStream {
        self.load_stream_after(aggregate_id, 0)
    }

    /// Open a read over the events of an aggregate with `version > after`.
    fn load_stream_after(&self, aggregate_id: &AggregateId, after: u64) -> EventStream;

    /// Every aggregate with at least one event.
    async fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(aggregate_id, expected_version, events).await
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> EventStream {
        (**self).load_stream(aggregate_id)
    }

    fn load_stream_after(&self, aggregate_id: &AggregateId, after: u64) -> EventStream {
        (**self).load_stream_after(aggregate_id, after)
    }

    async fn aggregate_ids(&self) -> Result<Vec<AggregateId>, EventStoreError> {
        (**self).aggregate_ids().await
    }
}

/// Read a whole stream into memory.
pub async fn load_events<S>(
    store: &S,
    aggregate_id: &AggregateId,
) -> Result<Vec<StoredEvent>, EventStoreError>
where
    S: EventStore + ?Sized,
{
    store.load_stream(aggregate_id).try_collect().await
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    ///
    /// Captures the event metadata needed to deserialize the payload later.
    pub fn from_typed<E>(
        aggregate_type: impl Into<String>,
        event: &E,
        issued_by: Option<PrincipalId>,
    ) -> Result<Self, EventStoreError>
    where
        E: userserver_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            schema_version: event.version(),
            occurred_at: event.occurred_at(),
            issued_by,
            payload,
        })
    }
}
