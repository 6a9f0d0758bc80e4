use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use userserver_core::{AggregateId, PrincipalId};

/// A committed event as delivered to subscribers.
///
/// Notes:
/// - Only events that have been durably appended are ever wrapped in an envelope.
/// - `stream_version` is the event's position in its aggregate stream (starting at 1).
/// - `payload` is the untyped event body; subscribers filter on `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Contiguous position in the aggregate stream.
    stream_version: u64,

    event_type: String,
    schema_version: u32,
    occurred_at: DateTime<Utc>,
    issued_by: Option<PrincipalId>,

    payload: JsonValue,
}

impl EventEnvelope {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        stream_version: u64,
        event_type: impl Into<String>,
        schema_version: u32,
        occurred_at: DateTime<Utc>,
        issued_by: Option<PrincipalId>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            stream_version,
            event_type: event_type.into(),
            schema_version,
            occurred_at,
            issued_by,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn stream_version(&self) -> u64 {
        self.stream_version
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn issued_by(&self) -> Option<&PrincipalId> {
        self.issued_by.as_ref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}
