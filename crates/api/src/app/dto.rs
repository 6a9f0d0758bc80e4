//! Request/response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use userserver_infra::Dispatched;
use userserver_infra::event_store::StoredEvent;
use userserver_users::UserEntry;

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub command: String,
    /// Target aggregate; a fresh id is generated when omitted.
    #[serde(default)]
    pub aggregate_id: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub event_id: String,
    pub version: u64,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub aggregate_id: String,
    pub version: u64,
    pub events: Vec<EventSummary>,
}

impl From<Dispatched> for DispatchResponse {
    fn from(value: Dispatched) -> Self {
        Self {
            aggregate_id: value.aggregate_id.to_string(),
            version: value.version,
            events: value
                .events
                .into_iter()
                .map(|e| EventSummary {
                    event_id: e.event_id.to_string(),
                    version: e.version,
                    event_type: e.event_type,
                    occurred_at: e.occurred_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamResponse {
    pub aggregate_id: String,
    pub version: u64,
    pub events: Vec<StoredEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub user_id: String,
    pub email: String,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl From<&UserEntry> for UserResponse {
    fn from(value: &UserEntry) -> Self {
        Self {
            user_id: value.user_id.to_string(),
            email: value.email.clone(),
            registered_at: value.registered_at,
            updated_at: value.updated_at,
            version: value.version,
        }
    }
}
