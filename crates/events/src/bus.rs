//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** - a pub/sub mechanism for distributing
//! committed events to named consumers (projections, side-effect handlers, etc.).
//!
//! ## Design Philosophy
//!
//! The event bus is intentionally **lightweight**:
//!
//! - **Decoupled from persistence**: events are appended to the event store first; the bus
//!   only distributes what is already durable
//! - **No pre-filtering**: every subscriber receives every event and filters by type itself
//! - **Failure isolation**: one subscriber failing never stops delivery to the next one and
//!   never rolls back the append
//!
//! ## Why At-Least-Once?
//!
//! A dispatch that is retried after an ambiguous failure may publish an event a second
//! time, and a projection may be re-synced from the store. Consumers must therefore be
//! idempotent - processing the same event multiple times should produce the same result
//! (or be a no-op). `ProjectionRunner` implements that by tracking stream versions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::EventEnvelope;

/// Why a single subscriber did not accept an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    /// The subscriber signalled an error.
    #[error("subscriber failed: {0}")]
    Failed(String),

    /// The subscriber did not finish within the per-subscriber timeout.
    #[error("subscriber timed out after {0:?}")]
    TimedOut(Duration),

    /// The subscriber panicked while handling the event.
    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

impl SubscriberError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A delivery that failed for one named subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub subscriber: String,
    pub error: SubscriberError,
}

/// Outcome of one `publish` call, per subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub event_id: Uuid,
    pub delivered: usize,
    pub failures: Vec<SubscriberFailure>,
}

impl DeliveryReport {
    pub fn new(event_id: Uuid) -> Self {
        Self {
            event_id,
            delivered: 0,
            failures: Vec::new(),
        }
    }

    /// True when every subscriber accepted the event.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Configuration errors raised while wiring buses at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// A second handler was registered for the same command type.
    #[error("a handler is already registered for command type '{0}'")]
    DuplicateHandler(String),

    /// A second subscriber was registered under the same name.
    #[error("a subscriber named '{0}' is already registered")]
    DuplicateSubscriber(String),
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ## Architecture Role
///
/// ```text
/// Command → Event Store (append events) → Event Bus (publish) → Subscribers
///                                                                  ├─ Projections
///                                                                  └─ Side effects
/// ```
///
/// Events are **stored first** (in the event store), then **published** (via the bus).
/// If a subscriber fails, the event is still in the store and the subscriber can be
/// re-synced from there.
///
/// ## Delivery Guarantees
///
/// - Every currently registered subscriber receives each published event once per call
/// - Subscribers are called in registration order
/// - Publishing never fails as a whole; per-subscriber failures are returned in the
///   `DeliveryReport` and logged
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`, meaning implementations must be safe to share across
/// tasks. Many dispatches can publish concurrently.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &EventEnvelope) -> DeliveryReport;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, event: &EventEnvelope) -> DeliveryReport {
        (**self).publish(event).await
    }
}
