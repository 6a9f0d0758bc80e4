use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{EventEnvelope, SubscriberError};

/// Receives published events (subscriber abstraction).
///
/// A handler sees **every** event published on the bus it is subscribed to and is
/// responsible for ignoring event types it does not care about.
///
/// ## Idempotency
///
/// Delivery is at-least-once: the same envelope (same `event_id` and
/// `stream_version`) may arrive more than once. Handlers must tolerate that.
///
/// ## Errors
///
/// Returning an error marks this delivery as failed in the `DeliveryReport`. It does
/// not affect other subscribers nor the command that produced the event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventEnvelope) -> Result<(), SubscriberError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(&self, event: &EventEnvelope) -> Result<(), SubscriberError> {
        (**self).handle(event).await
    }
}

/// Adapter turning an async closure into an `EventHandler`.
#[derive(Debug, Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Build a subscriber from `|envelope| async move { ... }`.
///
/// The closure receives its own clone of the envelope so the returned future can be
/// `'static`.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SubscriberError>> + Send + 'static,
{
    async fn handle(&self, event: &EventEnvelope) -> Result<(), SubscriberError> {
        (self.f)(event.clone()).await
    }
}
