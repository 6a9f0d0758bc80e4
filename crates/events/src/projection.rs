use crate::EventEnvelope;

/// A projection builds a read model from published events.
///
/// Projections implement the **CQRS read model pattern**: they transform events (write
/// model) into queryable state (read model). They live outside the command path: a
/// projection that falls behind or fails never affects whether a command succeeded.
///
/// ## Filtering
///
/// The bus does not pre-filter. `apply` receives every event and should ignore
/// event types it does not understand.
///
/// ## Idempotency
///
/// Delivery is at-least-once. Wrap a projection in a `ProjectionRunner` (or
/// `ProjectionSubscriber`) to get per-aggregate version tracking, which skips
/// duplicate deliveries before `apply` is called.
///
/// ## Disposability
///
/// Read models are **disposable**: they can be dropped and rebuilt from the event store
/// at any time with `ProjectionRunner::rebuild_from_scratch`.
pub trait Projection: Send + 'static {
    /// Apply a single event to the read model.
    fn apply(&mut self, envelope: &EventEnvelope);
}
