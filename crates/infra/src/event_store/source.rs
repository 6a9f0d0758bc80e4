//! Event store as the catch-up source of projection subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;

use userserver_core::AggregateId;
use userserver_events::{EventEnvelope, EventSource, SubscriberError};

use super::r#trait::{EventStore, EventStoreError};

/// Serves committed history to `ProjectionSubscriber::with_source`.
pub struct StoreEventSource<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> StoreEventSource<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> EventSource for StoreEventSource<S>
where
    S: EventStore + ?Sized + 'static,
{
    async fn aggregate_ids(&self) -> Result<Vec<AggregateId>, SubscriberError> {
        self.store.aggregate_ids().await.map_err(read_failed)
    }

    async fn events_after(
        &self,
        aggregate_id: &AggregateId,
        after: u64,
    ) -> Result<Vec<EventEnvelope>, SubscriberError> {
        self.store
            .load_stream_after(aggregate_id, after)
            .map_ok(|event| event.to_envelope())
            .try_collect()
            .await
            .map_err(read_failed)
    }
}

fn read_failed(err: EventStoreError) -> SubscriberError {
    SubscriberError::failed(format!("could not read history: {err}"))
}

#[cfg(test)]
mod tests {
    use userserver_core::ExpectedVersion;

    use super::*;
    use crate::event_store::{InMemoryBackend, KeyedEventStore, UncommittedEvent};
    use crate::test_support::{LedgerEvent, ledger_id};

    #[tokio::test]
    async fn serves_the_tail_of_a_stream_as_envelopes() {
        let store: Arc<dyn EventStore> =
            Arc::new(KeyedEventStore::new(Arc::new(InMemoryBackend::new()), "events"));
        let events = (1..=3)
            .map(|amount| {
                let event = LedgerEvent::Deposited {
                    amount,
                    at: chrono::Utc::now(),
                };
                UncommittedEvent::from_typed("ledger", &event, None).unwrap()
            })
            .collect();
        store
            .append(&ledger_id("l-1"), ExpectedVersion::Exact(0), events)
            .await
            .unwrap();

        let source = StoreEventSource::new(store);
        let tail = source.events_after(&ledger_id("l-1"), 1).await.unwrap();

        assert_eq!(tail.iter().map(|e| e.stream_version()).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(tail[0].event_type(), "ledger.deposited");
        assert_eq!(source.aggregate_ids().await.unwrap(), vec![ledger_id("l-1")]);
    }
}
