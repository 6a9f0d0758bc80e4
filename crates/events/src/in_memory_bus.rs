//! In-process event bus.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{instrument, warn};

use crate::bus::{DeliveryReport, EventBus, RegistrationError, SubscriberError, SubscriberFailure};
use crate::{EventEnvelope, EventHandler};

struct Subscription {
    name: String,
    handler: Arc<dyn EventHandler>,
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// In-process pub/sub bus.
///
/// - Subscribers are registered at startup through `&mut self`; once the bus is
///   shared (typically behind an `Arc`) the subscriber list is read without locking
/// - Delivery is sequential, in registration order
/// - Each subscriber gets at most `subscriber_timeout` per event
/// - Errors, timeouts and panics are isolated per subscriber and logged
#[derive(Debug)]
pub struct InMemoryEventBus {
    name: String,
    subscribers: Vec<Subscription>,
    subscriber_timeout: Duration,
}

impl InMemoryEventBus {
    pub const DEFAULT_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create an empty bus; `name` labels its log lines.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Vec::new(),
            subscriber_timeout: Self::DEFAULT_SUBSCRIBER_TIMEOUT,
        }
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout = timeout;
        self
    }

    /// Register a named delivery target.
    pub fn subscribe(
        &mut self,
        name: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Result<(), RegistrationError> {
        let name = name.into();
        if self.subscribers.iter().any(|s| s.name == name) {
            return Err(RegistrationError::DuplicateSubscriber(name));
        }

        self.subscribers.push(Subscription {
            name,
            handler: Arc::new(handler),
        });
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscriber names in delivery order.
    pub fn subscriber_names(&self) -> impl Iterator<Item = &str> {
        self.subscribers.iter().map(|s| s.name.as_str())
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    #[instrument(
        skip_all,
        fields(
            bus = %self.name,
            event_id = %event.event_id(),
            event_type = event.event_type(),
            aggregate_id = %event.aggregate_id(),
            stream_version = event.stream_version()
        )
    )]
    async fn publish(&self, event: &EventEnvelope) -> DeliveryReport {
        let mut report = DeliveryReport::new(event.event_id());

        for sub in &self.subscribers {
            match deliver(sub.handler.as_ref(), event, self.subscriber_timeout).await {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        bus = %self.name,
                        subscriber = %sub.name,
                        error = %error,
                        "subscriber delivery failed"
                    );
                    report.failures.push(SubscriberFailure {
                        subscriber: sub.name.clone(),
                        error,
                    });
                }
            }
        }

        report
    }
}

async fn deliver(
    handler: &dyn EventHandler,
    event: &EventEnvelope,
    timeout: Duration,
) -> Result<(), SubscriberError> {
    let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();

    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(SubscriberError::TimedOut(timeout)),
        Ok(Err(panic)) => Err(SubscriberError::Panicked(panic_message(panic.as_ref()))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;
    use userserver_core::AggregateId;
    use uuid::Uuid;

    use super::*;
    use crate::handler_fn;

    fn envelope(version: u64) -> EventEnvelope {
        EventEnvelope::new(
            Uuid::now_v7(),
            AggregateId::parse("user-1").unwrap(),
            "user",
            version,
            "user.registered",
            1,
            Utc::now(),
            None,
            json!({ "version": version }),
        )
    }

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &'static str,
    ) -> impl EventHandler + 'static {
        let log = log.clone();
        handler_fn(move |env: EventEnvelope| {
            let log = log.clone();
            async move {
                log.lock()
                    .unwrap()
                    .push(format!("{name}@{}", env.stream_version()));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn delivers_to_every_subscriber_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = InMemoryEventBus::new("test");
        bus.subscribe("first", recorder(&log, "first")).unwrap();
        bus.subscribe("second", recorder(&log, "second")).unwrap();

        let report = bus.publish(&envelope(1)).await;
        bus.publish(&envelope(2)).await;

        assert!(report.is_clean());
        assert_eq!(report.delivered, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first@1", "second@1", "first@2", "second@2"]
        );
    }

    #[tokio::test]
    async fn a_failing_subscriber_does_not_block_the_next_one() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = InMemoryEventBus::new("test");
        bus.subscribe(
            "broken",
            handler_fn(|_env: EventEnvelope| async { Err(SubscriberError::failed("boom")) }),
        )
        .unwrap();
        bus.subscribe("after", recorder(&log, "after")).unwrap();

        let report = bus.publish(&envelope(1)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(
            report.failures,
            vec![SubscriberFailure {
                subscriber: "broken".to_string(),
                error: SubscriberError::failed("boom"),
            }]
        );
        assert_eq!(*log.lock().unwrap(), vec!["after@1"]);
    }

    fn explode() -> Result<(), SubscriberError> {
        panic!("projection bug")
    }

    #[tokio::test]
    async fn a_panicking_subscriber_is_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = InMemoryEventBus::new("test");
        bus.subscribe(
            "panics",
            handler_fn(|_env: EventEnvelope| async { explode() }),
        )
        .unwrap();
        bus.subscribe("after", recorder(&log, "after")).unwrap();

        let report = bus.publish(&envelope(1)).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.failures[0].error,
            SubscriberError::Panicked("projection bug".to_string())
        );
        assert_eq!(*log.lock().unwrap(), vec!["after@1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_subscriber_times_out_without_blocking_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus =
            InMemoryEventBus::new("test").with_subscriber_timeout(Duration::from_millis(100));
        bus.subscribe(
            "slow",
            handler_fn(|_env: EventEnvelope| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .unwrap();
        bus.subscribe("after", recorder(&log, "after")).unwrap();

        let report = bus.publish(&envelope(1)).await;

        assert_eq!(
            report.failures[0].error,
            SubscriberError::TimedOut(Duration::from_millis(100))
        );
        assert_eq!(*log.lock().unwrap(), vec!["after@1"]);
    }

    #[test]
    fn duplicate_subscriber_names_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = InMemoryEventBus::new("test");
        bus.subscribe("users", recorder(&log, "a")).unwrap();

        let err = bus.subscribe("users", recorder(&log, "b")).unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateSubscriber("users".to_string()));
        assert_eq!(bus.subscriber_names().collect::<Vec<_>>(), vec!["users"]);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_clean_no_op() {
        let bus = InMemoryEventBus::new("test");
        let report = bus.publish(&envelope(1)).await;
        assert!(report.is_clean());
        assert_eq!(report.delivered, 0);
    }
}
