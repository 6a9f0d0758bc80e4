//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: Command → CommandBus → EventStore → EventBus → Projection
//!
//! Verifies:
//! - Dispatched commands reach read models through the bus
//! - Subscriber failures never undo an append
//! - Storage outages surface as retryable errors with nothing published
//! - Racing dispatches on one aggregate serialize through the store, and read
//!   models still apply their events exactly once in version order
//! - SQLite streams survive reconnecting

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use userserver_core::AggregateId;
    use userserver_events::{
        Command, EventEnvelope, InMemoryEventBus, Projection, ProjectionRunner,
        ProjectionSubscriber, SubscriberError, handler_fn,
    };

    use crate::command_bus::{CommandBus, DispatchError, RetryPolicy};
    use crate::event_store::{
        BackendError, EventStore, InMemoryBackend, Item, KeyedEventStore, SqliteBackend,
        StorageBackend, StoreEventSource, load_events,
    };
    use crate::test_support::{Ledger, LedgerCommand, ledger_id};

    /// Balance per ledger, built from `ledger.deposited` events.
    #[derive(Debug, Default)]
    struct Balances {
        by_ledger: HashMap<AggregateId, u64>,
    }

    impl Projection for Balances {
        fn apply(&mut self, envelope: &EventEnvelope) {
            if envelope.event_type() != "ledger.deposited" {
                return;
            }
            let amount = envelope
                .payload()
                .pointer("/Deposited/amount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            *self
                .by_ledger
                .entry(envelope.aggregate_id().clone())
                .or_default() += amount;
        }
    }

    fn cmd(id: &str, command: &LedgerCommand) -> Command {
        Command::typed(ledger_id(id), command).unwrap()
    }

    fn deposit(id: &str, amount: u64) -> Command {
        cmd(id, &LedgerCommand::Deposit { amount })
    }

    fn wire<B: StorageBackend>(
        backend: Arc<B>,
        events: InMemoryEventBus,
    ) -> CommandBus<KeyedEventStore<B>, InMemoryEventBus> {
        let store = Arc::new(KeyedEventStore::new(backend, "events"));
        let mut bus = CommandBus::new(store, Arc::new(events));
        bus.register_aggregate(Ledger::empty).unwrap();
        bus
    }

    #[tokio::test]
    async fn dispatched_commands_reach_the_projection() {
        let balances = Arc::new(ProjectionSubscriber::new(Balances::default()));
        let mut events = InMemoryEventBus::new("test");
        events.subscribe("balances", balances.clone()).unwrap();
        let bus = wire(Arc::new(InMemoryBackend::new()), events);

        bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap();
        for amount in [5, 10, 7] {
            bus.dispatch(deposit("l-1", amount)).await.unwrap();
        }
        bus.dispatch(cmd("l-2", &LedgerCommand::OpenLedger)).await.unwrap();
        bus.dispatch(deposit("l-2", 1)).await.unwrap();

        let l1 = balances.read(|b| b.by_ledger.get(&ledger_id("l-1")).copied());
        let l2 = balances.read(|b| b.by_ledger.get(&ledger_id("l-2")).copied());
        assert_eq!(l1, Some(22));
        assert_eq!(l2, Some(1));
    }

    #[tokio::test]
    async fn rebuilt_projection_matches_the_live_one() {
        let live = Arc::new(ProjectionSubscriber::new(Balances::default()));
        let mut events = InMemoryEventBus::new("test");
        events.subscribe("balances", live.clone()).unwrap();
        let bus = wire(Arc::new(InMemoryBackend::new()), events);

        bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap();
        bus.dispatch(deposit("l-1", 3)).await.unwrap();
        bus.dispatch(deposit("l-1", 4)).await.unwrap();

        let history: Vec<EventEnvelope> = load_events(&**bus.store(), &ledger_id("l-1"))
            .await
            .unwrap()
            .iter()
            .map(|e| e.to_envelope())
            .collect();
        let rebuilt = ProjectionRunner::rebuild_from_scratch(Balances::default, &history).unwrap();

        let live_balance = live.read(|b| b.by_ledger.get(&ledger_id("l-1")).copied());
        assert_eq!(
            rebuilt.projection().by_ledger.get(&ledger_id("l-1")).copied(),
            live_balance
        );
        assert_eq!(rebuilt.cursor(&ledger_id("l-1")), 3);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_undo_the_append() {
        let reached_second = Arc::new(AtomicUsize::new(0));
        let counter = reached_second.clone();

        let mut events = InMemoryEventBus::new("test");
        events
            .subscribe(
                "broken",
                handler_fn(|_env: EventEnvelope| async {
                    Err(SubscriberError::failed("read model offline"))
                }),
            )
            .unwrap();
        events
            .subscribe(
                "healthy",
                handler_fn(move |_env: EventEnvelope| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let bus = wire(Arc::new(InMemoryBackend::new()), events);

        let done = bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap();

        assert_eq!(done.version, 1);
        assert_eq!(reached_second.load(Ordering::SeqCst), 1);
        assert_eq!(load_events(&**bus.store(), &ledger_id("l-1")).await.unwrap().len(), 1);
    }

    /// Backend that can be switched into an outage.
    #[derive(Default)]
    struct Flaky {
        inner: InMemoryBackend,
        down: AtomicBool,
    }

    impl Flaky {
        fn check(&self) -> Result<(), BackendError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StorageBackend for Flaky {
        async fn query(
            &self,
            table: &str,
            partition_key: &str,
            after: u64,
            limit: usize,
        ) -> Result<Vec<Item>, BackendError> {
            self.check()?;
            self.inner.query(table, partition_key, after, limit).await
        }

        async fn latest(&self, table: &str, partition_key: &str) -> Result<Option<Item>, BackendError> {
            self.check()?;
            self.inner.latest(table, partition_key).await
        }

        async fn partitions(&self, table: &str) -> Result<Vec<String>, BackendError> {
            self.check()?;
            self.inner.partitions(table).await
        }

        async fn put_all_absent(&self, table: &str, items: Vec<Item>) -> Result<(), BackendError> {
            self.check()?;
            self.inner.put_all_absent(table, items).await
        }
    }

    #[tokio::test]
    async fn storage_outage_is_retryable_and_publishes_nothing() {
        let published = Arc::new(AtomicUsize::new(0));
        let counter = published.clone();
        let mut events = InMemoryEventBus::new("test");
        events
            .subscribe(
                "counter",
                handler_fn(move |_env: EventEnvelope| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let backend = Arc::new(Flaky::default());
        let bus = wire(backend.clone(), events);

        backend.down.store(true, Ordering::SeqCst);
        let err = bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap_err();
        assert!(matches!(err, DispatchError::StorageUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(published.load(Ordering::SeqCst), 0);

        backend.down.store(false, Ordering::SeqCst);
        let done = bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap();
        assert_eq!(done.version, 1);
        assert_eq!(published.load(Ordering::SeqCst), 1);
    }

    /// Versions in the order the projection applied them.
    #[derive(Debug, Default)]
    struct AppliedVersions(Vec<u64>);

    impl Projection for AppliedVersions {
        fn apply(&mut self, envelope: &EventEnvelope) {
            self.0.push(envelope.stream_version());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_dispatches_on_one_aggregate_all_land() {
        let store_backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(KeyedEventStore::new(store_backend, "events"));

        let applied = Arc::new(
            ProjectionSubscriber::new(AppliedVersions::default())
                .with_source(Arc::new(StoreEventSource::new(store.clone()))),
        );
        let mut events = InMemoryEventBus::new("test");
        events.subscribe("applied", applied.clone()).unwrap();

        let mut bus = CommandBus::new(store.clone(), Arc::new(events)).with_retry_policy(
            RetryPolicy {
                max_conflict_retries: 16,
            },
        );
        bus.register_aggregate(Ledger::empty).unwrap();
        let bus = Arc::new(bus);

        bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap();

        let tasks: Vec<_> = (1..=8)
            .map(|amount| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.dispatch(deposit("l-1", amount)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let history = load_events(&*store, &ledger_id("l-1")).await.unwrap();
        let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
        assert_eq!(versions, (1..=9).collect::<Vec<_>>());

        // Every dispatch has published before returning, so the read model is complete.
        assert_eq!(applied.read(|p| p.0.clone()), (1..=9).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_first_subscriber_does_not_cost_the_directory_an_update() {
        use userserver_users::{User, UserDirectory};

        let store = Arc::new(KeyedEventStore::new(Arc::new(InMemoryBackend::new()), "events"));
        let directory = Arc::new(
            ProjectionSubscriber::new(UserDirectory::new())
                .with_source(Arc::new(StoreEventSource::new(store.clone()))),
        );

        let mut events = InMemoryEventBus::new("test");
        events
            .subscribe(
                "slow_audit",
                handler_fn(|env: EventEnvelope| async move {
                    if env.stream_version() == 2 {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    Ok(())
                }),
            )
            .unwrap();
        events.subscribe("user_directory", directory.clone()).unwrap();

        let mut bus = CommandBus::new(store.clone(), Arc::new(events));
        bus.register_aggregate(User::empty).unwrap();
        let bus = Arc::new(bus);

        let user = AggregateId::parse("u-1").unwrap();
        bus.dispatch(Command::new(
            "RegisterUser",
            user.clone(),
            serde_json::json!({ "email": "a@x.io" }),
        ))
        .await
        .unwrap();

        // Whichever change lands as version 2 stalls in the audit subscriber while
        // the other one commits and publishes version 3.
        let changes: Vec<_> = ["b@x.io", "c@x.io"]
            .into_iter()
            .map(|email| {
                let bus = bus.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    bus.dispatch(Command::new(
                        "ChangeEmailAddress",
                        user,
                        serde_json::json!({ "email": email }),
                    ))
                    .await
                })
            })
            .collect();
        for change in changes {
            change.await.unwrap().unwrap();
        }

        let history = load_events(&*store, &user).await.unwrap();
        assert_eq!(history.len(), 3);
        let last_email = history[2]
            .payload
            .pointer("/EmailAddressChanged/email")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let entry = directory.read(|d| d.get(&user).map(|e| (e.email.clone(), e.version)));
        assert_eq!(entry, last_email.map(|email| (email, 3)));
        assert_eq!(directory.cursor(&user), 3);
    }

    #[tokio::test]
    async fn dropping_the_dispatch_after_append_keeps_the_write() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let mut events = InMemoryEventBus::new("test");
        events
            .subscribe(
                "slow",
                handler_fn(move |_env: EventEnvelope| {
                    let counter = counter.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let bus = wire(Arc::new(InMemoryBackend::new()), events);

        // Give up while the commit task is still publishing.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(load_events(&**bus.store(), &ledger_id("l-1")).await.unwrap().len(), 1);
    }

    fn audit_event() -> crate::event_store::UncommittedEvent {
        crate::event_store::UncommittedEvent {
            event_id: uuid::Uuid::now_v7(),
            aggregate_type: "ledger".to_string(),
            event_type: "ledger.audited".to_string(),
            schema_version: 1,
            occurred_at: chrono::Utc::now(),
            issued_by: None,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn sqlite_streams_survive_reconnecting() {
        let path = std::env::temp_dir().join(format!("userserver-{}.db", uuid::Uuid::now_v7()));
        let url = format!("sqlite://{}?mode=rwc", path.display());

        {
            let backend = Arc::new(SqliteBackend::connect(&url).await.unwrap());
            backend.create_table("events").await.unwrap();
            let bus = wire(backend.clone(), InMemoryEventBus::new("test"));
            bus.dispatch(cmd("l-1", &LedgerCommand::OpenLedger)).await.unwrap();
            bus.dispatch(deposit("l-1", 9)).await.unwrap();
            backend.close().await;
        }

        let backend = Arc::new(SqliteBackend::connect(&url).await.unwrap());
        backend.create_table("events").await.unwrap();
        let store = KeyedEventStore::new(backend.clone(), "events");

        let history = load_events(&store, &ledger_id("l-1")).await.unwrap();
        assert_eq!(
            history.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["ledger.opened", "ledger.deposited"]
        );

        let next = store
            .append(
                &ledger_id("l-1"),
                userserver_core::ExpectedVersion::Exact(2),
                vec![audit_event()],
            )
            .await
            .unwrap();
        assert_eq!(next[0].version, 3);

        backend.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
