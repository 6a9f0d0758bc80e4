//! Service wiring: event store, event bus, projections and the command bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use userserver_events::{Command, InMemoryEventBus, ProjectionSubscriber};
use userserver_infra::event_store::{
    EventStore, InMemoryBackend, KeyedEventStore, SqliteBackend, StoreEventSource,
};
use userserver_infra::{CommandBus, DispatchError, Dispatched, RetryPolicy};
use userserver_users::{User, UserDirectory};

use crate::config::Config;

/// Command bus over a type-erased store.
pub type AppCommandBus = CommandBus<dyn EventStore, InMemoryEventBus>;

/// Exponential backoff for `StorageUnavailable`, applied around a whole dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageBackoff {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each further one.
    pub base_delay: Duration,
}

impl Default for StorageBackoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl StorageBackoff {
    fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
    }
}

/// Everything the HTTP layer needs, constructed once at startup.
pub struct AppServices {
    pub commands: AppCommandBus,
    pub users: Arc<ProjectionSubscriber<UserDirectory>>,
    pub storage_backoff: StorageBackoff,
    sqlite: Option<SqliteBackend>,
}

impl AppServices {
    /// Durable wiring on the SQLite database named by `EVENT_STORE_URL`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let backend = SqliteBackend::connect(&config.event_store_url)
            .await
            .context("failed to open event store")?;
        backend
            .create_table(&config.event_table)
            .await
            .context("failed to create event table")?;

        let store: Arc<dyn EventStore> = Arc::new(KeyedEventStore::new(
            Arc::new(backend.clone()),
            config.event_table.clone(),
        ));

        info!(table = %config.event_table, "event store ready");
        let mut services = Self::wire(store, config)?;
        services.sqlite = Some(backend);

        let replayed = services
            .users
            .resync()
            .await
            .context("failed to rebuild the user directory")?;
        info!(replayed, users = services.users.read(|d| d.len()), "user directory rebuilt");

        Ok(services)
    }

    /// Non-durable wiring for tests and local experiments.
    pub fn in_memory(config: &Config) -> Result<Self> {
        let store: Arc<dyn EventStore> = Arc::new(KeyedEventStore::new(
            Arc::new(InMemoryBackend::new()),
            config.event_table.clone(),
        ));
        Self::wire(store, config)
    }

    fn wire(store: Arc<dyn EventStore>, config: &Config) -> Result<Self> {
        let users = Arc::new(
            ProjectionSubscriber::new(UserDirectory::new())
                .with_source(Arc::new(StoreEventSource::new(store.clone()))),
        );

        let mut events = InMemoryEventBus::new("userserver")
            .with_subscriber_timeout(config.subscriber_timeout);
        events.subscribe("user_directory", users.clone())?;

        let mut commands = CommandBus::new(store, Arc::new(events)).with_retry_policy(RetryPolicy {
            max_conflict_retries: config.max_conflict_retries,
        });
        commands.register_aggregate(User::empty)?;

        Ok(Self {
            commands,
            users,
            storage_backoff: StorageBackoff::default(),
            sqlite: None,
        })
    }

    /// Dispatch, retrying storage outages with exponential backoff.
    pub async fn dispatch(&self, command: Command) -> Result<Dispatched, DispatchError> {
        let mut attempt = 1;
        loop {
            match self.commands.dispatch(command.clone()).await {
                Err(DispatchError::StorageUnavailable(detail))
                    if attempt < self.storage_backoff.attempts =>
                {
                    attempt += 1;
                    let delay = self.storage_backoff.delay_before(attempt);
                    warn!(%detail, attempt, ?delay, "storage unavailable; backing off");
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Release storage connections.
    pub async fn shutdown(&self) {
        if let Some(backend) = &self.sqlite {
            backend.close().await;
        }
    }
}
