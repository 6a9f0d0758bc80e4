//! Command execution pipeline (application-level orchestration).
//!
//! ## Command Execution Flow
//!
//! ```text
//! Command
//!   ↓
//! 1. Route by command type to exactly one registered handler
//!   ↓
//! 2. Load the aggregate's stream from the event store
//!   ↓
//! 3. Handler rehydrates state and decides new events (pure)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!   ↓  (conflict: back to 2, bounded by RetryPolicy)
//! 5. Publish every appended event, in version order
//! ```
//!
//! Steps 4 and 5 form the commit phase and run on their own tokio task: once the
//! append has been issued, dropping the `dispatch` future (client disconnect,
//! request timeout) can no longer retract the write or skip the publish.
//!
//! ## Concurrency
//!
//! No lock is held across load-decide-append. Two dispatches on the same aggregate
//! may load the same version; the store lets exactly one append win and the other
//! reloads and re-runs its handler.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{Instrument, debug, instrument, warn};

use userserver_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use userserver_events::{Command, Event, EventBus, RegistrationError};

use crate::command_handler::{AggregateHandler, CommandHandler};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, load_events};

/// Why a dispatch did not succeed.
///
/// | variant | retry? |
/// |---|---|
/// | `ValidationFailed` | never; the request must change |
/// | `ConcurrencyConflict` | yes, from a fresh load (already retried per `RetryPolicy`) |
/// | `HandlerNotFound` | never; wiring error |
/// | `StorageUnavailable` | yes, with backoff |
/// | `Internal` | never; stored data or an event could not be (de)serialized |
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command rejected: {0}")]
    ValidationFailed(DomainError),

    #[error("concurrency conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("no handler registered for command type '{0}'")]
    HandlerNotFound(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// True when resubmitting the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ConcurrencyConflict { .. } | DispatchError::StorageUnavailable(_)
        )
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        DispatchError::ValidationFailed(value)
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency {
                aggregate_id,
                expected,
                actual,
            } => DispatchError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual,
            },
            EventStoreError::StorageUnavailable(msg) => DispatchError::StorageUnavailable(msg),
            other @ (EventStoreError::AggregateTypeMismatch(_)
            | EventStoreError::InvalidAppend(_)
            | EventStoreError::Corrupted(_)) => DispatchError::Internal(other.to_string()),
        }
    }
}

/// How often a dispatch reloads and re-runs its handler after losing an append race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_conflict_retries: u32,
}

impl RetryPolicy {
    /// Surface every conflict to the caller.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_conflict_retries: 0,
    };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub aggregate_id: AggregateId,
    /// Stream version after the dispatch (unchanged if no events were produced).
    pub version: u64,
    /// Appended (and published) events, in version order.
    pub events: Vec<StoredEvent>,
}

/// Routes commands to handlers and commits their events.
///
/// Handlers are registered through `&mut self` at startup; afterwards the bus is
/// shared (typically in an `Arc`) and dispatch only reads the registry.
pub struct CommandBus<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    bus: Arc<B>,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    retry: RetryPolicy,
}

impl<S: ?Sized, B: ?Sized> std::fmt::Debug for CommandBus<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut command_types: Vec<_> = self.handlers.keys().collect();
        command_types.sort();
        f.debug_struct("CommandBus")
            .field("command_types", &command_types)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<S, B> CommandBus<S, B>
where
    S: EventStore + ?Sized + 'static,
    B: EventBus + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, bus: Arc<B>) -> Self {
        Self {
            store,
            bus,
            handlers: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn handles(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    /// Bind `handler` to `command_type`. A command type has at most one handler.
    pub fn register(
        &mut self,
        command_type: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Result<(), RegistrationError> {
        let command_type = command_type.into();
        if self.handlers.contains_key(&command_type) {
            return Err(RegistrationError::DuplicateHandler(command_type));
        }
        self.handlers.insert(command_type, Arc::new(handler));
        Ok(())
    }

    /// Bind every command type of `A` to an `AggregateHandler`.
    ///
    /// Either all of them are registered or, on a duplicate, none.
    pub fn register_aggregate<A, F>(&mut self, factory: F) -> Result<(), RegistrationError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: DeserializeOwned,
        A::Event: Event + Serialize + DeserializeOwned,
        F: Fn(&AggregateId) -> A + Send + Sync + 'static,
    {
        if let Some(taken) = A::command_types().iter().find(|t| self.handles(t)) {
            return Err(RegistrationError::DuplicateHandler(taken.to_string()));
        }

        let handler: Arc<dyn CommandHandler> = Arc::new(AggregateHandler::new(factory));
        for command_type in A::command_types() {
            self.handlers.insert(command_type.to_string(), handler.clone());
        }
        Ok(())
    }

    /// Execute one command end to end.
    ///
    /// On success every produced event has been appended and published (each
    /// subscriber attempted) before this returns.
    #[instrument(
        skip(self, command),
        fields(
            command_type = %command.command_type(),
            aggregate_id = %command.aggregate_id()
        ),
        err
    )]
    pub async fn dispatch(&self, command: Command) -> Result<Dispatched, DispatchError> {
        let handler = self
            .handlers
            .get(command.command_type())
            .cloned()
            .ok_or_else(|| DispatchError::HandlerNotFound(command.command_type().to_string()))?;

        let aggregate_id = command.aggregate_id().clone();
        let mut retries = 0;

        loop {
            let history = load_events(&*self.store, &aggregate_id).await?;
            let current = history.last().map(|e| e.version).unwrap_or(0);

            let decided = handler.handle(&command, &history).await?;
            if decided.is_empty() {
                return Ok(Dispatched {
                    aggregate_id,
                    version: current,
                    events: vec![],
                });
            }

            match self
                .commit(aggregate_id.clone(), ExpectedVersion::Exact(current), decided)
                .await
            {
                Ok(events) => {
                    let version = events.last().map(|e| e.version).unwrap_or(current);
                    return Ok(Dispatched {
                        aggregate_id,
                        version,
                        events,
                    });
                }
                Err(DispatchError::ConcurrencyConflict { actual, .. })
                    if retries < self.retry.max_conflict_retries =>
                {
                    retries += 1;
                    debug!(
                        loaded_version = current,
                        actual_version = actual,
                        retry = retries,
                        "append lost a race; reloading stream"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append then publish, detached from the caller.
    async fn commit(
        &self,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let store = self.store.clone();
        let bus = self.bus.clone();

        let task = tokio::spawn(
            async move {
                let committed = store.append(&aggregate_id, expected, events).await?;

                for stored in &committed {
                    let report = bus.publish(&stored.to_envelope()).await;
                    if !report.is_clean() {
                        warn!(
                            event_id = %report.event_id,
                            version = stored.version,
                            failed_subscribers = report.failures.len(),
                            "event committed but not every subscriber accepted it"
                        );
                    }
                }

                Ok::<_, EventStoreError>(committed)
            }
            .in_current_span(),
        );

        match task.await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(join) => Err(DispatchError::Internal(format!("commit task aborted: {join}"))),
        }
    }
}
