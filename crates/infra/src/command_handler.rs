//! Handler contract between the command bus and domain code.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use userserver_core::{Aggregate, AggregateId, DomainError, rehydrate};
use userserver_events::{Command, Event};

use crate::command_bus::DispatchError;
use crate::event_store::{StoredEvent, UncommittedEvent};

/// Turns one command into the events to append.
///
/// The bus loads the aggregate's history and passes it in; the handler folds it
/// into current state, validates the command against that state and returns the
/// new events. Appending and publishing stay with the bus, so a handler may be
/// invoked again with a fresher history after a concurrency conflict.
///
/// Business rejections are returned as `DomainError` (through `?`), which the bus
/// surfaces as `DispatchError::ValidationFailed`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: &Command,
        history: &[StoredEvent],
    ) -> Result<Vec<UncommittedEvent>, DispatchError>;
}

#[async_trait]
impl<H> CommandHandler for Arc<H>
where
    H: CommandHandler + ?Sized,
{
    async fn handle(
        &self,
        command: &Command,
        history: &[StoredEvent],
    ) -> Result<Vec<UncommittedEvent>, DispatchError> {
        (**self).handle(command, history).await
    }
}

/// `CommandHandler` for any event-sourced `Aggregate`.
///
/// `factory` builds the empty aggregate for an id (e.g. `User::empty`); every
/// call rebuilds state from scratch, there is no aggregate cache.
pub struct AggregateHandler<A, F> {
    factory: F,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, F> AggregateHandler<A, F>
where
    F: Fn(&AggregateId) -> A,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            _aggregate: PhantomData,
        }
    }
}

impl<A, F> std::fmt::Debug for AggregateHandler<A, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateHandler")
            .field("aggregate", &std::any::type_name::<A>())
            .finish()
    }
}

#[async_trait]
impl<A, F> CommandHandler for AggregateHandler<A, F>
where
    A: Aggregate<Error = DomainError>,
    A::Command: DeserializeOwned,
    A::Event: Event + Serialize + DeserializeOwned,
    F: Fn(&AggregateId) -> A + Send + Sync,
{
    async fn handle(
        &self,
        command: &Command,
        history: &[StoredEvent],
    ) -> Result<Vec<UncommittedEvent>, DispatchError> {
        let typed: A::Command = command.decode()?;

        let past = history
            .iter()
            .map(|stored| {
                serde_json::from_value::<A::Event>(stored.payload.clone()).map_err(|e| {
                    DispatchError::Internal(format!(
                        "undecodable {} at {}@{}: {e}",
                        stored.event_type, stored.aggregate_id, stored.version
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let aggregate = rehydrate((self.factory)(command.aggregate_id()), &past);
        let decided = aggregate.handle(&typed)?;

        decided
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(
                    A::aggregate_type(),
                    event,
                    command.principal().cloned(),
                )
                .map_err(DispatchError::from)
            })
            .collect()
    }
}
