//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic replay and per-stream cursor tracking
//! without making storage assumptions.
//!
//! ## Catching up
//!
//! Concurrent dispatches on one aggregate publish independently, so a subscriber
//! can see version 3 before version 2. A `ProjectionSubscriber` given an
//! `EventSource` answers such a gap by re-reading the missing events from the
//! source and applying them in order; the late version 2 is then a duplicate.
//! The same path rebuilds a read model at startup (`resync`).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use userserver_core::AggregateId;

use crate::{EventEnvelope, EventHandler, Projection, SubscriberError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// An event arrived before its predecessor; the projection must be re-synced.
    #[error("gap in stream {aggregate_id}: last applied {last}, received {found}")]
    Gap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

/// What the runner did with one envelope.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProjectionOutcome {
    Applied,
    /// Already applied (duplicate delivery).
    Skipped,
}

/// Runs envelopes through a projection and tracks the last applied version per stream.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursors: HashMap<AggregateId, u64>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursors: HashMap::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Last applied stream version for an aggregate (0 if none).
    pub fn cursor(&self, aggregate_id: &AggregateId) -> u64 {
        self.cursors.get(aggregate_id).copied().unwrap_or(0)
    }

    /// Apply a single envelope, skipping duplicates and refusing gaps.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<ProjectionOutcome, ProjectionError> {
        let last = self.cursor(envelope.aggregate_id());
        let found = envelope.stream_version();

        if found <= last {
            return Ok(ProjectionOutcome::Skipped);
        }
        if found != last + 1 {
            return Err(ProjectionError::Gap {
                aggregate_id: envelope.aggregate_id().clone(),
                last,
                found,
            });
        }

        self.projection.apply(envelope);
        self.cursors.insert(envelope.aggregate_id().clone(), found);
        Ok(ProjectionOutcome::Applied)
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<(), ProjectionError> {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    ///
    /// The factory is used to create a fresh projection instance.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<Self, ProjectionError> {
        let mut runner = ProjectionRunner::new(factory());
        runner.run(envelopes)?;
        Ok(runner)
    }
}

/// Read access to committed history, for projections that fell behind.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Every aggregate with at least one event.
    async fn aggregate_ids(&self) -> Result<Vec<AggregateId>, SubscriberError>;

    /// Events of `aggregate_id` with `stream_version > after`, ascending.
    async fn events_after(
        &self,
        aggregate_id: &AggregateId,
        after: u64,
    ) -> Result<Vec<EventEnvelope>, SubscriberError>;
}

/// A `ProjectionRunner` that can be subscribed to an event bus.
pub struct ProjectionSubscriber<P>
where
    P: Projection,
{
    runner: Mutex<ProjectionRunner<P>>,
    source: Option<Arc<dyn EventSource>>,
}

impl<P> fmt::Debug for ProjectionSubscriber<P>
where
    P: Projection + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionSubscriber")
            .field("runner", &self.runner)
            .field("catches_up", &self.source.is_some())
            .finish()
    }
}

impl<P> ProjectionSubscriber<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self::from_runner(ProjectionRunner::new(projection))
    }

    pub fn from_runner(runner: ProjectionRunner<P>) -> Self {
        Self {
            runner: Mutex::new(runner),
            source: None,
        }
    }

    /// Re-read missed events from `source` instead of failing on gaps.
    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Read the projection's current state.
    pub fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        f(runner.projection())
    }

    /// Last applied stream version for an aggregate (0 if none).
    pub fn cursor(&self, aggregate_id: &AggregateId) -> u64 {
        let runner = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        runner.cursor(aggregate_id)
    }

    /// Apply every event of `aggregate_id` past the cursor, in version order.
    ///
    /// Returns how many events were applied.
    pub async fn catch_up(&self, aggregate_id: &AggregateId) -> Result<usize, SubscriberError> {
        let source = self.source()?;
        let after = self.with_runner(|r| r.cursor(aggregate_id))?;
        let missing = source.events_after(aggregate_id, after).await?;

        self.with_runner(|runner| -> Result<usize, ProjectionError> {
            let mut applied = 0;
            for envelope in &missing {
                if runner.apply(envelope)? == ProjectionOutcome::Applied {
                    applied += 1;
                }
            }
            Ok(applied)
        })?
        .map_err(|e| SubscriberError::failed(e.to_string()))
    }

    /// Catch up on every aggregate the source knows about.
    pub async fn resync(&self) -> Result<usize, SubscriberError> {
        let mut applied = 0;
        for aggregate_id in self.source()?.aggregate_ids().await? {
            applied += self.catch_up(&aggregate_id).await?;
        }
        Ok(applied)
    }

    fn source(&self) -> Result<&Arc<dyn EventSource>, SubscriberError> {
        self.source
            .as_ref()
            .ok_or_else(|| SubscriberError::failed("projection has no event source to catch up from"))
    }

    fn with_runner<R>(
        &self,
        f: impl FnOnce(&mut ProjectionRunner<P>) -> R,
    ) -> Result<R, SubscriberError> {
        let mut runner = self
            .runner
            .lock()
            .map_err(|_| SubscriberError::failed("projection lock poisoned"))?;
        Ok(f(&mut runner))
    }
}

#[async_trait]
impl<P> EventHandler for ProjectionSubscriber<P>
where
    P: Projection,
{
    async fn handle(&self, event: &EventEnvelope) -> Result<(), SubscriberError> {
        let gap = match self.with_runner(|r| r.apply(event))? {
            Ok(_) => return Ok(()),
            Err(gap) => gap,
        };
        if self.source.is_none() {
            return Err(SubscriberError::failed(gap.to_string()));
        }

        debug!(%gap, "projection behind; catching up from the event source");
        self.catch_up(event.aggregate_id()).await?;

        // Committed before it was published, so normally already applied by now.
        self.with_runner(|r| r.apply(event))?
            .map(|_| ())
            .map_err(|e| SubscriberError::failed(e.to_string()))
    }
}
