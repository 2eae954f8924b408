//! Write models: transient state rebuilt from events to validate commands.
//!
//! A write model gathers events through [`Reducer::append_events`] and folds
//! them into its state with [`Reducer::reduce`]. The free functions in this
//! module run that protocol against an [`Eventstore`]:
//!
//! - [`query_and_reduce`] loads what the model asks for and folds it.
//! - [`exists`] does the same, then asks the model whether its subject
//!   exists.
//! - [`push_append_and_reduce`] pushes commands and folds the resulting
//!   events, so the model reflects its own writes without a reload.
//!
//! Concrete models embed [`WriteModel`] for the bookkeeping every model
//! shares and delegate to it after applying their own fields.

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    command::Command,
    event::{Event, EventDecodeError},
    query::SearchQueryBuilder,
    store::{Context, Eventstore, StoreError},
};

/// Accepts events and folds them into state.
pub trait Reducer: Send {
    /// Buffer events for the next [`reduce`](Reducer::reduce).
    fn append_events(&mut self, events: Vec<Event>);

    /// Fold every buffered event.
    ///
    /// # Errors
    ///
    /// Returns [`ReduceError`] when an event cannot be applied.
    fn reduce(&mut self) -> Result<(), ReduceError>;
}

/// A [`Reducer`] that knows which events it needs.
pub trait QueryReducer: Reducer {
    /// Query selecting the events this model is built from.
    fn query(&self) -> SearchQueryBuilder;
}

/// A [`QueryReducer`] that can tell whether its subject exists.
pub trait ExistenceCheck: QueryReducer {
    fn exists(&self) -> bool;
}

/// Where a write model stands in its replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayState {
    /// Nothing appended or reduced yet.
    Uninitialized,
    /// Events are buffered but not yet reduced.
    Replaying,
    /// Every appended event has been reduced.
    Current,
}

/// Bookkeeping shared by all write models.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteModel {
    pub aggregate_id: String,
    pub resource_owner: String,
    pub instance_id: String,
    /// Events appended but not yet reduced.
    pub events: Vec<Event>,
    /// Sequence of the last reduced event, `0` before any.
    pub processed_sequence: u64,
    pub change_date: Option<DateTime<Utc>>,
}

impl WriteModel {
    #[must_use]
    pub fn new(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn owned_by(mut self, resource_owner: impl Into<String>) -> Self {
        self.resource_owner = resource_owner.into();
        self
    }

    #[must_use]
    pub fn in_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    #[must_use]
    pub fn state(&self) -> ReplayState {
        if !self.events.is_empty() {
            ReplayState::Replaying
        } else if self.processed_sequence == 0 && self.change_date.is_none() {
            ReplayState::Uninitialized
        } else {
            ReplayState::Current
        }
    }
}

impl Reducer for WriteModel {
    fn append_events(&mut self, events: Vec<Event>) {
        self.events.extend(events);
    }

    /// Take identity from the first buffered event where still unknown and
    /// advance the watermark to the last one.
    fn reduce(&mut self) -> Result<(), ReduceError> {
        let (Some(first), Some(last)) = (self.events.first(), self.events.last()) else {
            return Ok(());
        };
        if self.aggregate_id.is_empty() {
            self.aggregate_id.clone_from(&first.aggregate.id);
        }
        if self.resource_owner.is_empty() {
            self.resource_owner.clone_from(&first.aggregate.resource_owner);
        }
        if self.instance_id.is_empty() {
            self.instance_id.clone_from(&first.aggregate.instance_id);
        }
        self.processed_sequence = last.sequence;
        self.change_date = Some(last.creation_date);
        tracing::trace!(
            aggregate_id = %self.aggregate_id,
            processed_sequence = self.processed_sequence,
            reduced = self.events.len(),
            "write model reduced"
        );
        self.events.clear();
        Ok(())
    }
}

/// Error returned when a write model cannot fold an event.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error(transparent)]
    Decode(#[from] EventDecodeError),
    #[error("reduce failed: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Error from the write-model protocol.
#[derive(Debug, Error)]
pub enum ProtocolError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Store(#[from] StoreError<E>),
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

/// Append `events` to `model` and reduce them.
///
/// # Errors
///
/// Returns whatever [`Reducer::reduce`] reports.
pub fn append_and_reduce<M>(model: &mut M, events: Vec<Event>) -> Result<(), ReduceError>
where
    M: Reducer + ?Sized,
{
    model.append_events(events);
    model.reduce()
}

/// Load the events `model` asks for and fold them.
///
/// A query without results leaves the model untouched.
///
/// # Errors
///
/// Returns [`ProtocolError::Store`] for invalid queries or failed reads and
/// [`ProtocolError::Reduce`] when folding fails.
#[tracing::instrument(skip_all)]
pub async fn query_and_reduce<S, M>(
    store: &S,
    ctx: &Context,
    model: &mut M,
) -> Result<(), ProtocolError<S::Error>>
where
    S: Eventstore,
    M: QueryReducer + ?Sized,
{
    let query = model.query().build();
    let events = store.filter(ctx, &query).await?;
    if events.is_empty() {
        tracing::trace!("no events for write model");
        return Ok(());
    }
    tracing::debug!(event_count = events.len(), "events loaded into write model");
    append_and_reduce(model, events)?;
    Ok(())
}

/// Load `model` and report whether its subject exists.
///
/// # Errors
///
/// See [`query_and_reduce`].
pub async fn exists<S, M>(
    store: &S,
    ctx: &Context,
    model: &mut M,
) -> Result<bool, ProtocolError<S::Error>>
where
    S: Eventstore,
    M: ExistenceCheck + ?Sized,
{
    query_and_reduce(store, ctx, model).await?;
    Ok(model.exists())
}

/// Push `commands` and fold the persisted events into `model`.
///
/// Store errors, conflicts included, come back unchanged; nothing is
/// retried.
///
/// # Errors
///
/// Returns [`ProtocolError::Store`] when the push fails and
/// [`ProtocolError::Reduce`] when folding fails.
#[tracing::instrument(skip_all, fields(command_count = commands.len()))]
pub async fn push_append_and_reduce<S, M>(
    store: &S,
    ctx: &Context,
    model: &mut M,
    commands: NonEmpty<Command>,
) -> Result<(), ProtocolError<S::Error>>
where
    S: Eventstore,
    M: Reducer + ?Sized,
{
    let events = store.push(ctx, commands).await?;
    append_and_reduce(model, events)?;
    Ok(())
}
