//! Persistence layer abstractions.
//!
//! This module describes the storage contract ([`Eventstore`]), the per-call
//! [`Context`] every store operation receives, and a reference in-memory
//! implementation. Queries are described by
//! [`SearchQuery`](crate::query::SearchQuery); writes by
//! [`Command`](crate::command::Command).
use std::{future::Future, time::Duration};

pub use nonempty::NonEmpty;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    command::Command,
    concurrency::ConcurrencyConflict,
    event::{Aggregate, Event},
    query::{Columns, QueryError, SearchQuery},
};

pub mod inmemory;

/// Per-call context.
///
/// Carries the caller's tenant, used to scope queries that do not name an
/// instance themselves, and the signals that abort a store call early.
#[derive(Clone, Debug, Default)]
pub struct Context {
    instance_id: Option<String>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Context acting on behalf of `instance_id`.
    #[must_use]
    pub fn for_instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Give `aggregate` the caller's tenant unless it already names one.
    pub fn scope_aggregate(&self, aggregate: &mut Aggregate) {
        if aggregate.instance_id.is_empty()
            && let Some(instance_id) = &self.instance_id
        {
            aggregate.instance_id.clone_from(instance_id);
        }
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the call was already cancelled or ran out of time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] or [`StoreError::DeadlineExceeded`].
    pub fn check<E>(&self) -> Result<(), StoreError<E>>
    where
        E: std::error::Error + 'static,
    {
        if self.cancellation.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled or the
    /// deadline passes, whichever happens first.
    ///
    /// # Errors
    ///
    /// Returns the future's own error, [`StoreError::Cancelled`] or
    /// [`StoreError::DeadlineExceeded`].
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, StoreError<E>>
    where
        E: std::error::Error + 'static,
        F: Future<Output = Result<T, StoreError<E>>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(StoreError::Cancelled),
            () = deadline => Err(StoreError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Result of a query, shaped by its [`Columns`].
#[derive(Clone, Debug, PartialEq)]
pub enum QueryOutput {
    Events(Vec<Event>),
    /// `None` when nothing matched.
    MaxSequence(Option<u64>),
    InstanceIds(Vec<String>),
}

impl QueryOutput {
    #[must_use]
    pub const fn columns(&self) -> Columns {
        match self {
            Self::Events(_) => Columns::Event,
            Self::MaxSequence(_) => Columns::MaxSequence,
            Self::InstanceIds(_) => Columns::InstanceIds,
        }
    }
}

/// Error from store operations.
#[derive(Debug, Error)]
pub enum StoreError<E>
where
    E: std::error::Error + 'static,
{
    /// The request can never succeed as stated.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] QueryError),
    /// Another writer modified a stream the push expected unchanged.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    #[error("store operation cancelled")]
    Cancelled,
    #[error("store operation deadline exceeded")]
    DeadlineExceeded,
    /// Underlying storage error.
    #[error("store backend error: {0}")]
    Backend(#[source] E),
}

impl<E: std::error::Error + 'static> StoreError<E> {
    /// Create a backend error variant.
    pub const fn backend(err: E) -> Self {
        Self::Backend(err)
    }

    /// Whether issuing the same call again may succeed without the caller
    /// changing anything.
    ///
    /// Conflicts are not retryable as is: the caller has to reload first. An
    /// interrupted push persisted nothing, so it is safe to issue again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Abstraction over the persistence layer for event streams.
///
/// Implementations resolve a query's missing tenant from the [`Context`]
/// (see [`SearchQuery::ensure_instance_id`]) and honour its cancellation and
/// deadline.
pub trait Eventstore: Send + Sync {
    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Answer `query` in the shape its [`Columns`] ask for.
    ///
    /// Events of one aggregate come back in ascending sequence order,
    /// events of different aggregates in position order; both reversed
    /// when the query orders descending. No match is not an error.
    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<QueryOutput, StoreError<Self::Error>>> + Send + 'a;

    /// Persist `commands` atomically and return the resulting events in
    /// command order.
    ///
    /// Each event gets the next sequence of its stream, the next global
    /// position and a creation date. Every command carrying an expected
    /// sequence is checked against its stream as it was before the batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if any expectation fails. Nothing
    /// is persisted in that case. Cancellation and the deadline are honoured
    /// until the store commits; a push that returns
    /// [`StoreError::Cancelled`] or [`StoreError::DeadlineExceeded`] has not
    /// persisted anything.
    fn push<'a>(
        &'a self,
        ctx: &'a Context,
        commands: NonEmpty<Command>,
    ) -> impl Future<Output = Result<Vec<Event>, StoreError<Self::Error>>> + Send + 'a;

    /// Load the events selected by an [`Columns::Event`] query.
    fn filter<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Vec<Event>, StoreError<Self::Error>>> + Send + 'a {
        async move {
            query.expect_columns(Columns::Event)?;
            match self.query(ctx, query).await? {
                QueryOutput::Events(events) => Ok(events),
                other => Err(unexpected_output(Columns::Event, &other)),
            }
        }
    }

    /// Highest sequence selected by a [`Columns::MaxSequence`] query.
    fn latest_sequence<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Option<u64>, StoreError<Self::Error>>> + Send + 'a {
        async move {
            query.expect_columns(Columns::MaxSequence)?;
            match self.query(ctx, query).await? {
                QueryOutput::MaxSequence(sequence) => Ok(sequence),
                other => Err(unexpected_output(Columns::MaxSequence, &other)),
            }
        }
    }

    /// Distinct instance ids selected by a [`Columns::InstanceIds`] query.
    fn instance_ids<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<Vec<String>, StoreError<Self::Error>>> + Send + 'a {
        async move {
            query.expect_columns(Columns::InstanceIds)?;
            match self.query(ctx, query).await? {
                QueryOutput::InstanceIds(ids) => Ok(ids),
                other => Err(unexpected_output(Columns::InstanceIds, &other)),
            }
        }
    }
}

fn unexpected_output<E>(expected: Columns, output: &QueryOutput) -> StoreError<E>
where
    E: std::error::Error + 'static,
{
    StoreError::InvalidArgument(QueryError::ColumnsMismatch {
        expected,
        actual: output.columns(),
    })
}
