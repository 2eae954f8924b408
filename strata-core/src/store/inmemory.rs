//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`Eventstore`](super::Eventstore) suitable for unit tests and examples.
//!
//! # Example
//!
//! ```
//! use strata_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert!(store.is_empty());
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    convert::Infallible,
    fmt,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;

use crate::{
    command::Command,
    concurrency::ConcurrencyConflict,
    event::{Event, StreamKey},
    matching::paginate,
    query::{Columns, SearchQuery},
    store::{Context, Eventstore, QueryOutput, StoreError},
};

/// Source of creation dates for pushed events.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-memory event store keeping one append-only log.
///
/// Positions come from a global counter, so events of different aggregates
/// interleave in push order. A push holds the write lock for the whole batch;
/// readers never observe half of one.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    clock: Clock,
}

#[derive(Default)]
struct Inner {
    /// Every event in position order.
    log: Vec<Event>,
    /// Latest sequence per stream.
    heads: HashMap<StreamKey, u64>,
    last_position: u64,
    last_creation_date: Option<DateTime<Utc>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Store taking creation dates from `clock`.
    ///
    /// Dates are still forced to be non-decreasing across pushes.
    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            clock,
        }
    }

    /// Number of persisted events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .log
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the most recently persisted event, `0` if none.
    #[must_use]
    pub fn last_position(&self) -> u64 {
        self.inner
            .read()
            .expect("in-memory store lock poisoned")
            .last_position
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("events", &self.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn select(&self, query: &SearchQuery) -> QueryOutput {
        // a read holding the lock already sees a consistent snapshot, so the
        // time-travel bound only matters when it is explicit
        let matched = self.log.iter().filter(|event| query.matches_event(event));

        match query.columns() {
            Columns::Event => {
                let events: Vec<&Event> = if query.is_desc() {
                    paginate(query, matched.rev()).collect()
                } else {
                    paginate(query, matched).collect()
                };
                QueryOutput::Events(events.into_iter().cloned().collect())
            }
            Columns::MaxSequence => {
                QueryOutput::MaxSequence(matched.map(|event| event.sequence).max())
            }
            Columns::InstanceIds => {
                let distinct: BTreeSet<&str> = matched
                    .map(|event| event.aggregate.instance_id.as_str())
                    .collect();
                let ids: Vec<String> = if query.is_desc() {
                    paginate(query, distinct.into_iter().rev())
                        .map(str::to_owned)
                        .collect()
                } else {
                    paginate(query, distinct.into_iter())
                        .map(str::to_owned)
                        .collect()
                };
                QueryOutput::InstanceIds(ids)
            }
        }
    }

    fn commit(
        &mut self,
        ctx: &Context,
        commands: NonEmpty<Command>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>, ConcurrencyConflict> {
        let commands: Vec<Command> = commands
            .into_iter()
            .map(|mut command| {
                ctx.scope_aggregate(&mut command.aggregate);
                command
            })
            .collect();

        for command in &commands {
            let Some(expected) = command.sequence else {
                continue;
            };
            let actual = self
                .heads
                .get(&command.aggregate.stream_key())
                .copied()
                .unwrap_or(0);
            if expected != actual {
                tracing::debug!(expected, actual, "sequence mismatch, rejecting push");
                return Err(ConcurrencyConflict {
                    aggregate_type: command.aggregate.aggregate_type.clone(),
                    aggregate_id: command.aggregate.id.clone(),
                    expected,
                    actual,
                });
            }
        }

        let creation_date = self.last_creation_date.map_or(now, |last| last.max(now));
        self.last_creation_date = Some(creation_date);

        let mut pushed = Vec::with_capacity(commands.len());
        for command in commands {
            let head = self.heads.entry(command.aggregate.stream_key()).or_insert(0);
            *head += 1;
            self.last_position += 1;
            let event = Event {
                aggregate: command.aggregate,
                event_type: command.event_type,
                sequence: *head,
                position: self.last_position,
                creation_date,
                editor_user: command.editor_user,
                data: command.payload,
            };
            tracing::trace!(
                aggregate_type = %event.aggregate.aggregate_type,
                sequence = event.sequence,
                position = event.position,
                "event appended"
            );
            self.log.push(event.clone());
            pushed.push(event);
        }
        Ok(pushed)
    }
}

impl Eventstore for Store {
    type Error = Infallible;

    #[tracing::instrument(skip(self, ctx, query), fields(columns = %query.columns()))]
    fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> impl Future<Output = Result<QueryOutput, StoreError<Self::Error>>> + Send + 'a {
        let result = ctx.check().map(|()| {
            let query = query.ensure_instance_id(ctx);
            let output = self
                .inner
                .read()
                .expect("in-memory store lock poisoned")
                .select(&query);
            tracing::trace!(columns = %output.columns(), "query answered");
            output
        });
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self, ctx, commands), fields(command_count = commands.len()))]
    fn push<'a>(
        &'a self,
        ctx: &'a Context,
        commands: NonEmpty<Command>,
    ) -> impl Future<Output = Result<Vec<Event>, StoreError<Self::Error>>> + Send + 'a {
        let result = ctx.check().and_then(|()| {
            let now = (self.clock)();
            let mut inner = self.inner.write().expect("in-memory store lock poisoned");
            let pushed = inner.commit(ctx, commands, now)?;
            drop(inner);
            tracing::debug!(events_appended = pushed.len(), "events pushed");
            Ok(pushed)
        });
        std::future::ready(result)
    }
}
