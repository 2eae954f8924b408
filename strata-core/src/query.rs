//! Search queries over the event log.
//!
//! A [`SearchQueryBuilder`] collects top-level filters that are AND-connected
//! and any number of sub-queries that are OR-connected with each other. Each
//! sub-query's own fields are AND-connected. [`SearchQueryBuilder::build`]
//! freezes the result into an immutable [`SearchQuery`] that stores and the
//! matching engine consume.
//!
//! ```
//! use strata_core::query::{Columns, SearchQueryBuilder};
//!
//! let query = SearchQueryBuilder::new(Columns::Event)
//!     .resource_owner("org-1")
//!     .add_query()
//!     .aggregate_types(["org"])
//!     .event_types(["org.added"])
//!     .or()
//!     .aggregate_types(["key_pair"])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(query.sub_queries().len(), 2);
//! ```

use std::{borrow::Cow, collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    event::{AggregateType, EventType},
    store::Context,
};

/// Seconds between the Unix epoch and `0001-01-01T00:00:00Z`.
const ZERO_INSTANT_SECONDS: i64 = -62_135_596_800;

/// Shape of the result a query asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Columns {
    /// Full events.
    #[default]
    Event = 1,
    /// Highest sequence among the matching events.
    MaxSequence = 2,
    /// Distinct instance ids among the matching events.
    InstanceIds = 3,
}

impl Columns {
    /// Check a raw column selector.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ColumnsOutOfRange`] for values outside the
    /// enumerated range.
    pub const fn validate(raw: i8) -> Result<Self, QueryError> {
        match raw {
            1 => Ok(Self::Event),
            2 => Ok(Self::MaxSequence),
            3 => Ok(Self::InstanceIds),
            _ => Err(QueryError::ColumnsOutOfRange(raw)),
        }
    }
}

impl TryFrom<i8> for Columns {
    type Error = QueryError;

    fn try_from(raw: i8) -> Result<Self, Self::Error> {
        Self::validate(raw)
    }
}

impl fmt::Display for Columns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Event => "event",
            Self::MaxSequence => "max sequence",
            Self::InstanceIds => "instance ids",
        })
    }
}

/// Error raised for queries that can never be answered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("column selector {0} out of range")]
    ColumnsOutOfRange(i8),
    #[error("query selects {actual} columns, expected {expected}")]
    ColumnsMismatch { expected: Columns, actual: Columns },
}

/// Equality filter over the top-level keys of an event payload.
///
/// A payload matches when every key in the filter is present with an equal
/// JSON value. An empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventDataFilter {
    fields: BTreeMap<String, serde_json::Value>,
}

impl EventDataFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Whether `payload` carries every required key with an equal value.
    #[must_use]
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        let Some(object) = payload.as_object() else {
            return false;
        };
        self.fields
            .iter()
            .all(|(key, expected)| object.get(key) == Some(expected))
    }
}

impl<K, V> FromIterator<(K, V)> for EventDataFilter
where
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// One OR-branch of a [`SearchQuery`]. Empty fields do not constrain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubQuery {
    aggregate_types: Vec<AggregateType>,
    aggregate_ids: Vec<String>,
    event_types: Vec<EventType>,
    event_data: Option<EventDataFilter>,
}

impl SubQuery {
    #[must_use]
    pub fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    #[must_use]
    pub fn aggregate_ids(&self) -> &[String] {
        &self.aggregate_ids
    }

    #[must_use]
    pub fn event_types(&self) -> &[EventType] {
        &self.event_types
    }

    #[must_use]
    pub const fn event_data(&self) -> Option<&EventDataFilter> {
        self.event_data.as_ref()
    }
}

/// Immutable, validated query.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchQuery {
    columns: Columns,
    limit: u64,
    offset: u64,
    desc: bool,
    resource_owner: String,
    instance_id: Option<String>,
    editor_user: String,
    allow_time_travel: bool,
    as_of_position: Option<u64>,
    position_after: Option<u64>,
    await_open_transactions: bool,
    sequence_greater: u64,
    creation_date_after: Option<DateTime<Utc>>,
    creation_date_before: Option<DateTime<Utc>>,
    sub_queries: Vec<SubQuery>,
}

impl SearchQuery {
    #[must_use]
    pub const fn columns(&self) -> Columns {
        self.columns
    }

    /// Maximum number of results, `0` for unlimited.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Number of matching results to skip.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn is_desc(&self) -> bool {
        self.desc
    }

    #[must_use]
    pub fn resource_owner(&self) -> Option<&str> {
        non_empty(&self.resource_owner)
    }

    /// Tenant filter. `None` and the empty string both leave events
    /// unfiltered by tenant.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    #[must_use]
    pub fn editor_user(&self) -> Option<&str> {
        non_empty(&self.editor_user)
    }

    #[must_use]
    pub const fn allow_time_travel(&self) -> bool {
        self.allow_time_travel
    }

    /// Inclusive upper position bound for time-travel reads.
    #[must_use]
    pub const fn as_of_position(&self) -> Option<u64> {
        self.as_of_position
    }

    /// Exclusive lower position bound.
    #[must_use]
    pub const fn position_after(&self) -> Option<u64> {
        self.position_after
    }

    #[must_use]
    pub const fn await_open_transactions(&self) -> bool {
        self.await_open_transactions
    }

    /// Exclusive lower sequence bound, `0` when unset.
    #[must_use]
    pub const fn sequence_greater(&self) -> u64 {
        self.sequence_greater
    }

    #[must_use]
    pub const fn creation_date_after(&self) -> Option<DateTime<Utc>> {
        self.creation_date_after
    }

    #[must_use]
    pub const fn creation_date_before(&self) -> Option<DateTime<Utc>> {
        self.creation_date_before
    }

    #[must_use]
    pub fn sub_queries(&self) -> &[SubQuery] {
        &self.sub_queries
    }

    /// Fill a missing tenant filter from the caller's context.
    ///
    /// An explicitly set instance id, even an empty one, is kept.
    #[must_use]
    pub fn ensure_instance_id(&self, ctx: &Context) -> Cow<'_, Self> {
        match (&self.instance_id, ctx.instance_id()) {
            (None, Some(instance_id)) if !instance_id.is_empty() => {
                let mut resolved = self.clone();
                resolved.instance_id = Some(instance_id.to_owned());
                Cow::Owned(resolved)
            }
            _ => Cow::Borrowed(self),
        }
    }

    /// Reject the query unless it selects `expected` columns.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ColumnsMismatch`] when the selectors differ.
    pub fn expect_columns(&self, expected: Columns) -> Result<(), QueryError> {
        if self.columns == expected {
            Ok(())
        } else {
            Err(QueryError::ColumnsMismatch {
                expected,
                actual: self.columns,
            })
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// `0001-01-01T00:00:00Z` and the Unix epoch mean "not set".
fn is_unset_instant(instant: &DateTime<Utc>) -> bool {
    let seconds = instant.timestamp();
    seconds == 0 || (seconds == ZERO_INSTANT_SECONDS && instant.timestamp_subsec_nanos() == 0)
}

/// Builder for [`SearchQuery`].
#[derive(Clone, Debug)]
#[must_use]
pub struct SearchQueryBuilder {
    query: SearchQuery,
}

impl SearchQueryBuilder {
    pub fn new(columns: Columns) -> Self {
        Self {
            query: SearchQuery {
                columns,
                limit: 0,
                offset: 0,
                desc: false,
                resource_owner: String::new(),
                instance_id: None,
                editor_user: String::new(),
                allow_time_travel: false,
                as_of_position: None,
                position_after: None,
                await_open_transactions: false,
                sequence_greater: 0,
                creation_date_after: None,
                creation_date_before: None,
                sub_queries: Vec::new(),
            },
        }
    }

    pub fn columns(mut self, columns: Columns) -> Self {
        self.query.columns = columns;
        self
    }

    /// Return at most `limit` results. `0` removes the limit.
    pub fn limit(mut self, limit: u64) -> Self {
        self.query.limit = limit;
        self
    }

    /// Skip the first `offset` matching results.
    pub fn offset(mut self, offset: u64) -> Self {
        self.query.offset = offset;
        self
    }

    pub fn order_desc(mut self) -> Self {
        self.query.desc = true;
        self
    }

    pub fn order_asc(mut self) -> Self {
        self.query.desc = false;
        self
    }

    pub fn resource_owner(mut self, resource_owner: impl Into<String>) -> Self {
        self.query.resource_owner = resource_owner.into();
        self
    }

    /// Restrict to one tenant. Overrides any earlier value.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.query.instance_id = Some(instance_id.into());
        self
    }

    pub fn editor_user(mut self, editor_user: impl Into<String>) -> Self {
        self.query.editor_user = editor_user.into();
        self
    }

    /// Read a consistent snapshot: everything committed up to the read's
    /// start, or up to [`as_of_position`](Self::as_of_position) when set.
    pub fn allow_time_travel(mut self) -> Self {
        self.query.allow_time_travel = true;
        self
    }

    /// Pin a time-travel read to the log as it was at `position`.
    pub fn as_of_position(mut self, position: u64) -> Self {
        self.query.allow_time_travel = true;
        self.query.as_of_position = Some(position);
        self
    }

    /// Only events after `position`.
    pub fn position_after(mut self, position: u64) -> Self {
        self.query.position_after = Some(position);
        self
    }

    /// Wait until transactions open at read time have finished before
    /// reading.
    pub fn await_open_transactions(mut self) -> Self {
        self.query.await_open_transactions = true;
        self
    }

    /// Only events with a sequence strictly greater than `sequence`. `0`
    /// disables the filter.
    pub fn sequence_greater(mut self, sequence: u64) -> Self {
        self.query.sequence_greater = sequence;
        self
    }

    /// Only events created strictly after `creation_date`.
    ///
    /// The Unix epoch and `0001-01-01T00:00:00Z` are treated as unset and
    /// leave the filter unchanged.
    pub fn creation_date_after(mut self, creation_date: DateTime<Utc>) -> Self {
        if !is_unset_instant(&creation_date) {
            self.query.creation_date_after = Some(creation_date);
        }
        self
    }

    /// Only events created strictly before `creation_date`. Zero-value
    /// instants are ignored as in [`creation_date_after`](Self::creation_date_after).
    pub fn creation_date_before(mut self, creation_date: DateTime<Utc>) -> Self {
        if !is_unset_instant(&creation_date) {
            self.query.creation_date_before = Some(creation_date);
        }
        self
    }

    /// Open a new OR-branch.
    pub fn add_query(self) -> SubQueryBuilder {
        SubQueryBuilder {
            parent: self,
            current: SubQuery::default(),
        }
    }

    /// Freeze the query.
    ///
    /// A creation window with no instant between its bounds is kept as is
    /// and simply selects nothing.
    #[must_use]
    pub fn build(self) -> SearchQuery {
        self.query
    }
}

/// Builder for one OR-branch. Fields set here are AND-connected.
#[derive(Clone, Debug)]
#[must_use]
pub struct SubQueryBuilder {
    parent: SearchQueryBuilder,
    current: SubQuery,
}

impl SubQueryBuilder {
    pub fn aggregate_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<AggregateType>,
    {
        self.current.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate_ids<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.current.aggregate_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn event_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<EventType>,
    {
        self.current.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Require payload keys to equal the given values. Slower than the other
    /// filters on database-backed stores.
    pub fn event_data(mut self, filter: EventDataFilter) -> Self {
        self.current.event_data = Some(filter);
        self
    }

    /// Close this branch and open a sibling.
    pub fn or(self) -> Self {
        self.builder().add_query()
    }

    /// Close this branch and continue on the parent.
    pub fn builder(mut self) -> SearchQueryBuilder {
        self.parent.query.sub_queries.push(self.current);
        self.parent
    }

    /// Close this branch and freeze the query.
    #[must_use]
    pub fn build(self) -> SearchQuery {
        self.builder().build()
    }
}
