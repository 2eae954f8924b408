//! In-memory evaluation of a [`SearchQuery`].
//!
//! Write paths use [`SearchQuery::matches`] to dry-run a query against
//! commands they are about to push. The in-memory store reads with
//! [`SearchQuery::matches_event`], so both sides agree on what a query
//! selects.

use crate::{
    command::Command,
    event::{Aggregate, Event, EventType},
    query::{SearchQuery, SubQuery},
};

/// Something a query can be evaluated against.
pub trait Matchable {
    fn aggregate(&self) -> &Aggregate;

    fn event_type(&self) -> &EventType;

    /// Sequence known for the candidate, if any.
    fn sequence(&self) -> Option<u64>;

    fn payload(&self) -> &serde_json::Value;
}

impl Matchable for Command {
    fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn event_type(&self) -> &EventType {
        &self.event_type
    }

    fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

impl Matchable for Event {
    fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn event_type(&self) -> &EventType {
        &self.event_type
    }

    fn sequence(&self) -> Option<u64> {
        Some(self.sequence)
    }

    fn payload(&self) -> &serde_json::Value {
        &self.data
    }
}

impl<T: Matchable + ?Sized> Matchable for &T {
    fn aggregate(&self) -> &Aggregate {
        (**self).aggregate()
    }

    fn event_type(&self) -> &EventType {
        (**self).event_type()
    }

    fn sequence(&self) -> Option<u64> {
        (**self).sequence()
    }

    fn payload(&self) -> &serde_json::Value {
        (**self).payload()
    }
}

impl SearchQuery {
    /// Candidates selected by this query, in input order.
    ///
    /// The first [`offset`](SearchQuery::offset) matches are skipped and at
    /// most [`limit`](SearchQuery::limit) are returned.
    pub fn matches<'c, T>(&self, candidates: &'c [T]) -> Vec<&'c T>
    where
        T: Matchable,
    {
        let matched = candidates
            .iter()
            .filter(|candidate| self.matches_candidate(*candidate));
        paginate(self, matched).collect()
    }

    /// Whether one candidate passes the top-level filters and at least one
    /// sub-query.
    ///
    /// A candidate without an instance id passes any tenant filter. The
    /// sequence bound only applies to candidates that know their sequence.
    #[must_use]
    pub fn matches_candidate<T>(&self, candidate: &T) -> bool
    where
        T: Matchable + ?Sized,
    {
        let aggregate = candidate.aggregate();
        if let Some(owner) = self.resource_owner()
            && aggregate.resource_owner != owner
        {
            return false;
        }
        if let Some(instance_id) = self.instance_id()
            && !instance_id.is_empty()
            && !aggregate.instance_id.is_empty()
            && aggregate.instance_id != instance_id
        {
            return false;
        }
        if self.sequence_greater() > 0
            && let Some(sequence) = candidate.sequence()
            && sequence <= self.sequence_greater()
        {
            return false;
        }

        let sub_queries = self.sub_queries();
        sub_queries.is_empty()
            || sub_queries
                .iter()
                .any(|sub_query| sub_query.matches_candidate(candidate))
    }

    /// Whether a stored event is selected, including the envelope filters
    /// that only exist on persisted events.
    #[must_use]
    pub fn matches_event(&self, event: &Event) -> bool {
        if let Some(editor) = self.editor_user()
            && event.editor_user != editor
        {
            return false;
        }
        if let Some(after) = self.creation_date_after()
            && event.creation_date <= after
        {
            return false;
        }
        if let Some(before) = self.creation_date_before()
            && event.creation_date >= before
        {
            return false;
        }
        if let Some(after) = self.position_after()
            && event.position <= after
        {
            return false;
        }
        if let Some(bound) = self.as_of_position()
            && event.position > bound
        {
            return false;
        }
        self.matches_candidate(event)
    }
}

impl SubQuery {
    /// Whether every non-empty field of this branch accepts the candidate.
    #[must_use]
    pub fn matches_candidate<T>(&self, candidate: &T) -> bool
    where
        T: Matchable + ?Sized,
    {
        let aggregate = candidate.aggregate();
        if !self.aggregate_types().is_empty()
            && !self.aggregate_types().contains(&aggregate.aggregate_type)
        {
            return false;
        }
        if !self.aggregate_ids().is_empty() && !self.aggregate_ids().contains(&aggregate.id) {
            return false;
        }
        if !self.event_types().is_empty() && !self.event_types().contains(candidate.event_type()) {
            return false;
        }
        self.event_data()
            .is_none_or(|filter| filter.matches(candidate.payload()))
    }
}

/// Apply offset and limit to an already filtered iterator.
pub(crate) fn paginate<I>(query: &SearchQuery, matched: I) -> impl Iterator<Item = I::Item>
where
    I: Iterator,
{
    let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
    let limit = match query.limit() {
        0 => usize::MAX,
        limit => usize::try_from(limit).unwrap_or(usize::MAX),
    };
    matched.skip(offset).take(limit)
}
