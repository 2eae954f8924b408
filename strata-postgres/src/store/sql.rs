//! Translation of a [`SearchQuery`] into SQL.

use sqlx::{Postgres, QueryBuilder};
use strata_core::query::{Columns, SearchQuery, SubQuery};

use crate::Error;

pub(crate) const EVENTS_TABLE: &str = "strata_events";

pub(crate) const EVENT_COLUMNS: &str = "instance_id, aggregate_type, aggregate_id, \
                                        resource_owner, event_type, sequence, position, \
                                        creation_date, editor_user, data";

/// Numeric query bounds converted to the database's signed columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Bounds {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sequence_greater: Option<i64>,
    pub position_after: Option<i64>,
    pub as_of_position: Option<i64>,
}

impl Bounds {
    pub(crate) fn from_query(query: &SearchQuery) -> Result<Self, Error> {
        let nonzero = |field, value: u64| {
            (value > 0).then(|| to_i64(field, value)).transpose()
        };
        Ok(Self {
            limit: nonzero("limit", query.limit())?,
            offset: nonzero("offset", query.offset())?,
            sequence_greater: nonzero("sequence_greater", query.sequence_greater())?,
            position_after: query
                .position_after()
                .map(|position| to_i64("position_after", position))
                .transpose()?,
            as_of_position: query
                .as_of_position()
                .map(|position| to_i64("as_of_position", position))
                .transpose()?,
        })
    }
}

pub(crate) fn to_i64(field: &'static str, value: u64) -> Result<i64, Error> {
    i64::try_from(value).map_err(|_| Error::OutOfRange { field, value })
}

/// Build the statement answering `query`.
///
/// `snapshot` bounds positions for time-travel reads without an explicit
/// position.
pub(crate) fn select(
    query: &SearchQuery,
    bounds: &Bounds,
    snapshot: Option<i64>,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
    match query.columns() {
        Columns::Event => {
            qb.push(EVENT_COLUMNS);
        }
        Columns::MaxSequence => {
            qb.push("MAX(sequence)");
        }
        Columns::InstanceIds => {
            qb.push("DISTINCT instance_id");
        }
    }
    qb.push(" FROM ").push(EVENTS_TABLE).push(" WHERE TRUE");
    push_filters(&mut qb, query, bounds, snapshot);

    let direction = if query.is_desc() { "DESC" } else { "ASC" };
    match query.columns() {
        Columns::Event => {
            qb.push(" ORDER BY position ").push(direction);
            push_pagination(&mut qb, bounds);
        }
        Columns::MaxSequence => {}
        Columns::InstanceIds => {
            qb.push(" ORDER BY instance_id ").push(direction);
            push_pagination(&mut qb, bounds);
        }
    }
    qb
}

fn push_filters(
    qb: &mut QueryBuilder<'static, Postgres>,
    query: &SearchQuery,
    bounds: &Bounds,
    snapshot: Option<i64>,
) {
    // events without a tenant are visible to every tenant
    if let Some(instance_id) = query.instance_id()
        && !instance_id.is_empty()
    {
        qb.push(" AND (instance_id = ")
            .push_bind(instance_id.to_owned())
            .push(" OR instance_id = '')");
    }
    if let Some(owner) = query.resource_owner() {
        qb.push(" AND resource_owner = ").push_bind(owner.to_owned());
    }
    if let Some(editor) = query.editor_user() {
        qb.push(" AND editor_user = ").push_bind(editor.to_owned());
    }
    if let Some(after) = query.creation_date_after() {
        qb.push(" AND creation_date > ").push_bind(after);
    }
    if let Some(before) = query.creation_date_before() {
        qb.push(" AND creation_date < ").push_bind(before);
    }
    if let Some(after) = bounds.position_after {
        qb.push(" AND position > ").push_bind(after);
    }
    if let Some(bound) = bounds.as_of_position.or(snapshot) {
        qb.push(" AND position <= ").push_bind(bound);
    }
    if let Some(sequence) = bounds.sequence_greater {
        qb.push(" AND sequence > ").push_bind(sequence);
    }

    let sub_queries = query.sub_queries();
    if sub_queries.is_empty() {
        return;
    }
    qb.push(" AND (");
    for (i, sub_query) in sub_queries.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        push_sub_query(qb, sub_query);
    }
    qb.push(")");
}

fn push_sub_query(qb: &mut QueryBuilder<'static, Postgres>, sub_query: &SubQuery) {
    qb.push("(TRUE");
    if !sub_query.aggregate_types().is_empty() {
        let types: Vec<String> = sub_query
            .aggregate_types()
            .iter()
            .map(|t| t.as_str().to_owned())
            .collect();
        qb.push(" AND aggregate_type = ANY(").push_bind(types).push(")");
    }
    if !sub_query.aggregate_ids().is_empty() {
        qb.push(" AND aggregate_id = ANY(")
            .push_bind(sub_query.aggregate_ids().to_vec())
            .push(")");
    }
    if !sub_query.event_types().is_empty() {
        let types: Vec<String> = sub_query
            .event_types()
            .iter()
            .map(|t| t.as_str().to_owned())
            .collect();
        qb.push(" AND event_type = ANY(").push_bind(types).push(")");
    }
    if let Some(filter) = sub_query.event_data() {
        for (key, value) in filter.iter() {
            qb.push(" AND data -> ")
                .push_bind(key.to_owned())
                .push(" = ")
                .push_bind(sqlx::types::Json(value.clone()));
        }
    }
    qb.push(")");
}

fn push_pagination(qb: &mut QueryBuilder<'static, Postgres>, bounds: &Bounds) {
    if let Some(limit) = bounds.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
    if let Some(offset) = bounds.offset {
        qb.push(" OFFSET ").push_bind(offset);
    }
}
