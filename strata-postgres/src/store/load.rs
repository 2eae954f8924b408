use std::time::Duration;

use sqlx::{PgConnection, Row, postgres::PgRow};
use strata_core::{
    event::{Aggregate, Event},
    query::{Columns, SearchQuery},
    store::QueryOutput,
};

use super::{
    open_tx,
    sql::{self, Bounds},
};
use crate::Error;

/// Answer `query` on `conn`.
pub(crate) async fn run_query(
    conn: &mut PgConnection,
    query: &SearchQuery,
    bounds: &Bounds,
    poll_interval: Duration,
) -> Result<QueryOutput, Error> {
    if query.await_open_transactions() {
        open_tx::await_open_transactions(conn, poll_interval).await?;
    }

    let snapshot = if query.allow_time_travel() && bounds.as_of_position.is_none() {
        Some(latest_position(conn).await?)
    } else {
        None
    };

    let mut qb = sql::select(query, bounds, snapshot);
    match query.columns() {
        Columns::Event => {
            let rows = qb.build().fetch_all(&mut *conn).await?;
            let events = decode_rows(rows)?;
            tracing::debug!(event_count = events.len(), "events loaded");
            Ok(QueryOutput::Events(events))
        }
        Columns::MaxSequence => {
            let max: Option<i64> = qb.build_query_scalar().fetch_one(&mut *conn).await?;
            let max = max.map(sequence_from_db).transpose()?;
            Ok(QueryOutput::MaxSequence(max))
        }
        Columns::InstanceIds => {
            let ids: Vec<String> = qb.build_query_scalar().fetch_all(&mut *conn).await?;
            Ok(QueryOutput::InstanceIds(ids))
        }
    }
}

/// Highest committed position, `0` for an empty log.
pub(crate) async fn latest_position(conn: &mut PgConnection) -> Result<i64, Error> {
    let latest: i64 = sqlx::query_scalar(
        r"SELECT COALESCE(MAX(position), 0)::BIGINT FROM strata_events",
    )
    .fetch_one(conn)
    .await?;
    Ok(latest)
}

/// Deserialise a batch of raw Postgres rows into [`Event`]s.
pub(crate) fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<Event>, Error> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let instance_id: String = row.try_get("instance_id")?;
        let aggregate_type: String = row.try_get("aggregate_type")?;
        let aggregate_id: String = row.try_get("aggregate_id")?;
        let resource_owner: String = row.try_get("resource_owner")?;
        let event_type: String = row.try_get("event_type")?;
        let sequence: i64 = row.try_get("sequence")?;
        let position: i64 = row.try_get("position")?;
        let creation_date = row.try_get("creation_date")?;
        let editor_user: String = row.try_get("editor_user")?;
        let data: sqlx::types::Json<serde_json::Value> = row.try_get("data")?;

        out.push(Event {
            aggregate: Aggregate::new(aggregate_type, aggregate_id)
                .in_instance(instance_id)
                .owned_by(resource_owner),
            event_type: event_type.into(),
            sequence: sequence_from_db(sequence)?,
            position: position_from_db(position)?,
            creation_date,
            editor_user,
            data: data.0,
        });
    }

    Ok(out)
}

pub(crate) fn sequence_from_db(sequence: i64) -> Result<u64, Error> {
    u64::try_from(sequence).map_err(|_| Error::InvalidSequence(sequence))
}

pub(crate) fn position_from_db(position: i64) -> Result<u64, Error> {
    u64::try_from(position).map_err(|_| Error::InvalidPosition(position))
}
