use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use strata_core::{
    command::Command,
    concurrency::ConcurrencyConflict,
    event::{Event, StreamKey},
    store::{Context, StoreError},
};

use super::{
    load::{position_from_db, sequence_from_db},
    sql::{EVENTS_TABLE, to_i64},
};
use crate::Error;

/// Key of the transaction-scoped advisory lock serialising pushes.
///
/// Holding it until commit makes positions visible in the order they were
/// drawn.
const PUSH_LOCK_KEY: i64 = 0x7374_7261_7461;

fn backend(error: impl Into<Error>) -> StoreError<Error> {
    StoreError::backend(error.into())
}

/// Persist `commands` in one transaction, or a savepoint when `conn` is
/// already inside one.
///
/// `ctx` can interrupt everything up to the commit. Once the commit is
/// issued it runs to completion, so an interrupted push never persisted
/// anything.
pub(crate) async fn push(
    conn: &mut PgConnection,
    ctx: &Context,
    commands: Vec<Command>,
) -> Result<Vec<Event>, StoreError<Error>> {
    let mut tx = conn.begin().await.map_err(backend)?;
    let events = ctx.run(stage(&mut *tx, commands)).await?;
    ctx.check::<Error>()?;

    tx.commit().await.map_err(backend)?;
    tracing::debug!(events_appended = events.len(), "events pushed");
    Ok(events)
}

/// Lock, check expectations and insert without committing.
async fn stage(
    tx: &mut PgConnection,
    commands: Vec<Command>,
) -> Result<Vec<Event>, StoreError<Error>> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(PUSH_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

    let mut heads: HashMap<StreamKey, u64> = HashMap::new();
    for command in &commands {
        let key = command.aggregate.stream_key();
        if heads.contains_key(&key) {
            continue;
        }
        let head = current_sequence(tx, &key).await.map_err(backend)?;
        heads.insert(key, head);
    }

    check_expectations(&commands, &heads)?;

    let mut staged = Vec::with_capacity(commands.len());
    for command in commands {
        let head = heads.entry(command.aggregate.stream_key()).or_insert(0);
        *head += 1;
        staged.push((command, *head));
    }

    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
    qb.push(EVENTS_TABLE).push(
        " (instance_id, aggregate_type, aggregate_id, sequence, resource_owner, event_type, \
         editor_user, data) ",
    );
    let mut binds = Vec::with_capacity(staged.len());
    for (command, sequence) in &staged {
        binds.push((command.clone(), to_i64("sequence", *sequence).map_err(backend)?));
    }
    qb.push_values(binds, |mut b, (command, sequence)| {
        b.push_bind(command.aggregate.instance_id);
        b.push_bind(command.aggregate.aggregate_type.as_str().to_owned());
        b.push_bind(command.aggregate.id);
        b.push_bind(sequence);
        b.push_bind(command.aggregate.resource_owner);
        b.push_bind(command.event_type.as_str().to_owned());
        b.push_bind(command.editor_user);
        b.push_bind(sqlx::types::Json(command.payload));
    });
    qb.push(" RETURNING position, creation_date");

    let mut rows: Vec<(i64, DateTime<Utc>)> = qb
        .build_query_as()
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;
    if rows.len() != staged.len() {
        return Err(backend(Error::MissingReturnedPosition));
    }
    // positions are drawn in VALUES order while the push lock is held
    rows.sort_unstable_by_key(|(position, _)| *position);

    let mut events = Vec::with_capacity(staged.len());
    for ((command, sequence), (position, creation_date)) in staged.into_iter().zip(rows) {
        events.push(Event {
            aggregate: command.aggregate,
            event_type: command.event_type,
            sequence,
            position: position_from_db(position).map_err(backend)?,
            creation_date,
            editor_user: command.editor_user,
            data: command.payload,
        });
    }
    Ok(events)
}

async fn current_sequence(conn: &mut PgConnection, key: &StreamKey) -> Result<u64, Error> {
    let current: i64 = sqlx::query_scalar(
        r"
            SELECT COALESCE(MAX(sequence), 0)::BIGINT
            FROM strata_events
            WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
            ",
    )
    .bind(&key.instance_id)
    .bind(key.aggregate_type.as_str())
    .bind(&key.aggregate_id)
    .fetch_one(conn)
    .await?;
    sequence_from_db(current)
}

/// Compare every expected sequence with its stream head before the batch.
fn check_expectations(
    commands: &[Command],
    heads: &HashMap<StreamKey, u64>,
) -> Result<(), ConcurrencyConflict> {
    for command in commands {
        let Some(expected) = command.sequence else {
            continue;
        };
        let actual = heads
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
    Ok(())
}
