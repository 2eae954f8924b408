use std::time::Duration;

use sqlx::PgConnection;

use crate::Error;

/// Block until every transaction in progress when this is called has
/// committed or aborted.
///
/// Positions are drawn before commit, so a reader could otherwise observe a
/// later position before an earlier one becomes visible. Transactions that
/// start after the call are not waited for. Callers bound the wait through
/// their context.
pub(crate) async fn await_open_transactions(
    conn: &mut PgConnection,
    poll_interval: Duration,
) -> Result<(), Error> {
    let open: Vec<String> = sqlx::query_scalar(
        r"SELECT xip::text FROM pg_snapshot_xip(pg_current_snapshot()) AS xip",
    )
    .fetch_all(&mut *conn)
    .await?;

    if open.is_empty() {
        return Ok(());
    }
    tracing::debug!(open_transactions = open.len(), "awaiting open transactions");

    loop {
        let still_open: i64 = sqlx::query_scalar(
            r"
                SELECT COUNT(*)
                FROM unnest($1::text[]) AS xid
                WHERE pg_xact_status(xid::xid8) = 'in progress'
                ",
        )
        .bind(&open)
        .fetch_one(&mut *conn)
        .await?;

        if still_open == 0 {
            return Ok(());
        }
        tracing::trace!(still_open, "open transactions pending");
        tokio::time::sleep(poll_interval).await;
    }
}
