mod commit;
mod load;
mod open_tx;
mod sql;

use std::time::Duration;

use nonempty::NonEmpty;
use sqlx::{PgConnection, PgPool, postgres::PgPoolOptions};
use strata_core::{
    command::Command,
    event::Event,
    query::SearchQuery,
    store::{Context, Eventstore, QueryOutput, StoreError},
};
use tokio::sync::Mutex;

use self::sql::Bounds;
use crate::{Config, Error};

/// A PostgreSQL-backed [`Eventstore`].
///
/// - Positions are global and monotonic (`BIGINT`, backed by `BIGSERIAL`).
///   Pushes serialise on an advisory lock so positions become visible in
///   order.
/// - Sequences are unique per `(instance_id, aggregate_type, aggregate_id)`.
/// - Event payloads are stored as `jsonb`.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
    poll_interval: Duration,
}

impl Store {
    /// Construct a `PostgreSQL` event store from a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Config::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Open a pool as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if no connection can be established.
    #[tracing::instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let pool = Self::pool_options(config).connect(&config.url).await?;
        Ok(Self::new(pool).with_poll_interval(config.poll_interval))
    }

    /// Like [`connect`](Self::connect), but connections are only opened when
    /// first needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the URL cannot be parsed.
    pub fn connect_lazy(config: &Config) -> Result<Self, Error> {
        let pool = Self::pool_options(config).connect_lazy(&config.url)?;
        Ok(Self::new(pool).with_poll_interval(config.poll_interval))
    }

    fn pool_options(config: &Config) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run queries and pushes on a transaction the caller already opened.
    ///
    /// Reads see the transaction's own uncommitted writes. Each push runs in
    /// a savepoint, so a rejected push leaves the caller's transaction
    /// usable. Committing or rolling back stays with the caller.
    ///
    /// The first push takes the store-wide push lock, which is only released
    /// when the caller's transaction ends. Until then every other push
    /// blocks, including pushes through the pooled [`Store`] from the same
    /// task, which then waits until its [`Context`] is cancelled or times
    /// out. Keep these transactions short and push through the returned
    /// [`Scoped`] only.
    #[must_use]
    pub fn in_transaction<'c>(&self, conn: &'c mut PgConnection) -> Scoped<'c> {
        Scoped {
            conn: Mutex::new(conn),
            poll_interval: self.poll_interval,
        }
    }

    /// Apply the initial schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS strata_events (
                instance_id    TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                sequence       BIGINT NOT NULL,
                position       BIGSERIAL NOT NULL UNIQUE,
                resource_owner TEXT NOT NULL,
                event_type     TEXT NOT NULL,
                editor_user    TEXT NOT NULL,
                creation_date  TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                data           JSONB NOT NULL DEFAULT 'null'::jsonb,
                PRIMARY KEY (instance_id, aggregate_type, aggregate_id, sequence)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS strata_events_by_type_and_position ON strata_events(aggregate_type, position)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS strata_events_by_owner ON strata_events(resource_owner, position)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl Eventstore for Store {
    type Error = Error;

    #[tracing::instrument(skip(self, ctx, query), fields(columns = %query.columns()))]
    async fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> Result<QueryOutput, StoreError<Self::Error>> {
        ctx.run(async move {
            let query = query.ensure_instance_id(ctx);
            let bounds = Bounds::from_query(&query).map_err(StoreError::backend)?;
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| StoreError::backend(Error::Database(e)))?;
            load::run_query(&mut conn, &query, &bounds, self.poll_interval)
                .await
                .map_err(StoreError::backend)
        })
        .await
    }

    #[tracing::instrument(skip(self, ctx, commands), fields(command_count = commands.len()))]
    async fn push<'a>(
        &'a self,
        ctx: &'a Context,
        commands: NonEmpty<Command>,
    ) -> Result<Vec<Event>, StoreError<Self::Error>> {
        let commands = scope_commands(ctx, commands);
        let mut conn = ctx
            .run(async {
                self.pool
                    .acquire()
                    .await
                    .map_err(|e| StoreError::backend(Error::Database(e)))
            })
            .await?;
        commit::push(&mut conn, ctx, commands).await
    }
}

/// Store view bound to a caller-owned transaction.
///
/// Created by [`Store::in_transaction`].
pub struct Scoped<'c> {
    conn: Mutex<&'c mut PgConnection>,
    poll_interval: Duration,
}

impl Eventstore for Scoped<'_> {
    type Error = Error;

    #[tracing::instrument(skip(self, ctx, query), fields(columns = %query.columns()))]
    async fn query<'a>(
        &'a self,
        ctx: &'a Context,
        query: &'a SearchQuery,
    ) -> Result<QueryOutput, StoreError<Self::Error>> {
        ctx.run(async move {
            let query = query.ensure_instance_id(ctx);
            let bounds = Bounds::from_query(&query).map_err(StoreError::backend)?;
            let mut conn = self.conn.lock().await;
            load::run_query(&mut conn, &query, &bounds, self.poll_interval)
                .await
                .map_err(StoreError::backend)
        })
        .await
    }

    #[tracing::instrument(skip(self, ctx, commands), fields(command_count = commands.len()))]
    async fn push<'a>(
        &'a self,
        ctx: &'a Context,
        commands: NonEmpty<Command>,
    ) -> Result<Vec<Event>, StoreError<Self::Error>> {
        let commands = scope_commands(ctx, commands);
        let mut conn = ctx
            .run(async { Ok::<_, StoreError<Error>>(self.conn.lock().await) })
            .await?;
        commit::push(&mut conn, ctx, commands).await
    }
}

fn scope_commands(ctx: &Context, commands: NonEmpty<Command>) -> Vec<Command> {
    commands
        .into_iter()
        .map(|mut command| {
            ctx.scope_aggregate(&mut command.aggregate);
            command
        })
        .collect()
}
