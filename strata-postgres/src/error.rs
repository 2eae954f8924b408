/// Error type for `PostgreSQL` event store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored position was not a valid unsigned value.
    #[error("invalid position value from database: {0}")]
    InvalidPosition(i64),
    /// A stored sequence was not a valid unsigned value.
    #[error("invalid sequence value from database: {0}")]
    InvalidSequence(i64),
    /// A query bound does not fit the database's signed 64-bit columns.
    #[error("{field} value {value} exceeds the database range")]
    OutOfRange { field: &'static str, value: u64 },
    /// Insert operation returned fewer rows than events written.
    #[error("database did not return an inserted position")]
    MissingReturnedPosition,
}
