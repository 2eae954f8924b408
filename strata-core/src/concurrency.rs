//! Optimistic concurrency conflicts.
//!
//! Pushes are the single point where concurrency is enforced: a command that
//! carries the sequence its producer observed is rejected when the stream has
//! moved on. No locks are taken ahead of time and nothing is retried here.

use thiserror::Error;

use crate::event::AggregateType;

/// The persisted stream no longer matches what the pushing caller observed.
///
/// The whole push is rejected; nothing from the batch was appended. Reload
/// the write model before deciding whether to issue the command again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.aggregate_type, .aggregate_id, *.expected, *.actual))]
pub struct ConcurrencyConflict {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    /// Sequence the command expected. `0` means a new, empty stream.
    pub expected: u64,
    /// Sequence currently persisted. `0` means the stream is empty.
    pub actual: u64,
}

impl ConcurrencyConflict {
    /// Whether the caller expected to create the aggregate.
    #[must_use]
    pub const fn expected_new_stream(&self) -> bool {
        self.expected == 0
    }
}

fn format_conflict(
    aggregate_type: &AggregateType,
    aggregate_id: &str,
    expected: u64,
    actual: u64,
) -> String {
    if expected == 0 {
        format!(
            "concurrency conflict on {aggregate_type} `{aggregate_id}`: expected new stream, found \
             sequence {actual} (hint: another process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict on {aggregate_type} `{aggregate_id}`: expected sequence \
             {expected}, found {actual} (hint: stream was modified; reload and retry)"
        )
    }
}
