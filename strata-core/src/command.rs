//! Commands: requested, not-yet-persisted state transitions.
//!
//! A [`Command`] carries the same identity as the [`Event`](crate::event::Event)
//! it will become, minus what the store assigns at push time. It may carry
//! the aggregate sequence its producer observed; that single fact drives both
//! dry-run matching and the optimistic-concurrency check on push.

use serde::Serialize;
use thiserror::Error;

use crate::event::{Aggregate, DomainEvent, EventType};

/// Intent to append one event to an aggregate stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub aggregate: Aggregate,
    pub event_type: EventType,
    pub editor_user: String,
    pub payload: serde_json::Value,
    /// Aggregate sequence the producer observed before issuing the command.
    ///
    /// `None` pushes unchecked. `Some(0)` expects the stream to be empty.
    pub sequence: Option<u64>,
}

/// Error returned when a payload cannot be serialized into a command.
#[derive(Debug, Error)]
#[error("could not encode payload of `{event_type}` command: {source}")]
pub struct PayloadEncodeError {
    pub event_type: EventType,
    #[source]
    pub source: serde_json::Error,
}

impl Command {
    /// Command without payload.
    #[must_use]
    pub fn new(aggregate: Aggregate, event_type: impl Into<EventType>) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            editor_user: String::new(),
            payload: serde_json::Value::Null,
            sequence: None,
        }
    }

    /// Command recording a typed payload under its [`DomainEvent::TYPE`].
    ///
    /// # Errors
    ///
    /// Returns [`PayloadEncodeError`] if the payload fails to serialize.
    pub fn from_event<E>(aggregate: Aggregate, event: &E) -> Result<Self, PayloadEncodeError>
    where
        E: DomainEvent + Serialize,
    {
        Self::new(aggregate, E::TYPE).with_payload(event)
    }

    /// Replace the payload.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadEncodeError`] if the payload fails to serialize.
    pub fn with_payload<T>(mut self, payload: &T) -> Result<Self, PayloadEncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.payload =
            serde_json::to_value(payload).map_err(|source| PayloadEncodeError {
                event_type: self.event_type.clone(),
                source,
            })?;
        Ok(self)
    }

    #[must_use]
    pub fn editor_user(mut self, editor_user: impl Into<String>) -> Self {
        self.editor_user = editor_user.into();
        self
    }

    /// Require the stream to still be at `sequence` when the command is
    /// pushed.
    #[must_use]
    pub fn expect_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}
