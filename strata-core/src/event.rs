//! Event model.
//!
//! An [`Event`] is an immutable fact recorded against one aggregate stream.
//! Events are only ever appended; the store assigns their `sequence`,
//! `position` and `creation_date` at push time. The payload stays opaque
//! JSON until a reader asks for it with [`Event::decode`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Name of an aggregate type, e.g. `"org"` or `"key_pair"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

impl AggregateType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AggregateType {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for AggregateType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminator naming a state transition, e.g. `"org.member.added"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl PartialEq<str> for EventType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and tenancy of the stream an event or command belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    pub aggregate_type: AggregateType,
    pub id: String,
    /// Tenant the aggregate lives in. Empty on commands that defer to the
    /// caller's [`Context`](crate::store::Context).
    pub instance_id: String,
    /// Organisation owning the aggregate.
    pub resource_owner: String,
}

impl Aggregate {
    #[must_use]
    pub fn new(aggregate_type: impl Into<AggregateType>, id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            id: id.into(),
            instance_id: String::new(),
            resource_owner: String::new(),
        }
    }

    #[must_use]
    pub fn in_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    #[must_use]
    pub fn owned_by(mut self, resource_owner: impl Into<String>) -> Self {
        self.resource_owner = resource_owner.into();
        self
    }

    /// Key of the stream this aggregate writes to.
    #[must_use]
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            instance_id: self.instance_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.id.clone(),
        }
    }
}

/// Identity of one event stream. Sequences are unique per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
}

/// Marker for typed event payloads.
///
/// Each payload type carries the [`EventType`] it is recorded under, so
/// commands can be built from a payload without repeating the name and
/// readers can check they decode the right thing.
pub trait DomainEvent {
    const TYPE: &'static str;
}

/// Event materialized from the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub aggregate: Aggregate,
    pub event_type: EventType,
    /// Position within the aggregate stream, starting at 1.
    pub sequence: u64,
    /// Global commit-order position, starting at 1.
    pub position: u64,
    pub creation_date: DateTime<Utc>,
    pub editor_user: String,
    /// Opaque payload; `Null` when the event carries none.
    pub data: serde_json::Value,
}

impl Event {
    /// Deserialize the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::Payload`] if the payload does not have the
    /// shape `T` expects.
    pub fn decode<T>(&self) -> Result<T, EventDecodeError>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.data).map_err(|source| EventDecodeError::Payload {
            event_type: self.event_type.clone(),
            sequence: self.sequence,
            source,
        })
    }

    /// Deserialize the payload into a [`DomainEvent`], checking the event
    /// type first.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnexpectedType`] when the event was
    /// recorded under another type, or [`EventDecodeError::Payload`] when the
    /// payload does not decode.
    pub fn decode_as<E>(&self) -> Result<E, EventDecodeError>
    where
        E: DomainEvent + DeserializeOwned,
    {
        if self.event_type != E::TYPE {
            return Err(EventDecodeError::UnexpectedType {
                expected: E::TYPE,
                actual: self.event_type.clone(),
            });
        }
        self.decode()
    }
}

/// Error returned when an event payload cannot be interpreted.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unexpected event type `{actual}`, expected `{expected}`")]
    UnexpectedType {
        expected: &'static str,
        actual: EventType,
    },
    #[error("could not decode payload of `{event_type}` event at sequence {sequence}: {source}")]
    Payload {
        event_type: EventType,
        sequence: u64,
        #[source]
        source: serde_json::Error,
    },
}
