//! Projection updater for long-lived read models.
//!
//! A [`View`] is persisted state kept current by applying events one at a
//! time. Every applied event advances the view's watermark, even when its
//! payload turns out to be unreadable, so a broken event is reported once
//! and never replayed forever.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::event::{Event, EventDecodeError, EventType, StreamKey};

/// Watermark shared by all views.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewMeta {
    /// Sequence of the last applied event.
    pub sequence: u64,
    pub creation_date: Option<DateTime<Utc>>,
    pub change_date: Option<DateTime<Utc>>,
}

/// How a view reacts to an event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewAction {
    /// Bind root identity and creation date, then apply the payload.
    Create,
    /// Apply the payload.
    Change,
    /// Only advance the watermark.
    Ignore,
}

/// Error returned while applying events to a view.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("could not apply event to view: {0}")]
    Decode(#[from] EventDecodeError),
    #[error("event sequence {sequence} is not after view sequence {current}")]
    OutOfOrder { current: u64, sequence: u64 },
}

/// Read model updated from events.
pub trait View {
    /// Payload fields an event may overwrite.
    type Patch: DeserializeOwned;

    fn meta(&self) -> &ViewMeta;

    fn meta_mut(&mut self) -> &mut ViewMeta;

    fn action(&self, event_type: &EventType) -> ViewAction;

    /// Take root identity from a creating event.
    fn bind_root(&mut self, event: &Event);

    fn apply_patch(&mut self, patch: Self::Patch);

    /// Apply one event.
    ///
    /// The watermark always advances. A creating event binds root identity
    /// and creation date before its payload is read.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::Decode`] when the payload cannot be read. The
    /// patchable fields are left unchanged in that case.
    fn append_event(&mut self, event: &Event) -> Result<(), ViewError> {
        let meta = self.meta_mut();
        meta.sequence = event.sequence;
        meta.change_date = Some(event.creation_date);

        match self.action(&event.event_type) {
            ViewAction::Create => {
                self.bind_root(event);
                self.meta_mut().creation_date = Some(event.creation_date);
                self.set_data(event)
            }
            ViewAction::Change => self.set_data(event),
            ViewAction::Ignore => Ok(()),
        }
    }

    /// Decode the payload and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::Decode`] when the payload cannot be read.
    fn set_data(&mut self, event: &Event) -> Result<(), ViewError> {
        match event.decode::<Self::Patch>() {
            Ok(patch) => {
                self.apply_patch(patch);
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    event_type = %event.event_type,
                    sequence = event.sequence,
                    %error,
                    "could not unmarshal event data"
                );
                Err(error.into())
            }
        }
    }

    /// Apply a batch in order.
    ///
    /// Sequences are only comparable within one stream, so the batch is
    /// checked per [`StreamKey`] before anything is applied. The view's own
    /// watermark belongs to the stream of the first event. Application stops
    /// at the first decode failure; events before it stay applied.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::OutOfOrder`] when a sequence is not strictly
    /// greater than the previous one of the same stream, or the first
    /// [`ViewError::Decode`].
    fn append_events(&mut self, events: &[Event]) -> Result<(), ViewError> {
        let mut latest: HashMap<StreamKey, u64> = HashMap::new();
        if let Some(first) = events.first() {
            latest.insert(first.aggregate.stream_key(), self.meta().sequence);
        }
        for event in events {
            let current = latest.entry(event.aggregate.stream_key()).or_insert(0);
            if event.sequence <= *current {
                return Err(ViewError::OutOfOrder {
                    current: *current,
                    sequence: event.sequence,
                });
            }
            *current = event.sequence;
        }
        events.iter().try_for_each(|event| self.append_event(event))
    }
}
