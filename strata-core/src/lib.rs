//! Core traits and types for the Strata event store.
//!
//! This crate provides the foundational abstractions:
//!
//! - [`event`] - Persisted events and their aggregate envelope
//! - [`command`] - Intents to append events (`Command`)
//! - [`query`] - Search query builder (`SearchQueryBuilder`, `SearchQuery`)
//! - [`matching`] - In-memory evaluation of queries against commands and events
//! - [`store`] - Event persistence abstraction (`Eventstore`, `Context`)
//! - [`writemodel`] - Append-and-reduce protocol for write models
//! - [`view`] - Projection updater for read models
//! - [`concurrency`] - Optimistic concurrency conflicts
//!
//! # Example
//!
//! ```
//! use strata_core::{
//!     command::Command,
//!     event::Aggregate,
//!     query::{Columns, SearchQueryBuilder},
//! };
//!
//! let commands = [Command::new(Aggregate::new("org", "org-1"), "org.added")];
//! let query = SearchQueryBuilder::new(Columns::Event)
//!     .add_query()
//!     .aggregate_types(["org"])
//!     .build()
//!     .unwrap();
//! assert_eq!(query.matches(&commands).len(), 1);
//! ```
//!
//! Most users should depend on the `strata` crate, which re-exports these
//! types with a flatter API surface.

pub mod command;
pub mod concurrency;
pub mod event;
pub mod matching;
pub mod query;
pub mod store;
pub mod view;
pub mod writemodel;
