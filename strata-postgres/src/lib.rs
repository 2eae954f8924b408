//! Postgres-backed event store.
//!
//! This crate provides a `PostgreSQL` implementation of
//! [`strata_core::store::Eventstore`]:
//!
//! - [`Store`] - pooled store; every push runs in its own transaction
//! - [`Scoped`] - the same store bound to a transaction the caller owns
//!
//! Call [`Store::migrate`] once on startup to create the events table.

mod config;
mod error;
mod store;

pub use config::Config;
pub use error::Error;
pub use store::{Scoped, Store};
