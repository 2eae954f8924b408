#![doc = include_str!("../README.md")]

pub use strata_core::{
    command,
    command::Command,
    concurrency,
    concurrency::ConcurrencyConflict,
    event,
    event::{Aggregate, AggregateType, DomainEvent, Event, EventDecodeError, EventType},
    matching,
    matching::Matchable,
    query,
    query::{Columns, EventDataFilter, QueryError, SearchQuery, SearchQueryBuilder},
    view,
    view::{View, ViewAction, ViewError, ViewMeta},
    writemodel,
    writemodel::{ExistenceCheck, QueryReducer, Reducer, WriteModel},
};

pub mod store {

    pub use strata_core::store::{Context, Eventstore, NonEmpty, QueryOutput, StoreError};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use strata_postgres::{Config, Error, Scoped, Store};
    }

    pub use strata_core::store::inmemory;
}
