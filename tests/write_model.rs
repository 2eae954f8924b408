//! Integration tests for the append-and-reduce protocol.

use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use strata::{
    Aggregate, Columns, Command, DomainEvent, EventDataFilter, ExistenceCheck, QueryReducer,
    Reducer, SearchQueryBuilder, WriteModel,
    store::{Context, Eventstore, NonEmpty, StoreError, inmemory},
    writemodel::{
        ProtocolError, ReduceError, ReplayState, append_and_reduce, exists, push_append_and_reduce,
        query_and_reduce,
    },
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Domain: Organisations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OrgAdded {
    name: String,
}

impl DomainEvent for OrgAdded {
    const TYPE: &'static str = "org.added";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OrgChanged {
    name: String,
}

impl DomainEvent for OrgChanged {
    const TYPE: &'static str = "org.changed";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum OrgState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct OrgWriteModel {
    base: WriteModel,
    name: String,
    state: OrgState,
}

impl OrgWriteModel {
    fn new(org_id: &str) -> Self {
        Self {
            base: WriteModel::new(org_id),
            ..Self::default()
        }
    }

    fn aggregate(&self) -> Aggregate {
        Aggregate::new("org", self.base.aggregate_id.clone()).owned_by(self.base.aggregate_id.clone())
    }
}

impl Reducer for OrgWriteModel {
    fn append_events(&mut self, events: Vec<strata::Event>) {
        self.base.append_events(events);
    }

    fn reduce(&mut self) -> Result<(), ReduceError> {
        for event in &self.base.events {
            match event.event_type.as_str() {
                OrgAdded::TYPE => {
                    let added: OrgAdded = event.decode_as()?;
                    self.name = added.name;
                    self.state = OrgState::Active;
                }
                OrgChanged::TYPE => {
                    let changed: OrgChanged = event.decode_as()?;
                    self.name = changed.name;
                }
                "org.removed" => self.state = OrgState::Removed,
                _ => {}
            }
        }
        self.base.reduce()
    }
}

impl QueryReducer for OrgWriteModel {
    fn query(&self) -> SearchQueryBuilder {
        SearchQueryBuilder::new(Columns::Event)
            .resource_owner(self.base.aggregate_id.clone())
            .add_query()
            .aggregate_types(["org"])
            .aggregate_ids([self.base.aggregate_id.clone()])
            .event_types([OrgAdded::TYPE, OrgChanged::TYPE, "org.removed"])
            .builder()
    }
}

impl ExistenceCheck for OrgWriteModel {
    fn exists(&self) -> bool {
        self.state == OrgState::Active
    }
}

#[derive(Debug, Error)]
enum OrgError {
    #[error("organisation already exists")]
    AlreadyExists,
    #[error("organisation not found")]
    NotFound,
    #[error(transparent)]
    Protocol(#[from] ProtocolError<Infallible>),
}

/// Command handler creating an organisation once.
async fn add_org(
    store: &inmemory::Store,
    ctx: &Context,
    org_id: &str,
    name: &str,
) -> Result<OrgWriteModel, OrgError> {
    let mut model = OrgWriteModel::new(org_id);
    if exists(store, ctx, &mut model).await? {
        return Err(OrgError::AlreadyExists);
    }
    let command = Command::from_event(
        model.aggregate(),
        &OrgAdded {
            name: name.to_owned(),
        },
    )
    .unwrap()
    .expect_sequence(model.base.processed_sequence);
    push_append_and_reduce(store, ctx, &mut model, NonEmpty::new(command)).await?;
    Ok(model)
}

/// Command handler renaming an organisation the caller loaded earlier.
async fn rename_org(
    store: &inmemory::Store,
    ctx: &Context,
    model: &mut OrgWriteModel,
    name: &str,
) -> Result<(), OrgError> {
    if !model.exists() {
        return Err(OrgError::NotFound);
    }
    let command = Command::from_event(
        model.aggregate(),
        &OrgChanged {
            name: name.to_owned(),
        },
    )
    .unwrap()
    .expect_sequence(model.base.processed_sequence);
    push_append_and_reduce(store, ctx, model, NonEmpty::new(command)).await?;
    Ok(())
}

// ============================================================================
// Test Domain: Key pairs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct KeyPairAdded {
    usage: u8,
    algorithm: String,
}

impl DomainEvent for KeyPairAdded {
    const TYPE: &'static str = "key_pair.added";
}

#[derive(Debug, Default)]
struct KeyPairWriteModel {
    base: WriteModel,
    usage: Option<u8>,
    algorithm: String,
}

impl Reducer for KeyPairWriteModel {
    fn append_events(&mut self, events: Vec<strata::Event>) {
        self.base.append_events(events);
    }

    fn reduce(&mut self) -> Result<(), ReduceError> {
        for event in &self.base.events {
            if event.event_type.as_str() == KeyPairAdded::TYPE {
                let added: KeyPairAdded = event.decode_as()?;
                self.usage = Some(added.usage);
                self.algorithm = added.algorithm;
            }
        }
        self.base.reduce()
    }
}

impl QueryReducer for KeyPairWriteModel {
    fn query(&self) -> SearchQueryBuilder {
        SearchQueryBuilder::new(Columns::Event)
            .add_query()
            .aggregate_types(["key_pair"])
            .aggregate_ids([self.base.aggregate_id.clone()])
            .event_types([KeyPairAdded::TYPE])
            .builder()
    }
}

impl ExistenceCheck for KeyPairWriteModel {
    fn exists(&self) -> bool {
        self.usage.is_some()
    }
}

fn tenant() -> Context {
    Context::for_instance("instance-1")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn existence_gate_flips_after_creation() {
    let store = inmemory::Store::new();
    let ctx = tenant();

    let mut before = OrgWriteModel::new("org-1");
    assert!(!exists(&store, &ctx, &mut before).await.unwrap());
    assert_eq!(before.base.state(), ReplayState::Uninitialized);

    let created = add_org(&store, &ctx, "org-1", "ACME").await.unwrap();
    assert!(created.exists());
    assert_eq!(created.base.processed_sequence, 1);
    assert_eq!(created.base.instance_id, "instance-1");
    assert_eq!(created.base.state(), ReplayState::Current);

    let mut after = OrgWriteModel::new("org-1");
    assert!(exists(&store, &ctx, &mut after).await.unwrap());
    assert_eq!(after.name, "ACME");

    let duplicate = add_org(&store, &ctx, "org-1", "ACME again").await;
    assert!(matches!(duplicate, Err(OrgError::AlreadyExists)));
}

#[tokio::test]
async fn empty_replay_leaves_model_untouched() {
    let store = inmemory::Store::new();
    let mut model = OrgWriteModel::new("missing");

    query_and_reduce(&store, &tenant(), &mut model).await.unwrap();

    assert_eq!(model, OrgWriteModel::new("missing"));
}

#[tokio::test]
async fn replaying_the_same_history_is_idempotent() {
    let store = inmemory::Store::new();
    let ctx = tenant();
    let mut model = add_org(&store, &ctx, "org-1", "ACME").await.unwrap();
    rename_org(&store, &ctx, &mut model, "ACME Corp").await.unwrap();

    let query = model.query().build();
    let history = store.filter(&ctx, &query).await.unwrap();
    let sequences: Vec<_> = history.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, [1, 2]);

    let mut first = OrgWriteModel::new("org-1");
    append_and_reduce(&mut first, history.clone()).unwrap();
    let mut second = OrgWriteModel::new("org-1");
    append_and_reduce(&mut second, history).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.name, "ACME Corp");
    assert_eq!(first, model);
}

#[tokio::test]
async fn stale_model_push_is_rejected() {
    let store = inmemory::Store::new();
    let ctx = tenant();
    add_org(&store, &ctx, "org-1", "ACME").await.unwrap();

    let mut alice = OrgWriteModel::new("org-1");
    query_and_reduce(&store, &ctx, &mut alice).await.unwrap();
    let mut bob = OrgWriteModel::new("org-1");
    query_and_reduce(&store, &ctx, &mut bob).await.unwrap();

    rename_org(&store, &ctx, &mut alice, "Alice Inc").await.unwrap();
    let error = rename_org(&store, &ctx, &mut bob, "Bob Ltd")
        .await
        .unwrap_err();

    let OrgError::Protocol(ProtocolError::Store(StoreError::Conflict(conflict))) = error else {
        panic!("expected conflict, got {error:?}");
    };
    assert_eq!(conflict.aggregate_id, "org-1");
    assert_eq!(conflict.expected, 1);
    assert_eq!(conflict.actual, 2);

    // the rejected push leaves bob as it was
    assert_eq!(bob.name, "ACME");
    assert_eq!(bob.base.processed_sequence, 1);

    // reloading resolves the conflict
    let mut reloaded = OrgWriteModel::new("org-1");
    query_and_reduce(&store, &ctx, &mut reloaded).await.unwrap();
    rename_org(&store, &ctx, &mut reloaded, "Bob Ltd").await.unwrap();
    assert_eq!(reloaded.base.processed_sequence, 3);
}

#[tokio::test]
async fn cancelled_replay_propagates_without_touching_model() {
    let store = inmemory::Store::new();
    add_org(&store, &tenant(), "org-1", "ACME").await.unwrap();

    let token = CancellationToken::new();
    let ctx = tenant().with_cancellation(token.clone());
    token.cancel();

    let mut model = OrgWriteModel::new("org-1");
    let error = query_and_reduce(&store, &ctx, &mut model)
        .await
        .unwrap_err();

    let ProtocolError::Store(store_error) = error else {
        panic!("expected store error, got {error:?}");
    };
    assert!(matches!(store_error, StoreError::Cancelled));
    assert!(store_error.is_retryable());
    assert_eq!(model, OrgWriteModel::new("org-1"));
}

#[tokio::test]
async fn undecodable_payload_is_a_reduce_error() {
    let store = inmemory::Store::new();
    let ctx = tenant();
    store
        .push(
            &ctx,
            NonEmpty::new(
                Command::new(Aggregate::new("org", "org-1").owned_by("org-1"), OrgAdded::TYPE)
                    .with_payload(&"not-an-object")
                    .unwrap(),
            ),
        )
        .await
        .unwrap();

    let mut model = OrgWriteModel::new("org-1");
    let error = query_and_reduce(&store, &ctx, &mut model)
        .await
        .unwrap_err();

    assert!(matches!(error, ProtocolError::Reduce(ReduceError::Decode(_))));
}

#[tokio::test]
async fn key_pairs_are_found_by_usage() {
    let store = inmemory::Store::new();
    let ctx = tenant();

    let added = |id: &str, usage: u8| {
        Command::from_event(
            Aggregate::new("key_pair", id).owned_by("instance-1"),
            &KeyPairAdded {
                usage,
                algorithm: "rsa".to_owned(),
            },
        )
        .unwrap()
        .expect_sequence(0)
    };
    store
        .push(
            &ctx,
            NonEmpty::from_vec(vec![added("kp-1", 0), added("kp-2", 1)]).unwrap(),
        )
        .await
        .unwrap();

    let mut model = KeyPairWriteModel {
        base: WriteModel::new("kp-2"),
        ..KeyPairWriteModel::default()
    };
    assert!(exists(&store, &ctx, &mut model).await.unwrap());
    assert_eq!(model.usage, Some(1));
    assert_eq!(model.algorithm, "rsa");

    let signing_keys = SearchQueryBuilder::new(Columns::Event)
        .add_query()
        .aggregate_types(["key_pair"])
        .event_types([KeyPairAdded::TYPE])
        .event_data(EventDataFilter::new().field("usage", 0))
        .build();
    let found = store.filter(&ctx, &signing_keys).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].aggregate.id, "kp-1");

    let mut missing = KeyPairWriteModel {
        base: WriteModel::new("kp-3"),
        ..KeyPairWriteModel::default()
    };
    assert!(!exists(&store, &ctx, &mut missing).await.unwrap());
}
