//! Integration tests for projection updates.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use strata::{
    Aggregate, Columns, Command, Event, EventType, SearchQueryBuilder, View, ViewAction, ViewError,
    ViewMeta,
    store::{Context, Eventstore, NonEmpty, inmemory},
};

/// Membership of one user in one organisation.
#[derive(Debug, Clone, Default, PartialEq)]
struct OrgMemberView {
    meta: ViewMeta,
    org_id: String,
    user_id: String,
    roles: Vec<String>,
}

#[derive(Deserialize)]
struct MemberPatch {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    roles: Option<Vec<String>>,
}

impl View for OrgMemberView {
    type Patch = MemberPatch;

    fn meta(&self) -> &ViewMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ViewMeta {
        &mut self.meta
    }

    fn action(&self, event_type: &EventType) -> ViewAction {
        match event_type.as_str() {
            "org.member.added" => ViewAction::Create,
            "org.member.changed" => ViewAction::Change,
            _ => ViewAction::Ignore,
        }
    }

    fn bind_root(&mut self, event: &Event) {
        self.org_id.clone_from(&event.aggregate.id);
    }

    fn apply_patch(&mut self, patch: Self::Patch) {
        if let Some(user_id) = patch.user_id {
            self.user_id = user_id;
        }
        if let Some(roles) = patch.roles {
            self.roles = roles;
        }
    }
}

/// In-memory store whose clock advances one minute per push.
fn ticking_store() -> inmemory::Store {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap().timestamp();
    let tick = Arc::new(AtomicI64::new(0));
    inmemory::Store::with_clock(Arc::new(move || {
        let minutes = tick.fetch_add(1, Ordering::Relaxed);
        DateTime::from_timestamp(start + minutes * 60, 0).unwrap_or_default()
    }))
}

fn member_command(event_type: &str, payload: &serde_json::Value) -> Command {
    Command::new(Aggregate::new("org", "org-1").owned_by("org-1"), event_type)
        .with_payload(payload)
        .unwrap()
}

async fn push(store: &inmemory::Store, command: Command) -> Event {
    store
        .push(&Context::new(), NonEmpty::new(command))
        .await
        .unwrap()
        .remove(0)
}

#[tokio::test]
async fn view_follows_member_lifecycle() {
    let store = ticking_store();
    push(
        &store,
        member_command(
            "org.member.added",
            &json!({ "userId": "user-1", "roles": ["ORG_OWNER"] }),
        ),
    )
    .await;
    push(&store, member_command("org.changed", &json!({ "name": "ACME" }))).await;
    let changed = push(
        &store,
        member_command(
            "org.member.changed",
            &json!({ "userId": "user-1", "roles": ["ORG_OWNER", "ORG_ADMIN"] }),
        ),
    )
    .await;

    let query = SearchQueryBuilder::new(Columns::Event)
        .add_query()
        .aggregate_types(["org"])
        .aggregate_ids(["org-1"])
        .build();
    let events = store.filter(&Context::new(), &query).await.unwrap();

    let mut view = OrgMemberView::default();
    view.append_events(&events).unwrap();

    assert_eq!(view.org_id, "org-1");
    assert_eq!(view.user_id, "user-1");
    assert_eq!(view.roles, ["ORG_OWNER", "ORG_ADMIN"]);
    assert_eq!(view.meta.sequence, 3);
    assert_eq!(view.meta.creation_date, Some(events[0].creation_date));
    assert_eq!(view.meta.change_date, Some(changed.creation_date));
    assert!(events[0].creation_date < changed.creation_date);
}

#[tokio::test]
async fn unrelated_events_only_advance_the_watermark() {
    let store = ticking_store();
    let added = push(
        &store,
        member_command("org.member.added", &json!({ "userId": "user-1" })),
    )
    .await;
    let renamed = push(&store, member_command("org.changed", &json!({ "name": "ACME" }))).await;

    let mut view = OrgMemberView::default();
    view.append_event(&added).unwrap();
    let before = view.clone();
    view.append_event(&renamed).unwrap();

    assert_eq!(view.meta.sequence, renamed.sequence);
    assert_eq!(view.meta.change_date, Some(renamed.creation_date));
    assert_eq!(view.meta.creation_date, before.meta.creation_date);
    assert_eq!(view.user_id, before.user_id);
}

#[tokio::test]
async fn watermark_advances_when_payload_cannot_be_decoded() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let store = ticking_store();
    let added = push(
        &store,
        member_command(
            "org.member.added",
            &json!({ "userId": "user-1", "roles": ["ORG_OWNER"] }),
        ),
    )
    .await;
    let broken = push(
        &store,
        member_command("org.member.changed", &json!("not-an-object")),
    )
    .await;

    let mut view = OrgMemberView::default();
    view.append_event(&added).unwrap();
    let error = view.append_event(&broken).unwrap_err();

    assert!(matches!(error, ViewError::Decode(_)));
    assert_eq!(view.meta.sequence, broken.sequence);
    assert_eq!(view.meta.change_date, Some(broken.creation_date));
    assert_eq!(view.user_id, "user-1");
    assert_eq!(view.roles, ["ORG_OWNER"]);
}

#[tokio::test]
async fn replayed_batches_are_rejected_before_applying() {
    let store = ticking_store();
    let added = push(
        &store,
        member_command("org.member.added", &json!({ "userId": "user-1" })),
    )
    .await;
    let changed = push(
        &store,
        member_command("org.member.changed", &json!({ "roles": ["ORG_ADMIN"] })),
    )
    .await;

    let mut view = OrgMemberView::default();
    view.append_events(std::slice::from_ref(&added)).unwrap();
    let caught_up = view.clone();

    let error = view
        .append_events(&[changed.clone(), added])
        .unwrap_err();

    assert!(matches!(
        error,
        ViewError::OutOfOrder {
            current: 2,
            sequence: 1
        }
    ));
    assert_eq!(view, caught_up);

    view.append_events(&[changed]).unwrap();
    assert_eq!(view.roles, ["ORG_ADMIN"]);
}
