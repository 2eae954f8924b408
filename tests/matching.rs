//! Integration tests for in-memory query matching.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use strata::{Aggregate, Columns, Command, EventDataFilter, SearchQueryBuilder};

fn command(aggregate_type: &str, id: &str, event_type: &str) -> Command {
    Command::new(Aggregate::new(aggregate_type, id), event_type)
}

fn ids<'a>(matched: &[&'a Command]) -> Vec<&'a str> {
    matched.iter().map(|c| c.aggregate.id.as_str()).collect()
}

#[test]
fn sub_queries_are_or_connected_and_fields_and_connected() {
    let query = SearchQueryBuilder::new(Columns::Event)
        .add_query()
        .aggregate_types(["org"])
        .event_types(["org.added"])
        .or()
        .aggregate_types(["user"])
        .aggregate_ids(["u-1"])
        .build();

    let commands = [
        command("org", "first-branch", "org.added"),
        command("user", "u-1", "user.added"),
        command("org", "partial", "org.changed"),
        command("user", "u-2", "user.added"),
        command("project", "neither", "project.added"),
    ];

    assert_eq!(ids(&query.matches(&commands)), ["first-branch", "u-1"]);
}

#[test]
fn no_sub_queries_match_everything() {
    let query = SearchQueryBuilder::new(Columns::Event).build();
    let commands = [
        command("org", "a", "org.added"),
        command("user", "b", "user.added"),
    ];

    assert_eq!(query.matches(&commands).len(), 2);
}

#[test]
fn zero_creation_dates_leave_the_filter_unset() {
    let year_one = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
    let query = SearchQueryBuilder::new(Columns::Event)
        .creation_date_after(DateTime::<Utc>::UNIX_EPOCH)
        .creation_date_before(year_one)
        .build();

    assert_eq!(query.creation_date_after(), None);
    assert_eq!(query.creation_date_before(), None);
    assert_eq!(
        query.matches(&[command("org", "a", "org.added")]).len(),
        1
    );
}

#[test]
fn offset_and_limit_apply_after_filtering() {
    let query = SearchQueryBuilder::new(Columns::Event)
        .offset(1)
        .limit(2)
        .sequence_greater(0)
        .add_query()
        .aggregate_types(["T"])
        .build();

    let commands = [
        command("T", "A", "t.added").expect_sequence(1),
        command("other", "x", "t.added").expect_sequence(1),
        command("T", "B", "t.added").expect_sequence(2),
        command("T", "C", "t.added").expect_sequence(3),
    ];

    assert_eq!(ids(&query.matches(&commands)), ["B", "C"]);
}

#[test]
fn sequence_filter_is_strict_and_skips_candidates_without_sequence() {
    let query = SearchQueryBuilder::new(Columns::Event)
        .sequence_greater(2)
        .build();

    let commands = [
        command("org", "at", "org.changed").expect_sequence(2),
        command("org", "after", "org.changed").expect_sequence(3),
        command("org", "unknown", "org.changed"),
    ];

    assert_eq!(ids(&query.matches(&commands)), ["after", "unknown"]);
}

#[test]
fn tenant_less_commands_bypass_instance_filter() {
    let query = SearchQueryBuilder::new(Columns::Event)
        .instance_id("tenant-x")
        .build();

    let tenant_less = command("org", "a", "org.added");
    let other_tenant = Command::new(
        Aggregate::new("org", "b").in_instance("tenant-y"),
        "org.added",
    );
    let same_tenant = Command::new(
        Aggregate::new("org", "c").in_instance("tenant-x"),
        "org.added",
    );

    assert!(query.matches_candidate(&tenant_less));
    assert!(!query.matches_candidate(&other_tenant));
    assert!(query.matches_candidate(&same_tenant));
}

#[test]
fn resource_owner_must_match_exactly() {
    let query = SearchQueryBuilder::new(Columns::Event)
        .resource_owner("org-1")
        .build();

    let owned = Command::new(Aggregate::new("project", "p").owned_by("org-1"), "project.added");
    let foreign = Command::new(Aggregate::new("project", "q").owned_by("org-2"), "project.added");

    assert!(query.matches_candidate(&owned));
    assert!(!query.matches_candidate(&foreign));
}

#[test]
fn event_data_filter_compares_top_level_keys() {
    let query = SearchQueryBuilder::new(Columns::Event)
        .add_query()
        .event_types(["key_pair.added"])
        .event_data(EventDataFilter::new().field("usage", 0).field("algorithm", "rsa"))
        .build();

    let signing = command("key_pair", "kp-1", "key_pair.added")
        .with_payload(&json!({ "usage": 0, "algorithm": "rsa", "expiry": "2030-01-01" }))
        .unwrap();
    let encryption = command("key_pair", "kp-2", "key_pair.added")
        .with_payload(&json!({ "usage": 1, "algorithm": "rsa" }))
        .unwrap();
    let without_payload = command("key_pair", "kp-3", "key_pair.added");

    assert!(query.matches_candidate(&signing));
    assert!(!query.matches_candidate(&encryption));
    assert!(!query.matches_candidate(&without_payload));
}

#[test]
fn out_of_range_columns_are_rejected() {
    assert!(Columns::validate(0).is_err());
    assert!(Columns::validate(4).is_err());
    assert_eq!(Columns::validate(2).unwrap(), Columns::MaxSequence);
}
