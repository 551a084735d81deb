//! CRUD contract shared by every backend's integration test.
//!
//! Each backend seeds the same 25 chats and must answer every filter with the
//! same count, honor pagination and null ordering, and reject unscoped bulk
//! writes.

#![allow(dead_code)]

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use polystore::db::schema::chats_schema;
use polystore::db::{Dispatcher, QueryCondition, QueryOptions, Record, SortDirection};
use polystore::error::ErrorCode;

pub const CHATS: &str = "chats";
pub const SEEDED: u64 = 25;
pub const OWNER: &str = "contract-user";

fn chat(i: u64) -> Record {
    let model = match i {
        0..10 => json!("gpt-4o"),
        10..20 => json!("claude-3"),
        _ => Value::Null,
    };
    json!({
        "userId": OWNER,
        "title": format!("Chat {i}"),
        "model": model,
        "messageCount": i,
        "isPinned": i % 5 == 0,
        "metadata": { "seq": i },
    })
    .as_object()
    .cloned()
    .expect("object")
}

/// Create the chats table and insert the 25 contract rows in one batch.
pub async fn seed(db: &Dispatcher) {
    let schema = chats_schema();
    db.ensure_schema(&schema).await.expect("ensure schema");
    db.ensure_schema(&schema).await.expect("ensure schema twice");
    let records = (0..SEEDED).map(chat).collect();
    let result = db
        .insert_many(CHATS, records, Some(&schema))
        .await
        .expect("seed");
    assert_eq!(result.inserted_count, SEEDED);
}

/// Every filter shape with its expected match count on the seeded rows.
pub fn filter_cases() -> Vec<(&'static str, QueryOptions, u64)> {
    vec![
        ("eq", QueryOptions::new().where_eq("model", "gpt-4o"), 10),
        (
            "ne excludes null",
            QueryOptions::new().filter(QueryCondition::ne("model", "gpt-4o")),
            10,
        ),
        (
            "in",
            QueryOptions::new().filter(QueryCondition::in_list("model", ["gpt-4o", "claude-3"])),
            20,
        ),
        (
            "nin excludes null",
            QueryOptions::new().filter(QueryCondition::not_in("model", ["gpt-4o"])),
            10,
        ),
        (
            "empty in matches nothing",
            QueryOptions::new().filter(QueryCondition::in_list("model", Vec::<String>::new())),
            0,
        ),
        (
            "empty nin matches everything",
            QueryOptions::new().filter(QueryCondition::not_in("model", Vec::<String>::new())),
            25,
        ),
        (
            "gte",
            QueryOptions::new().filter(QueryCondition::gte("messageCount", 20)),
            5,
        ),
        (
            "lt",
            QueryOptions::new().filter(QueryCondition::lt("messageCount", 3)),
            3,
        ),
        (
            "like is case-insensitive",
            QueryOptions::new().filter(QueryCondition::like("title", "chat 2")),
            6,
        ),
        (
            "exists",
            QueryOptions::new().filter(QueryCondition::exists("model", true)),
            20,
        ),
        (
            "not exists",
            QueryOptions::new().filter(QueryCondition::exists("model", false)),
            5,
        ),
        ("boolean", QueryOptions::new().where_eq("isPinned", true), 5),
        (
            "conditions are ANDed",
            QueryOptions::new()
                .where_eq("isPinned", true)
                .filter(QueryCondition::gte("messageCount", 10)),
            3,
        ),
    ]
}

pub async fn assert_filters(db: &Dispatcher) {
    let schema = chats_schema();
    for (name, options, expected) in filter_cases() {
        let count = db.count(CHATS, &options, Some(&schema)).await.expect(name);
        assert_eq!(count, expected, "count: {name}");
        let page = db.find_many(CHATS, &options, Some(&schema)).await.expect(name);
        assert_eq!(page.total, expected, "total: {name}");
        assert_eq!(page.data.len() as u64, expected, "rows: {name}");
    }
}

pub async fn assert_pagination(db: &Dispatcher) {
    let options = QueryOptions::new()
        .order_by("messageCount", SortDirection::Asc)
        .limit(10)
        .offset(20);
    let page = db
        .find_many(CHATS, &options, Some(&chats_schema()))
        .await
        .expect("page");
    assert_eq!(page.total, SEEDED);
    let titles: Vec<_> = page.data.iter().map(|r| r["title"].clone()).collect();
    let expected: Vec<_> = (20..25).map(|i| json!(format!("Chat {i}"))).collect();
    assert_eq!(titles, expected);
}

pub async fn assert_types_and_null_ordering(db: &Dispatcher) {
    let schema = chats_schema();
    let first = db
        .find_one(
            CHATS,
            &QueryOptions::new().order_by("model", SortDirection::Asc),
            Some(&schema),
        )
        .await
        .expect("find")
        .expect("row");
    assert!(first.get("model").is_none_or(Value::is_null), "{first:?}");

    let pinned = db
        .find_one(
            CHATS,
            &QueryOptions::new().where_eq("messageCount", 5),
            Some(&schema),
        )
        .await
        .expect("find")
        .expect("row");
    assert_eq!(pinned["isPinned"], json!(true));
    assert_eq!(pinned["metadata"], json!({ "seq": 5 }));
    assert!(pinned["createdAt"].is_string());
    assert!(pinned.get("created_at").is_none());

    let projected = db
        .find_one(
            CHATS,
            &QueryOptions::new()
                .where_eq("messageCount", 7)
                .select(["title"]),
            Some(&schema),
        )
        .await
        .expect("find")
        .expect("row");
    assert_eq!(projected["title"], json!("Chat 7"));
    assert!(projected.get("metadata").is_none());
}

pub async fn assert_writes(db: &Dispatcher) {
    let schema = chats_schema();

    let err = db
        .update(CHATS, "missing-id", chat(99), Some(&schema))
        .await
        .expect_err("missing id");
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(
        db.count(CHATS, &QueryOptions::new(), Some(&schema))
            .await
            .expect("count"),
        SEEDED
    );

    let err = db
        .delete_many(CHATS, &QueryOptions::new(), Some(&schema))
        .await
        .expect_err("unscoped delete");
    assert_eq!(err.code(), ErrorCode::ValidationError);

    let partial = json!({ "isPinned": true }).as_object().cloned().expect("object");
    let updated = db
        .update_many(
            CHATS,
            partial,
            &QueryOptions::new().where_eq("model", "claude-3"),
            Some(&schema),
        )
        .await
        .expect("update_many");
    assert_eq!(updated.modified_count, 10);
    assert_eq!(
        db.count(CHATS, &QueryOptions::new().where_eq("isPinned", true), Some(&schema))
            .await
            .expect("count"),
        5 + 8
    );

    let deleted = db
        .delete_many(
            CHATS,
            &QueryOptions::new().filter(QueryCondition::exists("model", false)),
            Some(&schema),
        )
        .await
        .expect("delete_many");
    assert_eq!(deleted.deleted_count, 5);
    assert_eq!(
        db.count(CHATS, &QueryOptions::new(), Some(&schema))
            .await
            .expect("count"),
        SEEDED - 5
    );
}

const EXTRA_OWNER: &str = "contract-extra";

fn extra_chat(title: &str, metadata: Value) -> Record {
    json!({ "userId": EXTRA_OWNER, "title": title, "metadata": metadata })
        .as_object()
        .cloned()
        .expect("object")
}

/// `%`, `_` and `*` in a like needle match themselves, never any character.
pub async fn assert_like_is_literal(db: &Dispatcher) {
    let schema = chats_schema();
    let titles = ["50% off", "500 items", "a_b", "axb", "star*", "stark"];
    let records = titles.iter().map(|t| extra_chat(t, Value::Null)).collect();
    db.insert_many(CHATS, records, Some(&schema))
        .await
        .expect("insert");

    for (needle, expected) in [
        ("50%", vec!["50% off"]),
        ("%", vec!["50% off"]),
        ("a_b", vec!["a_b"]),
        ("_", vec!["a_b"]),
        ("r*", vec!["star*"]),
        ("STAR", vec!["star*", "stark"]),
    ] {
        let options = QueryOptions::new()
            .where_eq("userId", EXTRA_OWNER)
            .filter(QueryCondition::like("title", needle))
            .order_by("title", SortDirection::Asc);
        let page = db.find_many(CHATS, &options, Some(&schema)).await.expect(needle);
        let found: Vec<_> = page.data.iter().map(|r| r["title"].clone()).collect();
        let expected: Vec<_> = expected.into_iter().map(Value::from).collect();
        assert_eq!(found, expected, "like {needle:?}");
    }
}

/// JSON fields holding strings that look like other JSON come back unchanged.
pub async fn assert_json_strings_round_trip(db: &Dispatcher) {
    let schema = chats_schema();
    for metadata in [json!("123"), json!("true"), json!("plain"), json!({ "a": [1, 2] })] {
        let inserted = db
            .insert(CHATS, extra_chat("json", metadata.clone()), Some(&schema))
            .await
            .expect("insert");
        let id = inserted.inserted_id.expect("id");
        let row = db
            .find_one(CHATS, &QueryOptions::new().where_eq("id", id.as_str()), Some(&schema))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row["metadata"], metadata);
    }
}

/// Run the whole contract against a freshly attached, empty backend.
pub async fn run_contract(db: &Dispatcher) {
    seed(db).await;
    assert_filters(db).await;
    assert_pagination(db).await;
    assert_types_and_null_ordering(db).await;
    assert_writes(db).await;
    assert_like_is_literal(db).await;
    assert_json_strings_round_trip(db).await;
}
