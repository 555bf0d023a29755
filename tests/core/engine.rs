//! Core engine integration: file-backed persistence, boundary behaviors,
//! dirty-set plumbing, and the event surface.

use elemental::core::db::{Database, DbConfig, Isolation, PragmaConfig};
use elemental::core::error::{ElementalError, ErrorKind};
use elemental::core::ids;
use elemental::core::model::{
    ContentType, DocumentPayload, ElementFilter, ElementType, EntityPayload, EntityType, Payload,
    MAX_CONTENT_SIZE,
};
use elemental::core::store::{ElementPatch, NewElement, Store, UpdateOptions};
use serde_json::{json, Map};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

#[test]
fn file_backed_store_persists_across_reopen() {
    let tmp = tempdir().expect("tempdir");
    let db_path = tmp
        .path()
        .join("elemental.db")
        .to_string_lossy()
        .to_string();

    let task_id = {
        let store = Store::open(&DbConfig::file(db_path.clone())).expect("open");
        let task = store.create_task("survives restart", "el-sys").expect("create");
        task.id.into_string()
    };

    let store = Store::open(&DbConfig::file(db_path)).expect("reopen");
    let fetched = store.get(&task_id).expect("get").expect("present");
    assert_eq!(
        fetched.payload.as_task().expect("task payload").title,
        "survives restart"
    );

    let stats = store.stats().expect("stats");
    assert!(stats.wal_mode);
    assert!(stats.file_size > 0);
    assert_eq!(stats.element_count, 1);
}

#[test]
fn open_without_create_requires_existing_file() {
    let tmp = tempdir().expect("tempdir");
    let config = DbConfig {
        path: tmp.path().join("missing.db").to_string_lossy().to_string(),
        create: false,
        pragmas: PragmaConfig::default(),
    };
    let err = Store::open(&config).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DatabaseError);
}

#[test]
fn pragma_overrides_are_honored() {
    let tmp = tempdir().expect("tempdir");
    let config = DbConfig {
        path: tmp.path().join("tuned.db").to_string_lossy().to_string(),
        create: true,
        pragmas: PragmaConfig {
            journal_mode: Some("TRUNCATE".to_string()),
            synchronous: Some("FULL".to_string()),
            foreign_keys: Some(true),
            cache_size: Some(-2000),
            busy_timeout_ms: Some(1_000),
        },
    };
    let db = Database::open(&config).expect("open");
    db.migrate().expect("migrate");
    let journal: String = db
        .query_one("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap()
        .unwrap();
    assert_eq!(journal.to_lowercase(), "truncate");
    let stats = db.stats().unwrap();
    assert!(!stats.wal_mode);
}

#[test]
fn migration_is_idempotent_across_reopens() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("mig.db").to_string_lossy().to_string();
    {
        let store = Store::open(&DbConfig::file(path.clone())).unwrap();
        let report = store.migrate().unwrap();
        assert!(report.applied.is_empty(), "Store::open already migrated");
    }
    let store = Store::open(&DbConfig::file(path)).unwrap();
    let report = store.migrate().unwrap();
    assert_eq!(report.from_version, report.to_version);
}

#[test]
fn id_length_advances_across_thresholds() {
    for (count, expected) in [
        (0u64, 3usize),
        (99, 3),
        (100, 4),
        (499, 4),
        (500, 5),
        (2_999, 5),
        (3_000, 6),
        (19_999, 6),
        (20_000, 7),
        (99_999, 7),
        (100_000, 8),
    ] {
        assert_eq!(ids::length_for_count(count), expected, "count {count}");
    }
}

#[test]
fn hierarchical_depth_cap_enforced() {
    let parsed = ids::parse("el-abc.1.2.3").expect("depth three is legal");
    assert_eq!(parsed.depth, 3);
    let err = ids::parse("el-abc.1.2.3.4").unwrap_err();
    assert_eq!(err.kind, ErrorKind::MaxDepthExceeded);
    let err = ids::child_of("el-abc.1.2.3", 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::MaxDepthExceeded);
}

#[test]
fn document_content_boundary_at_max_size() {
    let store = Store::open_in_memory().unwrap();
    let at_limit = "x".repeat(MAX_CONTENT_SIZE);
    let doc = store
        .create(NewElement::new(
            "el-sys",
            Payload::Document(DocumentPayload {
                content_type: ContentType::Text,
                content: at_limit,
                version: 1,
                previous_version_id: None,
            }),
        ))
        .expect("content at the limit is accepted");

    let over_limit = "x".repeat(MAX_CONTENT_SIZE + 1);
    let mut patch = Map::new();
    patch.insert("content".to_string(), json!(over_limit));
    let err = store
        .update(
            doc.id.as_str(),
            ElementPatch {
                payload: Some(patch),
                ..Default::default()
            },
            UpdateOptions::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[test]
fn entity_name_boundaries() {
    let store = Store::open_in_memory().unwrap();
    let create_entity = |name: &str| -> Result<_, ElementalError> {
        store.create(NewElement::new(
            "el-sys",
            Payload::Entity(EntityPayload {
                name: name.to_string(),
                entity_type: EntityType::Agent,
                public_key: None,
            }),
        ))
    };

    assert!(create_entity("builder-7").is_ok());
    for bad in ["system", "anonymous", "unknown", "7agent", "_lead", ""] {
        let err = create_entity(bad).unwrap_err();
        assert!(
            matches!(err.kind, ErrorKind::Validation | ErrorKind::MissingRequiredField),
            "expected rejection for {bad:?}"
        );
    }
}

#[test]
fn dirty_set_tracks_mutations_for_sync() {
    let store = Store::open_in_memory().unwrap();
    let a = store.create_task("a", "el-sys").unwrap();
    let b = store.create_task("b", "el-sys").unwrap();

    let mut dirty = store.get_dirty().unwrap();
    dirty.sort();
    let mut expected = vec![a.id.as_str().to_string(), b.id.as_str().to_string()];
    expected.sort();
    assert_eq!(dirty, expected);

    let cleared = store.clear_dirty(&[a.id.as_str().to_string()]).unwrap();
    assert_eq!(cleared, 1);
    assert_eq!(store.get_dirty().unwrap(), vec![b.id.as_str().to_string()]);

    store.clear_all_dirty().unwrap();
    let mut patch = Map::new();
    patch.insert("priority".to_string(), json!(1));
    store
        .update(
            b.id.as_str(),
            ElementPatch {
                payload: Some(patch),
                ..Default::default()
            },
            UpdateOptions::default(),
        )
        .unwrap();
    assert_eq!(store.get_dirty().unwrap(), vec![b.id.as_str().to_string()]);
}

#[test]
fn child_counter_round_trip_through_db() {
    let db = Database::open_in_memory().unwrap();
    for expected in 1..=10 {
        assert_eq!(db.next_child("el-parent").unwrap(), expected);
    }
    assert_eq!(db.peek_child("el-parent").unwrap(), 10);
    db.reset_child("el-parent").unwrap();
    assert_eq!(db.peek_child("el-parent").unwrap(), 0);
}

#[test]
fn savepoints_nest_inside_store_transactions() {
    let db = Database::open_in_memory().unwrap();
    let outcome: Result<(), ElementalError> = db.transaction(Isolation::Immediate, |db| {
        db.run(
            "INSERT INTO elements(id, type, created_at, updated_at, payload)
             VALUES ('el-keep', 'task', 't0', 't0', json_object('title','k','status','open'))",
            [],
        )?;
        let inner: Result<(), ElementalError> = db.transaction(Isolation::Deferred, |db| {
            db.run(
                "INSERT INTO elements(id, type, created_at, updated_at, payload)
                 VALUES ('el-drop', 'task', 't0', 't0', json_object('title','d','status','open'))",
                [],
            )?;
            let nested: Result<(), ElementalError> =
                db.transaction(Isolation::Deferred, |_| {
                    Err(ElementalError::validation("deepest scope aborts"))
                });
            assert!(nested.is_err());
            Err(ElementalError::validation("middle scope aborts too"))
        });
        assert!(inner.is_err());
        Ok(())
    });
    outcome.unwrap();

    let survivors: Vec<String> = db
        .query("SELECT id FROM elements ORDER BY id", [], |row| row.get(0))
        .unwrap();
    assert_eq!(survivors, vec!["el-keep".to_string()]);
}

#[test]
fn unsubscribed_listener_stops_receiving() {
    let store = Store::open_in_memory().unwrap();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let id = {
        let seen = Arc::clone(&seen);
        store
            .subscribe(move |event| seen.lock().unwrap().push(event.name().to_string()))
            .unwrap()
    };
    store.create_task("one", "el-sys").unwrap();
    assert!(store.unsubscribe(id).unwrap());
    store.create_task("two", "el-sys").unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["element.created".to_string()]);
}

#[test]
fn error_json_is_transport_ready() {
    let store = Store::open_in_memory().unwrap();
    let err = store.get_workflow_progress("el-absent").unwrap_err();
    let body = err.to_json();
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["httpStatus"], 404);
    assert!(body["message"].as_str().unwrap().contains("el-absent"));
}

#[test]
fn list_pagination_windows() {
    let store = Store::open_in_memory().unwrap();
    for n in 0..7 {
        store.create_task(&format!("task {n}"), "el-sys").unwrap();
    }
    let filter = ElementFilter {
        element_type: Some(ElementType::Task),
        limit: Some(3),
        offset: Some(3),
        ..Default::default()
    };
    let page = store.list_paginated(&filter).unwrap();
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.total, 7);
    assert_eq!(page.offset, 3);

    let tail = store
        .list(&ElementFilter {
            element_type: Some(ElementType::Task),
            limit: Some(10),
            offset: Some(6),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(tail.len(), 1);
}
