//! End-to-end scenario tests exercising `Database` the way an application
//! would: across process restarts, under index constraints, and at scale.

use monodb::{Database, Document, Value};
use rand::RngCore;
use tempfile::tempdir;

#[test]
fn basic_insert_find_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.mono");

    {
        let mut db = Database::open(&path).unwrap();
        db.create_collection("users").unwrap();
        let mut doc = Document::new();
        doc.insert("name", Value::String("Alice".into()));
        doc.insert("age", Value::Int32(30));
        db.insert("users", doc).unwrap();
        db.flush().unwrap();
    }

    let mut db = Database::open(&path).unwrap();
    let found = db
        .find_one("users", |d| d.get("name") == Some(&Value::String("Alice".into())))
        .unwrap()
        .unwrap();
    assert_eq!(found.get("age"), Some(&Value::Int32(30)));
}

#[test]
fn unique_index_rejects_duplicate_key_and_preserves_count() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("db.mono")).unwrap();
    db.create_collection("users").unwrap();

    for i in 0..1000 {
        let mut doc = Document::new();
        doc.insert("_id", Value::Int64(i));
        doc.insert("k", Value::String(format!("key_{i}")));
        db.insert("users", doc).unwrap();
    }
    db.create_index("users", "by_k", vec![("k".to_string(), 1)], true).unwrap();

    let mut dup = Document::new();
    dup.insert("_id", Value::Int64(1001));
    dup.insert("k", Value::String("key_42".to_string()));
    let err = db.insert("users", dup).unwrap_err();
    assert!(matches!(err, monodb::Error::DuplicateKey { .. }));
    assert_eq!(db.count("users", |_| true).unwrap(), 1000);
}

/// `Database::insert` writes through synchronously (`Pager::write_page` is
/// WAL-append, fsync, data write, fsync, checkpoint per call) — there's no
/// public batch boundary to crash inside. This exercises the resulting
/// guarantee directly: dropping the handle without an explicit final
/// `flush`/`close` loses nothing, because every insert that already
/// returned `Ok` was durable the moment it returned. The lower-level
/// WAL-sync-but-no-checkpoint crash window itself is covered by
/// `pager::tests::recovery_replays_uncheckpointed_writes`.
#[test]
fn every_insert_that_returns_ok_survives_an_unclean_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.mono");

    {
        let mut db = Database::open(&path).unwrap();
        db.create_collection("events").unwrap();
        for i in 0..100 {
            let mut doc = Document::new();
            doc.insert("i", Value::Int32(i));
            db.insert("events", doc).unwrap();
        }
        // No explicit flush/close: the handle is simply dropped here.
    }

    let mut db = Database::open(&path).unwrap();
    assert_eq!(db.count("events", |_| true).unwrap(), 100);
    for i in 0..100 {
        assert!(db.find_one("events", |d| d.get("i") == Some(&Value::Int32(i))).unwrap().is_some());
    }
}

#[test]
fn update_with_set_reports_matched_and_modified_counts() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("db.mono")).unwrap();
    db.create_collection("users").unwrap();

    let mut doc = Document::new();
    doc.insert("x", Value::Int32(5));
    doc.insert("y", Value::Int32(10));
    db.insert("users", doc).unwrap();

    let matched = db.count("users", |d| d.get("x") == Some(&Value::Int32(5))).unwrap();
    let modified = db
        .update(
            "users",
            |d| d.get("x") == Some(&Value::Int32(5)),
            |d| d.insert("y", Value::Int32(20)),
        )
        .unwrap();

    assert_eq!(matched, 1);
    assert_eq!(modified, 1);
    let found = db.find_one("users", |d| d.get("x") == Some(&Value::Int32(5))).unwrap().unwrap();
    assert_eq!(found.get("y"), Some(&Value::Int32(20)));
}

#[test]
fn non_unique_index_range_scan_and_delete_stays_internally_consistent() {
    let dir = tempdir().unwrap();
    let mut db = Database::open(dir.path().join("db.mono")).unwrap();
    db.create_collection("events").unwrap();
    db.create_index("events", "by_key", vec![("key".to_string(), 1)], false).unwrap();

    let mut rng = rand::thread_rng();
    let mut keys: Vec<[u8; 16]> = Vec::with_capacity(10_000);
    for i in 0..10_000u32 {
        let mut key = [0u8; 16];
        rng.fill_bytes(&mut key);
        keys.push(key);
        let mut doc = Document::new();
        doc.insert("_id", Value::Int64(i as i64));
        doc.insert("key", Value::Binary(0, key.to_vec()));
        db.insert("events", doc).unwrap();
    }

    let mut sorted_keys = keys.clone();
    sorted_keys.sort();
    let lo = sorted_keys[2_500];
    let hi = sorted_keys[7_500];
    let lo_prefixed = Value::Binary(0, lo.to_vec()).encode_sort_key();
    let hi_prefixed = Value::Binary(0, hi.to_vec()).encode_sort_key();
    let in_range = db
        .index_range("events", "by_key", Some(lo_prefixed.as_slice()), Some(hi_prefixed.as_slice()), None)
        .unwrap();
    assert!(!in_range.is_empty());
    assert!(in_range.len() < 10_000);

    let to_delete: std::collections::HashSet<_> = keys[..5_000].iter().cloned().collect();
    db.delete("events", move |d| match d.get("key") {
        Some(Value::Binary(_, bytes)) => {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(bytes);
            to_delete.contains(&arr)
        }
        _ => false,
    })
    .unwrap();

    assert_eq!(db.count("events", |_| true).unwrap(), 5_000);
    db.verify().unwrap();
}

#[test]
fn multi_page_catalog_recovers_every_collection_and_index_identically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.mono");

    {
        let mut db = Database::open(&path).unwrap();
        for c in 0..200 {
            let name = format!("collection_{c}");
            db.create_collection(&name).unwrap();
            for i in 0..5 {
                db.create_index(&name, &format!("idx_{i}"), vec![(format!("field_{i}"), 1)], false)
                    .unwrap();
            }
        }
        db.flush().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let names = db.collection_names();
    assert_eq!(names.len(), 200);
    for c in 0..200 {
        assert!(names.contains(&format!("collection_{c}").as_str()));
    }
}
