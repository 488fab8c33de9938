use std::fs;

use scribe_core::document::Key;
use scribe_core::query::{Projection, QuerySpec};
use scribe_core::store::{FormatTarget, Store, StoreOptions};
use serde_json::json;

fn open(dir: &std::path::Path) -> Store {
    Store::open(StoreOptions::new(dir)).unwrap()
}

#[test]
fn crud_round_trip_with_write_suppression() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let key = Key::new("task", "1");
    let doc = json!({"type": "task", "id": "1", "title": "A"});

    store.put(&key, &doc).unwrap();
    assert_eq!(store.get(&key).unwrap(), Some(doc.clone()));

    let path = dir.path().join("task").join("1.json");
    let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();
    store.put(&key, &doc).unwrap();
    let mtime_after = fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(mtime_before, mtime_after, "identical put must not rewrite the file");

    store.remove(&key).unwrap();
    assert_eq!(store.get(&key).unwrap(), None);
    store.remove(&key).unwrap();
}

#[test]
fn canonicalization_sorts_keys_and_uses_two_space_indent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    let key = Key::new("task", "1");
    let doc = json!({"z": 1, "type": "task", "a": 2, "id": "1", "m": 3});
    store.put(&key, &doc).unwrap();

    let path = dir.path().join("task").join("1.json");
    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(
        text,
        "{\n  \"a\": 2,\n  \"id\": \"1\",\n  \"m\": 3,\n  \"type\": \"task\",\n  \"z\": 1\n}\n"
    );

    // Reading and rewriting the same document must be byte-identical.
    store.put(&key, &doc).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), text);
}

#[test]
fn index_correctness_tracks_updates_and_removals() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = StoreOptions::new(dir.path());
    options.enable_indexes = true;
    let store = Store::open(options).unwrap();

    store
        .put(&Key::new("task", "t1"), &json!({"type": "task", "id": "t1", "status": "open"}))
        .unwrap();
    store
        .put(&Key::new("task", "t2"), &json!({"type": "task", "id": "t2", "status": "closed"}))
        .unwrap();
    store
        .put(&Key::new("task", "t3"), &json!({"type": "task", "id": "t3", "status": "open"}))
        .unwrap();
    store.ensure_index("task", "status").unwrap();

    let open_spec = QuerySpec {
        r#type: Some("task".into()),
        filter: json!({"status": {"$eq": "open"}}),
        ..Default::default()
    };
    let mut ids: Vec<String> = store
        .query(open_spec.clone())
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["t1".to_string(), "t3".to_string()]);

    store
        .put(&Key::new("task", "t1"), &json!({"type": "task", "id": "t1", "status": "closed"}))
        .unwrap();
    let ids: Vec<String> = store
        .query(open_spec)
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["t3".to_string()]);

    store.remove(&Key::new("task", "t2")).unwrap();
    let closed_spec = QuerySpec {
        r#type: Some("task".into()),
        filter: json!({"status": {"$eq": "closed"}}),
        ..Default::default()
    };
    let ids: Vec<String> = store
        .query(closed_spec)
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["t1".to_string()]);
}

#[test]
fn path_escape_rejected_without_touching_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());

    let bad_type = Key::new("..", "x");
    assert!(store.put(&bad_type, &json!({"type": "..", "id": "x"})).is_err());

    let bad_id = Key::new("task", "../../etc/passwd");
    assert!(store.put(&bad_id, &json!({"type": "task", "id": "../../etc/passwd"})).is_err());

    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert!(entries.is_empty(), "a rejected write must not create anything under root");
}

#[cfg(unix)]
#[test]
fn symlinked_type_directory_is_rejected() {
    use std::os::unix::fs::symlink;

    let dir = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    symlink(outside.path(), dir.path().join("task")).unwrap();

    let store = open(dir.path());
    assert!(store.list("task").is_err());
    assert!(store.get(&Key::new("task", "1")).is_err());
    assert!(fs::read_dir(outside.path()).unwrap().count() == 0);
}

#[test]
fn sidecar_directory_transaction_is_all_or_nothing_on_commit_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = StoreOptions::new(dir.path());
    options.sidecar_types.insert("project".to_string());
    let store = Store::open(options).unwrap();

    let key = Key::new("project", "p1");
    let doc = json!({"type": "project", "id": "p1", "md": {"summary": "summary.md", "history": "history.md"}});
    store
        .put_with_attachments(
            &key,
            &doc,
            &[
                ("summary.md".to_string(), "initial summary".to_string()),
                ("history.md".to_string(), "initial history".to_string()),
            ],
        )
        .unwrap();

    assert_eq!(store.get(&key).unwrap(), Some(doc));
    assert_eq!(store.read_attachment(&key, "summary").unwrap(), "initial summary");
    assert_eq!(store.read_attachment(&key, "history").unwrap(), "initial history");

    let project_dir = dir.path().join("project").join("p1");
    let leftovers: Vec<_> = fs::read_dir(project_dir.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let n = e.file_name().to_string_lossy().into_owned();
            n.contains(".staging.") || n.contains(".bak.")
        })
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn query_pipeline_sorts_skips_and_limits_across_full_scan() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    for p in 1..=20 {
        store
            .put(&Key::new("item", format!("i{p}")), &json!({"type": "item", "id": format!("i{p}"), "priority": p}))
            .unwrap();
    }

    let spec = QuerySpec {
        r#type: Some("item".into()),
        filter: json!({}),
        sort: vec![("priority".into(), -1)],
        skip: 3,
        limit: Some(4),
        projection: Projection::None,
    };
    let results = store.query(spec).unwrap();
    let priorities: Vec<i64> = results.iter().map(|d| d["priority"].as_i64().unwrap()).collect();
    assert_eq!(priorities, vec![17, 16, 15, 14]);
}

#[test]
fn format_is_idempotent_on_a_canonical_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    for id in ["1", "2", "3"] {
        store
            .put(&Key::new("task", id), &json!({"type": "task", "id": id, "z": 1, "a": 2}))
            .unwrap();
    }
    let first = store.format(FormatTarget::All, false, false).unwrap();
    assert_eq!(first.changed, 0, "already-canonical corpus should not change anything");
    let second = store.format(FormatTarget::All, false, false).unwrap();
    assert_eq!(second.changed, 0);
}

#[test]
fn verify_reports_no_drift_or_mismatches_on_a_healthy_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = StoreOptions::new(dir.path());
    options.enable_indexes = true;
    let store = Store::open(options).unwrap();
    store
        .put(&Key::new("task", "1"), &json!({"type": "task", "id": "1", "status": "open"}))
        .unwrap();
    store.ensure_index("task", "status").unwrap();

    let report = store.verify().unwrap();
    assert_eq!(report.format_drift, 0);
    assert!(report.parse_failures.is_empty());
    assert!(report.index_mismatches.is_empty());
}
