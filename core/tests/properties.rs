use proptest::prelude::*;
use scribe_core::document::Key;
use scribe_core::query::QuerySpec;
use scribe_core::store::{FormatTarget, Store, StoreOptions};
use serde_json::{json, Value};

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9_ ]{0,16}".prop_map(Value::String),
    ]
}

fn arb_doc(id: String) -> impl Strategy<Value = Value> {
    (arb_scalar(), arb_scalar(), "[a-zA-Z0-9_.: ]{0,24}").prop_map(move |(a, b, text)| {
        json!({
            "type": "item",
            "id": id,
            "a": a,
            "b": b,
            "text": text,
        })
    })
}

proptest! {
    /// `canonicalize(parse(canonicalize(d))) == canonicalize(d)` -- a document
    /// that survives a round trip through the store comes back byte-identical.
    #[test]
    fn put_get_round_trip_is_stable(id in "[a-z][a-z0-9]{0,8}", doc in arb_doc("placeholder".into())) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreOptions::new(dir.path())).unwrap();
        let mut doc = doc;
        doc["id"] = json!(id.clone());
        let key = Key::new("item", id);

        store.put(&key, &doc).unwrap();
        let first = store.get(&key).unwrap().unwrap();
        store.put(&key, &first).unwrap();
        let second = store.get(&key).unwrap().unwrap();
        prop_assert_eq!(first, second);
    }

    /// Repeated `format` calls on the same corpus change nothing after the
    /// first pass.
    #[test]
    fn format_converges_after_one_pass(ids in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..6)) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreOptions::new(dir.path())).unwrap();
        for id in &ids {
            store.put(&Key::new("item", id.clone()), &json!({"type": "item", "id": id, "n": 1})).unwrap();
        }
        let first = store.format(FormatTarget::All, false, false).unwrap();
        prop_assert_eq!(first.changed, 0, "puts already write canonical form");
        let second = store.format(FormatTarget::All, false, false).unwrap();
        prop_assert_eq!(second.changed, 0);
    }

    /// `ensureIndex` is idempotent: calling it twice in a row over the same
    /// corpus produces the same postings as calling it once.
    #[test]
    fn ensure_index_is_idempotent(values in prop::collection::vec(arb_scalar(), 1..12)) {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StoreOptions::new(dir.path());
        options.enable_indexes = true;
        let store = Store::open(options).unwrap();

        for (i, v) in values.iter().enumerate() {
            let id = format!("i{i}");
            store.put(&Key::new("item", id.clone()), &json!({"type": "item", "id": id, "v": v})).unwrap();
        }
        store.ensure_index("item", "v").unwrap();
        let query_for = |store: &Store, v: &Value| -> Vec<String> {
            let spec = QuerySpec {
                r#type: Some("item".into()),
                filter: json!({"v": {"$eq": v}}),
                ..Default::default()
            };
            let mut ids: Vec<String> = store
                .query(spec)
                .unwrap()
                .iter()
                .map(|d| d["id"].as_str().unwrap().to_string())
                .collect();
            ids.sort();
            ids
        };
        let before: Vec<Vec<String>> = values.iter().map(|v| query_for(&store, v)).collect();
        store.ensure_index("item", "v").unwrap();
        let after: Vec<Vec<String>> = values.iter().map(|v| query_for(&store, v)).collect();
        prop_assert_eq!(before, after);

        let report = store.verify().unwrap();
        prop_assert!(report.index_mismatches.is_empty());
    }
}
