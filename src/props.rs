use crate::kv::Kv;
use crate::path::Path;
use crate::tree::TreeStore;
use crate::value::Value;
use proptest::prelude::*;

pub fn arb_primitive() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::Number(n as f64)),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

pub fn arb_value() -> impl Strategy<Value = Value> {
    arb_primitive().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z0-9]{1,8}", inner, 0..4).prop_map(Value::Object),
        ]
    })
}

pub fn arb_path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,5}", 1..4).prop_map(|segs| format!("/{}", segs.join("/")))
}

fn store() -> TreeStore {
    let db = sled::Config::new().temporary(true).open().unwrap();
    TreeStore::new(Kv::new(db.open_tree("state").unwrap()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn leaf_encoding_round_trips(n in any::<f64>(), s in "\\PC*", b in any::<bool>()) {
        for v in [Value::Number(n), Value::String(s), Value::Bool(b), Value::Null] {
            let decoded = Value::decode_leaf(&v.encode_leaf()).unwrap();
            prop_assert_eq!(decoded, v);
        }
    }

    #[test]
    fn json_round_trips(v in arb_value()) {
        let back = Value::from_json(&v.to_json()).unwrap();
        prop_assert_eq!(back, v);
    }

    #[test]
    fn set_then_get_returns_the_value(path in arb_path(), v in arb_value()) {
        let store = store();
        let path = Path::normalize(&path).unwrap();
        store.set(path, &v).unwrap();
        prop_assert_eq!(store.get(path).unwrap(), v);
    }

    #[test]
    fn last_write_wins(path in arb_path(), writes in prop::collection::vec(arb_value(), 1..6)) {
        let store = store();
        let path = Path::normalize(&path).unwrap();
        for v in &writes {
            store.set(path, v).unwrap();
        }
        prop_assert_eq!(&store.get(path).unwrap(), writes.last().unwrap());
    }

    #[test]
    fn delete_removes_every_descendant(path in arb_path(), v in arb_value()) {
        let store = store();
        let path = Path::normalize(&path).unwrap();
        store.set(path, &v).unwrap();
        store.delete(path).unwrap();
        prop_assert!(store.get_opt(path).unwrap().is_none());
        if let Some(parent) = path.parent() {
            // the parent may survive as a stale branch, but the
            // deleted child must not reappear in it
            if let Some(Value::Object(map)) = store.get_opt(parent).unwrap() {
                prop_assert!(!map.contains_key(path.last().unwrap()));
            }
        }
    }
}
