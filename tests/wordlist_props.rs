//! Property tests over the key/value surface.

use std::collections::HashMap;
use std::ops::ControlFlow;

use lexstore::{BackendKind, Environment, OpenMode, Tuning};
use proptest::prelude::*;
use tempfile::TempDir;

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..64)
}

fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_stored_values_survive_reopen(
        entries in proptest::collection::hash_map(arb_key(), arb_value(), 1..40)
    ) {
        let tmp = TempDir::new().unwrap();
        {
            let env = Environment::open(
                tmp.path(),
                BackendKind::SingleFileHash,
                Tuning::for_testing(),
            ).unwrap();
            let db = env.open_db("props", OpenMode::ReadWrite).unwrap();
            for (key, value) in &entries {
                db.put(key, value).unwrap();
            }
            db.close().unwrap();
            env.close().unwrap();
        }

        let env = Environment::open(
            tmp.path(),
            BackendKind::SingleFileHash,
            Tuning::for_testing(),
        ).unwrap();
        let db = env.open_db("props", OpenMode::ReadOnly).unwrap();
        for (key, value) in &entries {
            let stored = db.get(key).unwrap();
            prop_assert_eq!(stored.as_ref(), Some(value));
        }

        let mut seen = HashMap::new();
        db.for_each(|k, v| {
            seen.insert(k.to_vec(), v.to_vec());
            ControlFlow::Continue(())
        }).unwrap();
        prop_assert_eq!(seen, entries);

        db.close().unwrap();
        env.close().unwrap();
    }

    #[test]
    fn prop_last_write_wins(
        key in arb_key(),
        values in proptest::collection::vec(arb_value(), 1..10)
    ) {
        let tmp = TempDir::new().unwrap();
        let env = Environment::open(
            tmp.path(),
            BackendKind::SingleFileHash,
            Tuning::for_testing(),
        ).unwrap();
        let db = env.open_db("props", OpenMode::ReadWrite).unwrap();
        for value in &values {
            db.put(&key, value).unwrap();
        }
        let last = values.last().cloned();
        prop_assert_eq!(db.get(&key).unwrap(), last);
        db.close().unwrap();
        env.close().unwrap();
    }

    #[test]
    fn prop_deleted_keys_stay_gone(
        entries in proptest::collection::hash_map(arb_key(), arb_value(), 2..20)
    ) {
        let tmp = TempDir::new().unwrap();
        let env = Environment::open(
            tmp.path(),
            BackendKind::SingleFileHash,
            Tuning::for_testing(),
        ).unwrap();
        let db = env.open_db("props", OpenMode::ReadWrite).unwrap();
        for (key, value) in &entries {
            db.put(key, value).unwrap();
        }
        let doomed: Vec<Vec<u8>> = entries.keys().take(entries.len() / 2).cloned().collect();
        for key in &doomed {
            db.delete(key).unwrap();
        }
        for key in &doomed {
            prop_assert_eq!(db.get(key).unwrap(), None);
        }
        db.close().unwrap();
        env.close().unwrap();
    }
}
