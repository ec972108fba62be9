use std::collections::BTreeMap;

use lumokv::{Database, DbFlags, EnvOptions, Environment, Error, WriteFlags};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
    Commit,
    Abort,
}

fn key() -> impl Strategy<Value = Vec<u8>> {
    // Small alphabet so that deletes and overwrites hit existing keys
    prop::collection::vec(0u8..8, 1..6)
}

fn value() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        8 => prop::collection::vec(any::<u8>(), 0..64),
        1 => prop::collection::vec(any::<u8>(), 2000..6000),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (key(), value()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => key().prop_map(Op::Del),
        1 => Just(Op::Commit),
        1 => Just(Op::Abort),
    ]
}

fn check(env: &Environment, db: Database, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let txn = env.begin_ro_txn().unwrap();
    let stored: Vec<(Vec<u8>, Vec<u8>)> = db
        .iter(&txn)
        .unwrap()
        .map(|item| {
            let (k, v) = item.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(stored, expected);
    assert_eq!(db.stat(&txn).unwrap().entries, model.len() as u64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn matches_ordered_map(ops in prop::collection::vec(op(), 1..300)) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), EnvOptions::new().map_size(32 << 20)).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut committed = BTreeMap::new();
        let mut pending = committed.clone();
        let mut txn = env.begin_txn().unwrap();
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    db.put(&mut txn, &k, &v, WriteFlags::empty()).unwrap();
                    pending.insert(k, v);
                }
                Op::Del(k) => {
                    let res = db.del(&mut txn, &k, None);
                    match pending.remove(&k) {
                        Some(_) => prop_assert!(res.is_ok()),
                        None => prop_assert!(matches!(res, Err(Error::NotFound))),
                    }
                }
                Op::Commit => {
                    txn.commit().unwrap();
                    committed = pending.clone();
                    check(&env, db, &committed);
                    txn = env.begin_txn().unwrap();
                }
                Op::Abort => {
                    txn.abort();
                    pending = committed.clone();
                    check(&env, db, &committed);
                    txn = env.begin_txn().unwrap();
                }
            }
        }
        txn.commit().unwrap();
        check(&env, db, &pending);

        // Everything written is readable after reopening
        drop(env);
        let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
        check(&env, db, &pending);
    }

    #[test]
    fn dupsort_matches_ordered_set(
        pairs in prop::collection::vec((key(), prop::collection::vec(0u8..4, 1..4)), 1..200),
        doomed in prop::collection::vec(key(), 0..20),
    ) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), EnvOptions::new().max_dbs(1)).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&mut txn, Some("set"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();

        let mut model = std::collections::BTreeSet::new();
        for (k, v) in pairs {
            db.put(&mut txn, &k, &v, WriteFlags::empty()).unwrap();
            model.insert((k, v));
        }
        for k in doomed {
            let present = model.iter().any(|(mk, _)| *mk == k);
            let res = db.del(&mut txn, &k, None);
            prop_assert_eq!(res.is_ok(), present);
            model.retain(|(mk, _)| *mk != k);
        }
        txn.commit().unwrap();

        let txn = env.begin_ro_txn().unwrap();
        let stored: Vec<(Vec<u8>, Vec<u8>)> = db
            .iter(&txn)
            .unwrap()
            .map(|item| {
                let (k, v) = item.unwrap();
                (k.to_vec(), v.to_vec())
            })
            .collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(stored, expected);
    }
}
