use lumokv::{Database, DbFlags, EnvOptions, Environment, Error, WriteFlags};
use tempfile::TempDir;

fn setup(max_dbs: u32) -> (TempDir, Environment) {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::new().max_dbs(max_dbs)).unwrap();
    (dir, env)
}

#[test]
fn named_databases_are_separate_keyspaces() {
    let (_dir, env) = setup(4);
    let mut txn = env.begin_txn().unwrap();
    let users = Database::open(&mut txn, Some("users"), DbFlags::CREATE).unwrap();
    let posts = Database::open(&mut txn, Some("posts"), DbFlags::CREATE).unwrap();
    users.put(&mut txn, b"1", b"alice", WriteFlags::empty()).unwrap();
    posts.put(&mut txn, b"1", b"hello", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    // Handles stay valid in later transactions
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(users.get(&txn, b"1").unwrap(), b"alice");
    assert_eq!(posts.get(&txn, b"1").unwrap(), b"hello");
    assert_eq!(users.stat(&txn).unwrap().entries, 1);
    drop(txn);

    // Opening again by name yields the same handle
    let mut txn = env.begin_txn().unwrap();
    let again = Database::open(&mut txn, Some("users"), DbFlags::empty()).unwrap();
    assert_eq!(again.dbi(), users.dbi());

    // The main database holds one record per named database
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    let names: Vec<Vec<u8>> = main
        .iter(&txn)
        .unwrap()
        .map(|item| item.unwrap().0.to_vec())
        .collect();
    assert_eq!(names, vec![b"posts".to_vec(), b"users".to_vec()]);
}

#[test]
fn names_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvOptions::new().max_dbs(2)).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&mut txn, Some("kept"), DbFlags::CREATE | DbFlags::INTEGERKEY).unwrap();
        db.put(&mut txn, &7u32.to_ne_bytes(), b"seven", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let env = Environment::open(dir.path(), EnvOptions::new().max_dbs(2)).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, Some("kept"), DbFlags::empty()).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::INTEGERKEY);
    assert_eq!(db.get(&txn, &7u32.to_ne_bytes()).unwrap(), b"seven");
}

#[test]
fn registry_limit() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    Database::open(&mut txn, Some("a"), DbFlags::CREATE).unwrap();
    Database::open(&mut txn, Some("b"), DbFlags::CREATE).unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("c"), DbFlags::CREATE),
        Err(Error::DbsFull)
    ));
    txn.commit().unwrap();
}

#[test]
fn named_databases_need_registry_slots() {
    let (_dir, env) = setup(0);
    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("any"), DbFlags::CREATE),
        Err(Error::DbsFull)
    ));
}

#[test]
fn missing_database_without_create() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("nope"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
    assert!(matches!(
        Database::open(&mut txn, Some(""), DbFlags::CREATE),
        Err(Error::BadValSize)
    ));
    drop(txn);

    let mut txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("nope"), DbFlags::CREATE),
        Err(Error::ReadOnly)
    ));
}

#[test]
fn aborted_creation_is_forgotten() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&mut txn, Some("temp"), DbFlags::CREATE).unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.abort();

    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("temp"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn flag_mismatch_is_incompatible() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    Database::open(&mut txn, Some("dups"), DbFlags::CREATE | DbFlags::DUPSORT).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("dups"), DbFlags::INTEGERKEY),
        Err(Error::Incompatible)
    ));
    let db = Database::open(&mut txn, Some("dups"), DbFlags::empty()).unwrap();
    assert_eq!(db.flags(&txn).unwrap(), DbFlags::DUPSORT);
}

#[test]
fn main_database_flags() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    let main = Database::open(&mut txn, None, DbFlags::REVERSEKEY).unwrap();
    assert_eq!(main.flags(&txn).unwrap(), DbFlags::REVERSEKEY);
    main.put(&mut txn, b"ab", b"1", WriteFlags::empty()).unwrap();
    main.put(&mut txn, b"ba", b"2", WriteFlags::empty()).unwrap();
    let keys: Vec<Vec<u8>> = main
        .iter(&txn)
        .unwrap()
        .map(|item| item.unwrap().0.to_vec())
        .collect();
    assert_eq!(keys, vec![b"ba".to_vec(), b"ab".to_vec()]);

    // Flags are fixed once records exist
    assert!(matches!(
        Database::open(&mut txn, None, DbFlags::INTEGERKEY),
        Err(Error::Incompatible)
    ));
    txn.commit().unwrap();
}

#[test]
fn dupsort_main_refuses_named_databases() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    Database::open(&mut txn, None, DbFlags::DUPSORT).unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("x"), DbFlags::CREATE),
        Err(Error::Incompatible)
    ));
}

#[test]
fn main_records_of_named_databases_are_protected() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    let named = Database::open(&mut txn, Some("inner"), DbFlags::CREATE).unwrap();
    named.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert!(matches!(main.get(&txn, b"inner"), Err(Error::Incompatible)));
    assert!(matches!(
        main.put(&mut txn, b"inner", b"clobber", WriteFlags::empty()),
        Err(Error::Incompatible)
    ));
    assert!(matches!(main.del(&mut txn, b"inner", None), Err(Error::Incompatible)));
    assert!(matches!(main.empty(&mut txn), Err(Error::Incompatible)));
    assert_eq!(named.get(&txn, b"k").unwrap(), b"v");
}

#[test]
fn drop_and_empty() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    let logs = Database::open(&mut txn, Some("logs"), DbFlags::CREATE).unwrap();
    let keep = Database::open(&mut txn, Some("keep"), DbFlags::CREATE).unwrap();
    for i in 0..2000u32 {
        logs.put(&mut txn, &i.to_be_bytes(), &[3u8; 100], WriteFlags::empty()).unwrap();
        keep.put(&mut txn, &i.to_be_bytes(), b"k", WriteFlags::empty()).unwrap();
    }
    logs.put(&mut txn, b"huge", &[1u8; 50_000], WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    keep.empty(&mut txn).unwrap();
    assert_eq!(keep.stat(&txn).unwrap().entries, 0);
    logs.drop(&mut txn).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(
        Database::open(&mut txn, Some("logs"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
    let keep = Database::open(&mut txn, Some("keep"), DbFlags::empty()).unwrap();
    assert!(matches!(keep.get(&txn, &5u32.to_be_bytes()), Err(Error::NotFound)));
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(main.stat(&txn).unwrap().entries, 1);

    // The freed registry slot and pages are available again
    let fresh = Database::open(&mut txn, Some("fresh"), DbFlags::CREATE).unwrap();
    fresh.put(&mut txn, b"x", b"y", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn drop_database_created_in_same_txn() {
    let (_dir, env) = setup(1);
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&mut txn, Some("short"), DbFlags::CREATE).unwrap();
    db.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    db.drop(&mut txn).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(main.stat(&txn).unwrap().entries, 0);
    Database::open(&mut txn, Some("other"), DbFlags::CREATE).unwrap();
}

#[test]
fn main_keys_cannot_shadow_new_database() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    let fresh = Database::open(&mut txn, Some("fresh"), DbFlags::CREATE).unwrap();
    fresh.put(&mut txn, b"k", b"v", WriteFlags::empty()).unwrap();
    let main = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert!(matches!(
        main.put(&mut txn, b"fresh", b"user", WriteFlags::empty()),
        Err(Error::Incompatible)
    ));
    assert!(matches!(main.del(&mut txn, b"fresh", None), Err(Error::Incompatible)));
    // Unrelated keys are still accepted
    main.put(&mut txn, b"plain", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_ro_txn().unwrap();
    let fresh = Database::open(&mut txn, Some("fresh"), DbFlags::empty()).unwrap();
    assert_eq!(fresh.get(&txn, b"k").unwrap(), b"v");
    assert_eq!(main.get(&txn, b"plain").unwrap(), b"1");
}

#[test]
fn main_flags_fixed_once_named_database_is_created() {
    let (_dir, env) = setup(2);
    let mut txn = env.begin_txn().unwrap();
    let inner = Database::open(&mut txn, Some("inner"), DbFlags::CREATE).unwrap();
    inner.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
    assert!(matches!(
        Database::open(&mut txn, None, DbFlags::DUPSORT),
        Err(Error::Incompatible)
    ));
    txn.commit().unwrap();

    let mut txn = env.begin_ro_txn().unwrap();
    let inner = Database::open(&mut txn, Some("inner"), DbFlags::empty()).unwrap();
    assert_eq!(inner.get(&txn, b"a").unwrap(), b"1");
}
