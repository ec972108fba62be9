use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use lumokv::{
    strerror, Database, DbFlags, EnvFlags, EnvOptions, Environment, Error, WriteFlags, PAGE_SIZE,
};
use tempfile::TempDir;

fn fill(env: &Environment, db: Database, range: std::ops::Range<u32>) {
    let mut txn = env.begin_txn().unwrap();
    for i in range {
        let value = format!("value-{}", i);
        db.put(&mut txn, &i.to_be_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();
}

fn main_db(env: &Environment) -> Database {
    let mut txn = env.begin_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();
    db
}

#[test]
fn creates_files_in_directory() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
    assert!(dir.path().join("data.mdb").exists());
    assert!(dir.path().join("lock.mdb").exists());
    assert_eq!(env.path(), dir.path());

    let info = env.info().unwrap();
    assert_eq!(info.last_pgno, 1);
    assert_eq!(info.last_txnid, 0);
    assert_eq!(info.max_readers, 126);
    assert_eq!(info.num_readers, 0);
    assert_eq!(env.stat().unwrap().psize, PAGE_SIZE as u32);
}

#[test]
fn missing_directory_is_not_found() {
    let dir = TempDir::new().unwrap();
    let err = Environment::open(dir.path().join("absent"), EnvOptions::new()).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn nosubdir_uses_path_as_data_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let options = EnvOptions::new().flags(EnvFlags::NOSUBDIR);
    {
        let env = Environment::open(&path, options.clone()).unwrap();
        let db = main_db(&env);
        fill(&env, db, 0..10);
    }
    assert!(path.is_file());
    assert!(dir.path().join("store.db-lock").exists());

    let env = Environment::open(&path, options).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, &3u32.to_be_bytes()).unwrap(), b"value-3");
}

#[test]
fn data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
        let db = main_db(&env);
        fill(&env, db, 0..1000);
        env.close();
    }

    let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 1000);
    assert_eq!(db.get(&txn, &999u32.to_be_bytes()).unwrap(), b"value-999");
    assert!(env.info().unwrap().last_pgno > 1);
}

#[test]
fn read_only_environment() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
        let db = main_db(&env);
        fill(&env, db, 0..5);
    }

    let env = Environment::open(dir.path(), EnvOptions::new().flags(EnvFlags::RDONLY)).unwrap();
    assert!(matches!(env.begin_txn(), Err(Error::ReadOnly)));
    assert!(matches!(env.sync(true), Err(Error::ReadOnly)));
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, &4u32.to_be_bytes()).unwrap(), b"value-4");
}

#[test]
fn read_only_needs_existing_store() {
    let dir = TempDir::new().unwrap();
    let options = EnvOptions::new().flags(EnvFlags::RDONLY);
    let err = Environment::open(dir.path(), options.clone()).unwrap_err();
    assert!(err.is_not_found());

    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dir.path().join("data.mdb"))
        .unwrap();
    assert!(matches!(Environment::open(dir.path(), options), Err(Error::NotFound)));
}

#[test]
fn garbage_file_is_invalid() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("data.mdb"), vec![0x5a; 3 * PAGE_SIZE]).unwrap();
    assert!(matches!(
        Environment::open(dir.path(), EnvOptions::new()),
        Err(Error::Invalid)
    ));
}

#[test]
fn rejects_bad_options() {
    let dir = TempDir::new().unwrap();
    let bad = [
        EnvOptions::new().max_readers(0),
        EnvOptions::new().flags(EnvFlags::MAPASYNC),
        EnvOptions::new().flags(EnvFlags::RDONLY | EnvFlags::WRITEMAP),
    ];
    for options in bad {
        assert!(matches!(
            Environment::open(dir.path(), options),
            Err(Error::InvalidArgument)
        ));
    }
    assert!(matches!(
        EnvOptions::new().with_raw_flags(0x2),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn torn_meta_falls_back_to_previous_commit() {
    let dir = TempDir::new().unwrap();
    let newest = {
        let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        db.put(&mut txn, b"a", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin_txn().unwrap();
        db.put(&mut txn, b"a", b"2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.info().unwrap().last_txnid
    };
    assert_eq!(newest, 2);

    // Damage a checksummed byte of the newest meta page
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.path().join("data.mdb"))
        .unwrap();
    let offset = (newest % 2) * PAGE_SIZE as u64 + 16 + 30;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).unwrap();
    byte[0] ^= 0xff;
    file.write_all_at(&byte, offset).unwrap();
    drop(file);

    let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
    assert_eq!(env.info().unwrap().last_txnid, 1);
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.get(&txn, b"a").unwrap(), b"1");
    drop(txn);

    // The next commit overwrites the damaged slot
    let mut txn = env.begin_txn().unwrap();
    db.put(&mut txn, b"a", b"3", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    assert_eq!(env.info().unwrap().last_txnid, 2);
}

#[test]
fn copy_and_compact_copy_reopen() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::new().max_dbs(2)).unwrap();
    let db = main_db(&env);
    fill(&env, db, 0..3000);

    let mut txn = env.begin_txn().unwrap();
    let named = Database::open(&mut txn, Some("side"), DbFlags::CREATE).unwrap();
    named.put(&mut txn, b"big", &vec![7u8; 10_000], WriteFlags::empty()).unwrap();
    named.put(&mut txn, b"small", b"s", WriteFlags::empty()).unwrap();
    for i in 0..2500u32 {
        db.del(&mut txn, &i.to_be_bytes(), None).unwrap();
    }
    txn.commit().unwrap();

    let plain = TempDir::new().unwrap();
    let compact = TempDir::new().unwrap();
    env.copy(plain.path(), false).unwrap();
    env.copy(compact.path(), true).unwrap();
    assert!(matches!(env.copy(plain.path(), false), Err(Error::Io(_))));

    let plain_len = std::fs::metadata(plain.path().join("data.mdb")).unwrap().len();
    let compact_len = std::fs::metadata(compact.path().join("data.mdb")).unwrap().len();
    assert!(compact_len < plain_len);

    for target in [plain.path(), compact.path()] {
        let copy = Environment::open(target, EnvOptions::new().max_dbs(2)).unwrap();
        let mut txn = copy.begin_ro_txn().unwrap();
        let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
        let named = Database::open(&mut txn, Some("side"), DbFlags::empty()).unwrap();
        assert_eq!(db.get(&txn, &2999u32.to_be_bytes()).unwrap(), b"value-2999");
        assert!(matches!(db.get(&txn, &10u32.to_be_bytes()), Err(Error::NotFound)));
        assert_eq!(named.get(&txn, b"big").unwrap(), &vec![7u8; 10_000][..]);
        assert_eq!(named.get(&txn, b"small").unwrap(), b"s");
        assert_eq!(named.stat(&txn).unwrap().overflow_pages, 3);
        // Named database record plus the remaining keys
        assert_eq!(db.iter(&txn).unwrap().count(), 501);
        drop(txn);

        // The copy accepts writes
        let mut txn = copy.begin_txn().unwrap();
        db.put(&mut txn, b"after", b"copy", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
}

#[test]
fn runtime_flags() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
    env.set_flags(EnvFlags::NOSYNC, true).unwrap();
    assert!(env.flags().contains(EnvFlags::NOSYNC));

    let db = main_db(&env);
    fill(&env, db, 0..10);
    env.sync(true).unwrap();

    env.set_flags(EnvFlags::NOSYNC, false).unwrap();
    assert!(!env.flags().contains(EnvFlags::NOSYNC));
    assert!(matches!(
        env.set_flags(EnvFlags::RDONLY, true),
        Err(Error::InvalidArgument)
    ));
    assert!(matches!(
        env.set_flags(EnvFlags::MAPASYNC, true),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn writemap_environment() {
    let dir = TempDir::new().unwrap();
    let options = EnvOptions::new().flags(EnvFlags::WRITEMAP | EnvFlags::MAPASYNC);
    {
        let env = Environment::open(dir.path(), options.clone()).unwrap();
        let db = main_db(&env);
        fill(&env, db, 0..500);
        env.sync(true).unwrap();
    }
    let env = Environment::open(dir.path(), options).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = Database::open(&mut txn, None, DbFlags::empty()).unwrap();
    assert_eq!(db.stat(&txn).unwrap().entries, 500);
}

#[test]
fn grow_map_between_transactions() {
    let dir = TempDir::new().unwrap();
    let mut env = Environment::open(dir.path(), EnvOptions::new().map_size(1 << 20)).unwrap();
    let db = main_db(&env);
    fill(&env, db, 0..100);

    assert!(matches!(env.set_map_size(4096), Err(Error::InvalidArgument)));
    env.set_map_size(8 << 20).unwrap();
    fill(&env, db, 100..200);
    assert_eq!(env.info().unwrap().map_size, 8 << 20);
    drop(env);

    // A later open adopts the recorded size
    let env = Environment::open(dir.path(), EnvOptions::new()).unwrap();
    assert_eq!(env.info().unwrap().map_size, 8 << 20);
}

#[test]
fn error_codes_and_messages() {
    assert_eq!(Error::NotFound.code(), -30798);
    assert_eq!(Error::MapFull.code(), -30792);
    assert!(matches!(Error::from_code(-30799), Error::KeyExist));
    assert!(matches!(Error::from(-30782), Error::BadTxn));
    assert_eq!(strerror(-30798), "No matching key/data pair found");
    assert_eq!(strerror(0), "Successful return: 0");
    assert!(Error::NotFound.is_not_found());
    assert!(!Error::KeyExist.is_not_found());
}

#[test]
fn version_information() {
    assert_eq!(Environment::version(), (0, 9, 70));
    assert_eq!(Environment::version_string(), "lumokv 0.9.70");
}
