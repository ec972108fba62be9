//! Embedded, memory-mapped, transactional key-value store.
//!
//! Data lives in a copy-on-write B+tree inside one mapped file. Any number
//! of read transactions see stable snapshots while a single write
//! transaction prepares the next version, which becomes current when its
//! meta page is written.
//!
//! ```no_run
//! use lumokv::{Database, DbFlags, EnvOptions, Environment, WriteFlags};
//!
//! # fn main() -> lumokv::Result<()> {
//! let env = Environment::open("/tmp/store", EnvOptions::new())?;
//! let mut txn = env.begin_txn()?;
//! let db = Database::open(&mut txn, None, DbFlags::empty())?;
//! db.put(&mut txn, b"key", b"value", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! assert_eq!(db.get(&txn, b"key")?, b"value");
//! # Ok(())
//! # }
//! ```

mod btree;
mod cmp;
mod constants;
mod copy;
mod cursor;
mod database;
mod env;
mod error;
mod freelist;
mod meta;
mod midl;
mod options;
mod page;
mod reader;
mod store;
mod transaction;
mod types;

pub use constants::{DbFlags, EnvFlags, WriteFlags, MAX_KEY_SIZE, PAGE_SIZE};
pub use cursor::{Cursor, Item, Iter};
pub use database::Database;
pub use env::Environment;
pub use error::{strerror, Error, Result};
pub use options::{EnvOptions, WritePolicy};
pub use transaction::{ChildTransaction, Transaction};
pub use types::{EnvInfo, ReaderInfo, Stat};
