use std::cmp::Ordering;

use log::debug;

use crate::btree;
use crate::cmp::Comparator;
use crate::constants::{DbFlags, NodeFlags, WriteFlags, MAIN_DBI};
use crate::cursor::{Cursor, Iter};
use crate::error::{Error, Result};
use crate::meta::DbInfo;
use crate::transaction::Transaction;
use crate::types::Stat;

/// Database handle.
///
/// A handle is a plain index into the environment registry; every operation
/// takes the transaction it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    /// Database identifier
    dbi: usize,
}

impl Database {
    /// Open the main database (`name == None`) or a named one.
    ///
    /// Named databases are created when `flags` holds `CREATE`, which needs a
    /// write transaction.
    pub fn open(txn: &mut Transaction<'_>, name: Option<&str>, flags: DbFlags) -> Result<Self> {
        txn.check_read()?;
        match name {
            None => Self::open_main(txn, flags),
            Some(name) => Self::open_named(txn, name.as_bytes(), flags),
        }
    }

    fn open_main(txn: &mut Transaction<'_>, flags: DbFlags) -> Result<Self> {
        let wanted = flags.persistent();
        let mut info = txn.db(MAIN_DBI)?.info;
        if !wanted.is_empty() && wanted != info.flags {
            // Flags of the main database may change only while it is empty
            // and no named database waits for its record
            if !info.is_empty() || txn.is_readonly() || txn.has_named_dbs() {
                return Err(Error::Incompatible);
            }
            info.flags = wanted;
            txn.set_db(MAIN_DBI, info);
        }
        Ok(Database { dbi: MAIN_DBI })
    }

    fn open_named(txn: &mut Transaction<'_>, name: &[u8], flags: DbFlags) -> Result<Self> {
        let env = txn.env();
        if name.is_empty() || name.len() > env.max_key_size() {
            return Err(Error::BadValSize);
        }
        let main = txn.db(MAIN_DBI)?.info;
        if main.flags.contains(DbFlags::DUPSORT) {
            return Err(Error::Incompatible);
        }

        let registered = env.find_db(name);
        let existing = match registered {
            Some(dbi) => match txn.db(dbi) {
                Ok(db) => Some((dbi, db.info)),
                Err(Error::BadDbi) => None,
                Err(err) => return Err(err),
            },
            None => match txn.find_named(name)? {
                Some(_) => {
                    let dbi = env.register_db(name)?;
                    Some((dbi, txn.db(dbi)?.info))
                }
                None => None,
            },
        };

        if let Some((dbi, info)) = existing {
            let wanted = flags.persistent();
            if !wanted.is_empty() && wanted != info.flags {
                return Err(Error::Incompatible);
            }
            return Ok(Database { dbi });
        }

        if !flags.contains(DbFlags::CREATE) {
            return Err(Error::NotFound);
        }
        txn.check_write()?;
        let dbi = match registered {
            Some(dbi) => dbi,
            None => env.register_db(name)?,
        };
        txn.created_db(dbi, DbInfo::empty(flags))?;
        debug!("created database {:?} as dbi {}", String::from_utf8_lossy(name), dbi);
        Ok(Database { dbi })
    }

    /// Refuse main database keys naming a database live in `txn`.
    ///
    /// Databases created by `txn` get their record only at commit.
    fn check_db_name(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<()> {
        if self.dbi != MAIN_DBI {
            return Ok(());
        }
        match txn.env().find_db(key) {
            Some(dbi) if dbi != MAIN_DBI && txn.db(dbi).is_ok() => Err(Error::Incompatible),
            _ => Ok(()),
        }
    }

    /// Registry index of this handle
    pub fn dbi(&self) -> usize {
        self.dbi
    }

    fn info(&self, txn: &Transaction<'_>) -> Result<DbInfo> {
        Ok(txn.db(self.dbi)?.info)
    }

    /// Get database statistics
    pub fn stat(&self, txn: &Transaction<'_>) -> Result<Stat> {
        Ok(self.info(txn)?.stat(txn.page_size()))
    }

    /// Persistent flags the database was created with
    pub fn flags(&self, txn: &Transaction<'_>) -> Result<DbFlags> {
        Ok(self.info(txn)?.flags)
    }

    /// Value stored under `key`; the first duplicate in sorted databases.
    pub fn get<'t>(&self, txn: &'t Transaction<'_>, key: &[u8]) -> Result<&'t [u8]> {
        let info = self.info(txn)?;
        if info.flags.contains(DbFlags::DUPSORT) {
            let mut cursor = Cursor::new(txn, info)?;
            return cursor.set(key)?.map(|(_, v)| v).ok_or(Error::NotFound);
        }
        match btree::find(txn, &info, key)? {
            Some(node) if node.flags.contains(NodeFlags::SUBDATA) => Err(Error::Incompatible),
            Some(node) => txn.node_data(&node),
            None => Err(Error::NotFound),
        }
    }

    /// Store `data` under `key`.
    pub fn put(&self, txn: &mut Transaction<'_>, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        txn.check_write()?;
        let mut info = self.info(txn)?;
        if !self.check_put(txn, &info, key, data, flags)? {
            return Ok(());
        }
        let res = btree::put(txn, &mut info, key, data, NodeFlags::empty());
        let res = txn.poison_on(res);
        if res.is_ok() {
            txn.set_db(self.dbi, info);
        }
        res
    }

    /// Validate a write; `false` means the record is already stored as is.
    fn check_put(&self, txn: &Transaction<'_>, info: &DbInfo, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<bool> {
        let max_key = txn.env().max_key_size();
        if key.is_empty() || key.len() > max_key {
            return Err(Error::BadValSize);
        }
        if info.flags.contains(DbFlags::INTEGERKEY) && !matches!(key.len(), 4 | 8) {
            return Err(Error::BadValSize);
        }
        self.check_db_name(txn, key)?;
        let cmp = Comparator::new(info.flags);
        let mut cursor = Cursor::new(txn, *info)?;

        if !cmp.is_dupsort() {
            if self.dbi == MAIN_DBI {
                if let Some(node) = btree::find(txn, info, key)? {
                    if node.flags.contains(NodeFlags::SUBDATA) {
                        return Err(Error::Incompatible);
                    }
                }
            }
            if flags.contains(WriteFlags::APPEND) {
                if let Some((last, _)) = cursor.last()? {
                    if cmp.keys(key, last) != Ordering::Greater {
                        return Err(Error::KeyExist);
                    }
                }
            }
            if flags.contains(WriteFlags::NOOVERWRITE) && cursor.set(key)?.is_some() {
                return Err(Error::KeyExist);
            }
            return Ok(true);
        }

        if data.len() > max_key {
            return Err(Error::BadValSize);
        }
        if info.flags.contains(DbFlags::INTEGERDUP) && !matches!(data.len(), 4 | 8) {
            return Err(Error::BadValSize);
        }
        if flags.contains(WriteFlags::APPEND) {
            if let Some((last_key, last_dup)) = cursor.last()? {
                let in_order = match cmp.keys(key, last_key) {
                    Ordering::Greater => true,
                    Ordering::Equal => {
                        flags.contains(WriteFlags::APPENDDUP) && cmp.dups(data, last_dup) == Ordering::Greater
                    }
                    Ordering::Less => false,
                };
                if !in_order {
                    return Err(Error::KeyExist);
                }
            }
        }
        if let Some((_, first)) = cursor.set(key)? {
            if flags.contains(WriteFlags::NOOVERWRITE) {
                return Err(Error::KeyExist);
            }
            if info.flags.contains(DbFlags::DUPFIXED) && first.len() != data.len() {
                return Err(Error::BadValSize);
            }
            if flags.contains(WriteFlags::APPENDDUP) {
                if let Some((_, last)) = cursor.last_dup()? {
                    if cmp.dups(data, last) != Ordering::Greater {
                        return Err(Error::KeyExist);
                    }
                }
            }
            if cursor.get_both(key, data)?.is_some() {
                if flags.contains(WriteFlags::NODUPDATA) {
                    return Err(Error::KeyExist);
                }
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete `key`, or only the pair `key`/`data` when `data` is given.
    ///
    /// Without `data`, every duplicate of `key` is removed.
    pub fn del(&self, txn: &mut Transaction<'_>, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        txn.check_write()?;
        self.check_db_name(txn, key)?;
        let mut info = self.info(txn)?;
        let dupsort = info.flags.contains(DbFlags::DUPSORT);

        let doomed: Vec<Vec<u8>> = {
            let mut cursor = Cursor::new(txn, info)?;
            match (dupsort, data) {
                (true, Some(data)) => match cursor.get_both(key, data)? {
                    Some((_, dup)) => vec![dup.to_vec()],
                    None => return Err(Error::NotFound),
                },
                (true, None) => {
                    let mut dups = Vec::new();
                    let mut item = cursor.set(key)?;
                    while let Some((_, dup)) = item {
                        dups.push(dup.to_vec());
                        item = cursor.next_dup()?;
                    }
                    if dups.is_empty() {
                        return Err(Error::NotFound);
                    }
                    dups
                }
                (false, data) => {
                    let node = btree::find(txn, &info, key)?.ok_or(Error::NotFound)?;
                    if node.flags.contains(NodeFlags::SUBDATA) {
                        return Err(Error::Incompatible);
                    }
                    if let Some(data) = data {
                        if txn.node_data(&node)? != data {
                            return Err(Error::NotFound);
                        }
                    }
                    Vec::new()
                }
            }
        };

        let res = if dupsort {
            doomed
                .iter()
                .try_for_each(|dup| btree::delete(txn, &mut info, key, Some(dup.as_slice())))
        } else {
            btree::delete(txn, &mut info, key, None)
        };
        let res = txn.poison_on(res);
        if res.is_ok() {
            txn.set_db(self.dbi, info);
        }
        res
    }

    /// Delete every record, keeping the database itself.
    pub fn empty(&self, txn: &mut Transaction<'_>) -> Result<()> {
        txn.check_write()?;
        let info = self.info(txn)?;
        if info.is_empty() {
            return Ok(());
        }
        if self.dbi == MAIN_DBI && btree::has_subdata(txn, &info)? {
            return Err(Error::Incompatible);
        }
        let res = btree::free_tree(txn, &info);
        txn.poison_on(res)?;
        txn.set_db(self.dbi, DbInfo::empty(info.flags));
        Ok(())
    }

    /// Delete a named database and its records; the main database is only
    /// emptied.
    pub fn drop(self, txn: &mut Transaction<'_>) -> Result<()> {
        if self.dbi == MAIN_DBI {
            return self.empty(txn);
        }
        txn.check_write()?;
        let info = self.info(txn)?;
        let name = txn.env().db_name(self.dbi).ok_or(Error::BadDbi)?;
        if !info.is_empty() {
            let res = btree::free_tree(txn, &info);
            txn.poison_on(res)?;
        }

        // A database created by this transaction has no record yet
        let mut main = txn.db(MAIN_DBI)?.info;
        if txn.find_named(&name)?.is_some() {
            let res = btree::delete(txn, &mut main, &name, None);
            txn.poison_on(res)?;
            txn.set_db(MAIN_DBI, main);
        }
        txn.dropped_db(self.dbi)?;
        debug!("dropped database {:?}", String::from_utf8_lossy(&name));
        Ok(())
    }

    /// Cursor over this database
    pub fn cursor<'t>(&self, txn: &'t Transaction<'_>) -> Result<Cursor<'t>> {
        Cursor::new(txn, self.info(txn)?)
    }

    /// Iterate over all records in order.
    pub fn iter<'t>(&self, txn: &'t Transaction<'_>) -> Result<Iter<'t>> {
        Ok(Iter::new(self.cursor(txn)?))
    }

    /// Iterate from the first key not below `key`.
    pub fn iter_from<'t>(&self, txn: &'t Transaction<'_>, key: &[u8]) -> Result<Iter<'t>> {
        Ok(Iter::from_key(self.cursor(txn)?, key))
    }

    /// Iterate over the duplicates of `key`.
    pub fn iter_dup_of<'t>(&self, txn: &'t Transaction<'_>, key: &[u8]) -> Result<Iter<'t>> {
        Ok(Iter::dups_of(self.cursor(txn)?, key))
    }
}
