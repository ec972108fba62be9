use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::mem;
use std::ops::{Deref, DerefMut};

use fs2::FileExt;
use log::{debug, trace, warn};
use parking_lot::MutexGuard;

use crate::btree;
use crate::constants::{
    EnvFlags, NodeFlags, Pgno, TxnFlags, MAIN_DBI, META_PAGES, PAGE_HEADER_SIZE, P_INVALID,
};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::freelist::{self, FreeState};
use crate::meta::{DbInfo, MetaPage};
use crate::options::WritePolicy;
use crate::page::{NodeRef, PageRef};

/// Root record of a database as seen by one transaction
#[derive(Debug, Clone)]
pub(crate) struct TxnDb {
    /// Current root record
    pub info: DbInfo,
    /// Changed by this transaction
    pub dirty: bool,
}

/// Exclusive writer ticket: the in-process mutex plus the data file lock
struct WriterGuard<'env> {
    _local: MutexGuard<'env, ()>,
    file: Option<&'env File>,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file {
            if let Err(err) = FileExt::unlock(file) {
                warn!("failed to release writer lock: {}", err);
            }
        }
    }
}

/// Parent state kept while a child transaction runs
struct Saved {
    next_pgno: Pgno,
    free: FreeState,
    dbs: Vec<Option<TxnDb>>,
    created: Vec<usize>,
    dropped: Vec<usize>,
    flags: TxnFlags,
}

/// Private workspace of the write transaction
struct WriteState<'env> {
    _guard: WriterGuard<'env>,
    /// First page past the end of the file
    next_pgno: Pgno,
    /// Records freed before this id may be reused
    oldest: u64,
    /// Free page accounting
    free: FreeState,
    /// Dirty pages, one map per nesting level
    dirty: Vec<HashMap<Pgno, Box<[u8]>>>,
    /// Named databases created by this transaction
    created: Vec<usize>,
    /// Named databases deleted by this transaction
    dropped: Vec<usize>,
    /// Parent state while a child is active
    saved: Option<Saved>,
}

enum Kind<'env> {
    Read { slot: Option<usize> },
    Write(Box<WriteState<'env>>),
}

/// Read snapshot or the single write transaction of an environment
pub struct Transaction<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Transaction ID
    txnid: u64,
    /// Meta page the transaction started from
    meta: MetaPage,
    /// Transaction flags
    flags: TxnFlags,
    /// Database roots, indexed by database id
    dbs: RefCell<Vec<Option<TxnDb>>>,
    kind: Kind<'env>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txnid", &self.txnid)
            .field("flags", &self.flags)
            .finish()
    }
}

impl<'env> Transaction<'env> {
    /// Begin a read transaction on the latest committed snapshot
    pub(crate) fn begin_read(env: &'env Environment) -> Result<Self> {
        let slot = env.readers().acquire()?;
        let meta = match Self::pin_snapshot(env, slot) {
            Ok(meta) => meta,
            Err(err) => {
                env.readers().release(slot)?;
                return Err(err);
            }
        };
        trace!("read txn {} pinned in slot {}", meta.txnid, slot);

        Ok(Transaction {
            env,
            txnid: meta.txnid,
            meta,
            flags: TxnFlags::RDONLY,
            dbs: RefCell::new(initial_dbs(env, &meta)),
            kind: Kind::Read { slot: Some(slot) },
        })
    }

    /// Publish the current snapshot in `slot`, retrying until no commit raced it
    fn pin_snapshot(env: &Environment, slot: usize) -> Result<MetaPage> {
        loop {
            let meta = env.current_meta()?;
            env.readers().publish(slot, meta.txnid)?;
            if env.current_meta()?.txnid == meta.txnid {
                env.check_map(&meta)?;
                return Ok(meta);
            }
        }
    }

    /// Begin the write transaction, honouring the environment write policy
    pub(crate) fn begin_write(env: &'env Environment) -> Result<Self> {
        // Validate environment state
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        if env.is_fatal() {
            return Err(Error::Panic);
        }

        let policy = env.options().write_policy;
        let local = match policy {
            WritePolicy::Block => env.write_lock().lock(),
            WritePolicy::Fail => env.write_lock().try_lock().ok_or(Error::BadTxn)?,
        };
        let file = if env.flags().contains(EnvFlags::NOLOCK) {
            None
        } else {
            let file = env.store().file();
            match policy {
                WritePolicy::Block => FileExt::lock_exclusive(file)?,
                WritePolicy::Fail => FileExt::try_lock_exclusive(file).map_err(|_| Error::BadTxn)?,
            }
            Some(file)
        };
        let guard = WriterGuard { _local: local, file };

        // Another writer may have failed while we waited
        if env.is_fatal() {
            return Err(Error::Panic);
        }

        let meta = env.current_meta()?;
        env.check_map(&meta)?;
        let records = if meta.free_pgno != P_INVALID {
            freelist::decode(env.store().pages(meta.free_pgno, meta.free_len as usize)?)?
        } else {
            BTreeMap::new()
        };
        let oldest = env
            .readers()
            .oldest()
            .map_or(meta.txnid, |pinned| pinned.min(meta.txnid));
        let txnid = meta.txnid + 1;
        debug!("write txn {} begins, {} free records, oldest reader {}", txnid, records.len(), oldest);

        Ok(Transaction {
            env,
            txnid,
            meta,
            flags: TxnFlags::empty(),
            dbs: RefCell::new(initial_dbs(env, &meta)),
            kind: Kind::Write(Box::new(WriteState {
                _guard: guard,
                next_pgno: meta.last_pgno + 1,
                oldest,
                free: FreeState::new(records),
                dirty: vec![HashMap::new()],
                created: Vec::new(),
                dropped: Vec::new(),
                saved: None,
            })),
        })
    }

    /// Transaction ID
    pub fn id(&self) -> u64 {
        self.txnid
    }

    pub fn env(&self) -> &'env Environment {
        self.env
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TxnFlags::RDONLY)
    }

    /// Meta page the transaction started from
    pub(crate) fn meta(&self) -> &MetaPage {
        &self.meta
    }

    pub(crate) fn page_size(&self) -> usize {
        self.env.store().page_size()
    }

    /// Fail unless the transaction may still read
    pub(crate) fn check_read(&self) -> Result<()> {
        if self
            .flags
            .intersects(TxnFlags::FINISHED | TxnFlags::RESET | TxnFlags::ERROR)
        {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    /// Fail unless the transaction may write
    pub(crate) fn check_write(&self) -> Result<()> {
        self.check_read()?;
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn write_state_mut(&mut self) -> Result<&mut WriteState<'env>> {
        match &mut self.kind {
            Kind::Write(w) => Ok(w),
            Kind::Read { .. } => Err(Error::ReadOnly),
        }
    }

    /// Mark the transaction unusable after a failure that may have left
    /// its workspace half updated.
    pub(crate) fn poison_on<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if matches!(
                err,
                Error::MapFull | Error::Io(_) | Error::PageFull | Error::Corrupted | Error::PageNotFound
            ) {
                warn!("txn {} failed and must be aborted: {}", self.txnid, err);
                self.flags.insert(TxnFlags::ERROR);
            }
        }
        res
    }

    /// Borrow `count` pages starting at `pgno` as this transaction sees them.
    pub(crate) fn pages(&self, pgno: Pgno, count: usize) -> Result<&[u8]> {
        if let Kind::Write(w) = &self.kind {
            for level in w.dirty.iter().rev() {
                if let Some(buf) = level.get(&pgno) {
                    return Ok(buf);
                }
            }
        }
        if pgno < META_PAGES as Pgno || pgno + count as Pgno > self.meta.last_pgno + 1 {
            return Err(Error::PageNotFound);
        }
        self.env.store().pages(pgno, count)
    }

    pub(crate) fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        let page = PageRef::new(self.pages(pgno, 1)?);
        if page.pgno() != pgno {
            return Err(Error::Corrupted);
        }
        Ok(page)
    }

    /// Value of a leaf node, following overflow pages.
    pub(crate) fn node_data<'t>(&'t self, node: &NodeRef<'t>) -> Result<&'t [u8]> {
        if !node.flags.contains(NodeFlags::BIGDATA) {
            return Ok(node.data);
        }
        let first = node.overflow_pgno();
        let count = self.page(first)?.run_pages() as usize;
        let run = self.pages(first, count)?;
        let end = PAGE_HEADER_SIZE + node.dsize as usize;
        if end > run.len() {
            return Err(Error::Corrupted);
        }
        Ok(&run[PAGE_HEADER_SIZE..end])
    }

    /// Allocate `n` consecutive pages, preferring reusable ones
    fn alloc(&mut self, n: usize) -> Result<Pgno> {
        let max_pgno = self.env.store().max_pgno();
        let w = self.write_state_mut()?;
        let oldest = w.oldest;
        if let Some(pgno) = w.free.alloc(n, oldest) {
            return Ok(pgno);
        }
        let pgno = w.next_pgno;
        if pgno + n as Pgno > max_pgno {
            return Err(Error::MapFull);
        }
        w.next_pgno += n as Pgno;
        trace!("allocated {} pages at end of file: {}", n, pgno);
        Ok(pgno)
    }

    /// Allocate `n` zeroed dirty pages.
    pub(crate) fn new_pages(&mut self, n: usize) -> Result<Pgno> {
        let psize = self.page_size();
        let pgno = self.alloc(n)?;
        let w = self.write_state_mut()?;
        if let Some(top) = w.dirty.last_mut() {
            top.insert(pgno, vec![0u8; n * psize].into_boxed_slice());
        }
        Ok(pgno)
    }

    /// Mutable access to a page made dirty by this nesting level
    pub(crate) fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        let w = self.write_state_mut()?;
        w.dirty
            .last_mut()
            .and_then(|top| top.get_mut(&pgno))
            .map(|buf| &mut buf[..])
            .ok_or(Error::PageNotFound)
    }

    /// Make `pgno` writable, copying it first when needed.
    ///
    /// Committed pages move to a new page number; pages dirty in the
    /// parent are shadowed under the same number.
    pub(crate) fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        let psize = self.page_size();
        {
            let w = self.write_state_mut()?;
            let levels = w.dirty.len();
            if w.dirty[levels - 1].contains_key(&pgno) {
                return Ok(pgno);
            }
            let inherited = w.dirty[..levels - 1]
                .iter()
                .rev()
                .find_map(|level| level.get(&pgno))
                .cloned();
            if let Some(buf) = inherited {
                w.dirty[levels - 1].insert(pgno, buf);
                return Ok(pgno);
            }
        }

        let mut copy: Box<[u8]> = self.pages(pgno, 1)?[..psize].into();
        let new = self.alloc(1)?;
        copy[0..8].copy_from_slice(&new.to_le_bytes());
        let w = self.write_state_mut()?;
        if let Some(top) = w.dirty.last_mut() {
            top.insert(new, copy);
        }
        w.free.freed.append(pgno);
        Ok(new)
    }

    /// Release `count` pages starting at `pgno`.
    pub(crate) fn free_pages(&mut self, pgno: Pgno, count: usize) -> Result<()> {
        let w = self.write_state_mut()?;
        let dirty = w.dirty.iter().any(|level| level.contains_key(&pgno));
        if dirty {
            if let Some(top) = w.dirty.last_mut() {
                top.remove(&pgno);
            }
            w.free.loose.extend(pgno..pgno + count as Pgno);
        } else {
            w.free.freed.append_range(pgno, count as u64);
        }
        Ok(())
    }

    /// Root record of database `dbi`, loading named roots on first use.
    pub(crate) fn db(&self, dbi: usize) -> Result<TxnDb> {
        self.check_read()?;
        if let Some(Some(db)) = self.dbs.borrow().get(dbi) {
            return Ok(db.clone());
        }
        if dbi == MAIN_DBI || dbi >= self.dbs.borrow().len() {
            return Err(Error::BadDbi);
        }
        let name = self.env.db_name(dbi).ok_or(Error::BadDbi)?;
        let info = self.find_named(&name)?.ok_or(Error::BadDbi)?;
        let db = TxnDb { info, dirty: false };
        self.dbs.borrow_mut()[dbi] = Some(db.clone());
        Ok(db)
    }

    /// Whether a named database is open or created in this transaction
    pub(crate) fn has_named_dbs(&self) -> bool {
        self.dbs.borrow().iter().skip(1).any(Option::is_some)
    }

    /// Look up the root record stored under `name` in the main database.
    pub(crate) fn find_named(&self, name: &[u8]) -> Result<Option<DbInfo>> {
        let main = self.db(MAIN_DBI)?.info;
        match btree::find(self, &main, name)? {
            Some(node) if node.flags.contains(NodeFlags::SUBDATA) => Ok(Some(DbInfo::decode(node.data)?)),
            Some(_) => Err(Error::Incompatible),
            None => Ok(None),
        }
    }

    /// Record a changed root for database `dbi`.
    pub(crate) fn set_db(&mut self, dbi: usize, info: DbInfo) {
        let dbs = self.dbs.get_mut();
        if dbi < dbs.len() {
            dbs[dbi] = Some(TxnDb { info, dirty: true });
        }
    }

    /// Install the root of a database created by this transaction.
    pub(crate) fn created_db(&mut self, dbi: usize, info: DbInfo) -> Result<()> {
        let w = self.write_state_mut()?;
        if !w.created.contains(&dbi) {
            w.created.push(dbi);
        }
        w.dropped.retain(|&d| d != dbi);
        self.set_db(dbi, info);
        Ok(())
    }

    /// Forget database `dbi`; its registry slot is released at commit.
    pub(crate) fn dropped_db(&mut self, dbi: usize) -> Result<()> {
        let w = self.write_state_mut()?;
        if !w.dropped.contains(&dbi) {
            w.dropped.push(dbi);
        }
        if let Some(slot) = self.dbs.get_mut().get_mut(dbi) {
            *slot = None;
        }
        Ok(())
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        let result = match self.kind {
            Kind::Read { .. } => self.finish_read(),
            Kind::Write(_) => {
                let result = self.commit_write();
                if result.is_err() {
                    self.abort_write();
                }
                result
            }
        };
        self.flags.insert(TxnFlags::FINISHED);
        result
    }

    /// Abandon the transaction
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.flags.contains(TxnFlags::FINISHED) {
            return;
        }
        match self.kind {
            Kind::Read { .. } => {
                if let Err(err) = self.finish_read() {
                    warn!("failed to release reader slot: {}", err);
                }
            }
            Kind::Write(_) => {
                debug!("write txn {} aborted", self.txnid);
                self.abort_write();
            }
        }
        self.flags.insert(TxnFlags::FINISHED);
    }

    fn finish_read(&mut self) -> Result<()> {
        if let Kind::Read { slot } = &mut self.kind {
            if let Some(slot) = slot.take() {
                self.env.readers().release(slot)?;
            }
        }
        Ok(())
    }

    fn abort_write(&mut self) {
        let env = self.env;
        if let Kind::Write(w) = &mut self.kind {
            for dbi in w.created.drain(..) {
                env.unregister_db(dbi);
            }
            w.dirty.clear();
            w.saved = None;
        }
    }

    /// Release the snapshot of a read transaction but keep the handle for `renew`.
    pub fn reset(&mut self) -> Result<()> {
        if !self.is_readonly() {
            return Err(Error::BadTxn);
        }
        self.finish_read()?;
        self.flags.insert(TxnFlags::RESET);
        Ok(())
    }

    /// Pin the latest snapshot again after `reset`.
    pub fn renew(&mut self) -> Result<()> {
        if !self.is_readonly() || self.flags.contains(TxnFlags::FINISHED) {
            return Err(Error::BadTxn);
        }
        if let Kind::Read { slot: Some(_) } = self.kind {
            return Err(Error::BadTxn);
        }
        let env = self.env;
        let slot = env.readers().acquire()?;
        let meta = match Self::pin_snapshot(env, slot) {
            Ok(meta) => meta,
            Err(err) => {
                env.readers().release(slot)?;
                return Err(err);
            }
        };
        self.kind = Kind::Read { slot: Some(slot) };
        self.meta = meta;
        self.txnid = meta.txnid;
        *self.dbs.get_mut() = initial_dbs(env, &meta);
        self.flags.remove(TxnFlags::RESET);
        Ok(())
    }

    fn commit_write(&mut self) -> Result<()> {
        if self.flags.contains(TxnFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        let env = self.env;
        let psize = self.page_size();
        let txnid = self.txnid;

        // Named database roots are records of the main database
        let named: Vec<(usize, DbInfo)> = self
            .dbs
            .get_mut()
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(dbi, db)| db.as_ref().filter(|db| db.dirty).map(|db| (dbi, db.info)))
            .collect();
        for (dbi, info) in named {
            let name = env.db_name(dbi).ok_or(Error::BadDbi)?;
            let mut main = self.db(MAIN_DBI)?.info;
            btree::put(self, &mut main, &name, &info.encode(), NodeFlags::SUBDATA)?;
            self.set_db(MAIN_DBI, main);
        }
        let main = self.db(MAIN_DBI)?;

        let old_chain = self.meta.free_pgno;
        let old_len = self.meta.free_len;
        let max_pgno = env.store().max_pgno();
        let Kind::Write(w) = &mut self.kind else {
            return Err(Error::BadTxn);
        };
        if w.dirty[0].is_empty() && w.free.freed.is_empty() && !main.dirty {
            debug!("write txn {} had no changes", txnid);
            for dbi in w.dropped.drain(..) {
                env.unregister_db(dbi);
            }
            return Ok(());
        }

        // The previous run is released by this commit
        let extra: Vec<Pgno> = if old_chain != P_INVALID {
            (old_chain..old_chain + old_len).collect()
        } else {
            Vec::new()
        };

        // Taking pages for the run only shrinks the list, so size it first
        let needed = {
            let estimate = w.free.clone().into_records(txnid, &extra);
            freelist::run_len(&freelist::encode(&estimate), psize)
        };
        let run = if needed == 0 {
            None
        } else if let Some(pgno) = w.free.alloc(needed, w.oldest) {
            Some(pgno)
        } else {
            if w.next_pgno + needed as Pgno > max_pgno {
                return Err(Error::MapFull);
            }
            let pgno = w.next_pgno;
            w.next_pgno += needed as Pgno;
            Some(pgno)
        };

        let free = mem::take(&mut w.free);
        let loose: HashSet<Pgno> = free.loose.iter().copied().collect();
        let records = free.into_records(txnid, &extra);
        let stream = freelist::encode(&records);
        if freelist::run_len(&stream, psize) > needed {
            return Err(Error::Corrupted);
        }
        let (free_pgno, free_len) = match run {
            Some(pgno) => (pgno, needed as u64),
            None => (P_INVALID, 0),
        };

        // Dirty pages first, in file order
        let store = env.store();
        let mut pages: Vec<(&Pgno, &Box<[u8]>)> = w.dirty[0]
            .iter()
            .filter(|(pgno, _)| !loose.contains(pgno))
            .collect();
        pages.sort_unstable_by_key(|(pgno, _)| **pgno);
        for (pgno, buf) in &pages {
            store.write_pages(**pgno, buf)?;
        }
        let written = pages.len();
        if free_pgno != P_INVALID {
            store.write_pages(free_pgno, &freelist::build_run(free_pgno, needed, &stream, psize))?;
        }
        let last_pgno = w.next_pgno - 1;
        store.ensure_pages(last_pgno + 1)?;

        let flags = env.flags();
        if !flags.contains(EnvFlags::NOSYNC) {
            store.sync(flags)?;
        }

        let meta = MetaPage {
            page_size: psize as u32,
            map_size: store.map_size() as u64,
            last_pgno,
            txnid,
            free_pgno,
            free_len,
            main: main.info,
        };
        env.publish_meta(&meta)?;

        for dbi in w.dropped.drain(..) {
            env.unregister_db(dbi);
        }
        debug!(
            "committed txn {}: {} pages written, last page {}, {} free records",
            txnid,
            written,
            last_pgno,
            records.len()
        );
        Ok(())
    }

    /// Start a child transaction; only one level of nesting is supported.
    pub fn begin_nested(&mut self) -> Result<ChildTransaction<'_, 'env>> {
        self.check_write()?;
        let dbs = self.dbs.get_mut().clone();
        let flags = self.flags;
        let w = self.write_state_mut()?;
        if w.saved.is_some() {
            return Err(Error::BadTxn);
        }
        w.saved = Some(Saved {
            next_pgno: w.next_pgno,
            free: w.free.clone(),
            dbs,
            created: w.created.clone(),
            dropped: w.dropped.clone(),
            flags,
        });
        w.dirty.push(HashMap::new());
        trace!("nested txn started in {}", self.txnid);
        Ok(ChildTransaction {
            txn: self,
            finished: false,
        })
    }

    /// Fold the child workspace into the parent
    fn merge_child(&mut self) -> Result<()> {
        if self.flags.contains(TxnFlags::ERROR) {
            self.discard_child();
            return Err(Error::BadTxn);
        }
        if let Kind::Write(w) = &mut self.kind {
            if w.saved.take().is_some() {
                if let Some(top) = w.dirty.pop() {
                    if let Some(parent) = w.dirty.last_mut() {
                        parent.extend(top);
                        for pgno in &w.free.loose {
                            parent.remove(pgno);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop the child workspace and restore the parent state
    fn discard_child(&mut self) {
        let env = self.env;
        let Kind::Write(w) = &mut self.kind else {
            return;
        };
        let Some(saved) = w.saved.take() else {
            return;
        };
        w.dirty.pop();
        for &dbi in &w.created {
            if !saved.created.contains(&dbi) {
                env.unregister_db(dbi);
            }
        }
        w.next_pgno = saved.next_pgno;
        w.free = saved.free;
        w.created = saved.created;
        w.dropped = saved.dropped;
        *self.dbs.get_mut() = saved.dbs;
        self.flags = saved.flags;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}

fn initial_dbs(env: &Environment, meta: &MetaPage) -> Vec<Option<TxnDb>> {
    let mut dbs = vec![None; env.max_dbs() as usize + 1];
    dbs[MAIN_DBI] = Some(TxnDb {
        info: meta.main,
        dirty: false,
    });
    dbs
}

/// Nested write transaction.
///
/// Dereferences to the parent transaction; changes become part of the
/// parent on `commit` and vanish on `abort` or drop.
pub struct ChildTransaction<'p, 'env> {
    txn: &'p mut Transaction<'env>,
    finished: bool,
}

impl<'p, 'env> ChildTransaction<'p, 'env> {
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.txn.merge_child()
    }

    pub fn abort(mut self) {
        self.finished = true;
        self.txn.discard_child();
    }
}

impl<'p, 'env> Deref for ChildTransaction<'p, 'env> {
    type Target = Transaction<'env>;

    fn deref(&self) -> &Transaction<'env> {
        self.txn
    }
}

impl<'p, 'env> DerefMut for ChildTransaction<'p, 'env> {
    fn deref_mut(&mut self) -> &mut Transaction<'env> {
        self.txn
    }
}

impl Drop for ChildTransaction<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            self.txn.discard_child();
        }
    }
}
