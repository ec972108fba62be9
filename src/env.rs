use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt as UnixFileExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use fs2::FileExt;
use lazy_static::lazy_static;
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::constants::{
    EnvFlags, DATA_NAME, DEFAULT_MAP_SIZE, LOCK_NAME, LOCK_SUFFIX, MAX_KEY_SIZE, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, PAGE_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::MetaPage;
use crate::options::EnvOptions;
use crate::page::node_max;
use crate::reader::ReaderTable;
use crate::store::PageStore;
use crate::transaction::Transaction;
use crate::types::{EnvInfo, ReaderInfo, Stat};

lazy_static! {
    /// Flags that may be toggled on an open environment
    static ref CHANGEABLE: EnvFlags =
        EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::MAPASYNC | EnvFlags::NOMEMINIT;
}

static VERSION_STRING: Lazy<String> = Lazy::new(|| {
    format!(
        "lumokv {}.{}.{}",
        VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH
    )
});

/// An open data file with its reader table and writer lock
pub struct Environment {
    /// Path given to `open`
    path: PathBuf,
    /// Options the environment was opened with
    options: EnvOptions,
    /// Current flags, some of which change at runtime
    flags: AtomicU32,
    /// Mapped data file
    store: PageStore,
    /// Reader slots pinning snapshots
    readers: ReaderTable,
    /// Orders meta writes against meta reads in this process
    meta_lock: RwLock<()>,
    /// Single writer within this process
    write_lock: Mutex<()>,
    /// Names of registered databases, indexed by dbi
    dbs: RwLock<Vec<Option<Vec<u8>>>>,
    /// A meta write failed; no further writes are allowed
    fatal: AtomicBool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("flags", &self.flags())
            .field("store", &self.store)
            .field("readers", &self.readers)
            .finish()
    }
}

impl Environment {
    /// Open or create an environment at `path`.
    ///
    /// `path` is a directory holding `data.mdb` and `lock.mdb`, or with
    /// `NOSUBDIR` the data file itself.
    pub fn open<P: AsRef<Path>>(path: P, options: EnvOptions) -> Result<Self> {
        options.validate()?;
        let flags = options.flags;
        let path = path.as_ref().to_path_buf();
        let readonly = flags.contains(EnvFlags::RDONLY);

        let (data_path, lock_path) = if flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = path.clone().into_os_string();
            lock.push(LOCK_SUFFIX);
            (path.clone(), PathBuf::from(lock))
        } else {
            if !path.is_dir() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("environment directory {} does not exist", path.display()),
                )));
            }
            (path.join(DATA_NAME), path.join(LOCK_NAME))
        };

        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .mode(options.mode)
            .open(&data_path)?;

        let readers = if flags.contains(EnvFlags::NOLOCK) {
            ReaderTable::local(options.max_readers)
        } else {
            ReaderTable::open(&lock_path, options.max_readers, options.mode)?
        };

        if file.metadata()?.len() == 0 {
            // Nothing to read until a writer initializes the store
            if readonly {
                return Err(Error::NotFound);
            }
            Self::init_file(&file, options.map_size.unwrap_or(DEFAULT_MAP_SIZE), flags)?;
        }

        let len = file.metadata()?.len();
        let (page_size, meta) = Self::read_meta(&file, len)?;
        let used = (meta.last_pgno as usize + 1) * page_size;
        let wanted = options
            .map_size
            .or((meta.map_size > 0).then_some(meta.map_size as usize))
            .unwrap_or(DEFAULT_MAP_SIZE);
        let map_size = wanted.max(used).next_multiple_of(page_size);

        let store = PageStore::map(file, page_size, map_size, flags)?;
        debug!(
            "opened environment {} (page size {}, map size {}, txn {})",
            data_path.display(),
            page_size,
            map_size,
            meta.txnid
        );

        Ok(Environment {
            path,
            dbs: RwLock::new(vec![None; options.max_dbs as usize + 1]),
            options,
            flags: AtomicU32::new(flags.bits()),
            store,
            readers,
            meta_lock: RwLock::new(()),
            write_lock: Mutex::new(()),
            fatal: AtomicBool::new(false),
        })
    }

    /// Write the two initial meta pages of an empty file.
    fn init_file(file: &File, map_size: usize, flags: EnvFlags) -> Result<()> {
        let lock = !flags.contains(EnvFlags::NOLOCK);
        if lock {
            FileExt::lock_exclusive(file)?;
        }
        let result = (|| -> Result<()> {
            // Another process may have initialized it while we waited
            if file.metadata()?.len() > 0 {
                return Ok(());
            }
            debug!("initializing new data file");
            let meta = MetaPage::initial(PAGE_SIZE, map_size);
            let mut page = vec![0u8; PAGE_SIZE];
            for slot in 0..2 {
                meta.encode_into(slot, &mut page);
                file.write_all_at(&page, (slot * PAGE_SIZE) as u64)?;
            }
            file.sync_all()?;
            Ok(())
        })();
        if lock {
            FileExt::unlock(file)?;
        }
        result
    }

    /// Pick the newest valid meta page of a data file.
    fn read_meta(file: &File, len: u64) -> Result<(usize, MetaPage)> {
        let mut head = vec![0u8; (len as usize).min(2 * MAX_PAGE_SIZE)];
        file.read_exact_at(&mut head, 0)?;

        // Slot 0 normally tells the page size; fall back to probing slot 1
        let page_size = MetaPage::raw_page_size(&head)
            .or_else(|| {
                let mut size = MIN_PAGE_SIZE;
                while size <= MAX_PAGE_SIZE {
                    if head.len() >= 2 * size && MetaPage::raw_page_size(&head[size..]) == Some(size) {
                        return Some(size);
                    }
                    size *= 2;
                }
                None
            })
            .ok_or(Error::Invalid)?;
        if head.len() < 2 * page_size {
            return Err(Error::Invalid);
        }

        let pages = len / page_size as u64;
        let candidates = [0, 1].map(|slot| {
            let meta = MetaPage::decode(&head[slot * page_size..(slot + 1) * page_size])?;
            if meta.page_size as usize != page_size || meta.last_pgno >= pages {
                return Err(Error::Corrupted);
            }
            Ok(meta)
        });
        let meta = pick_meta(candidates)?;
        Ok((page_size, meta))
    }

    /// Latest committed meta page
    pub(crate) fn current_meta(&self) -> Result<MetaPage> {
        let _guard = self.meta_lock.read();
        let candidates = [0, 1].map(|slot| MetaPage::decode(self.store.page(slot)?));
        pick_meta(candidates)
    }

    /// Fail when a snapshot reaches past the mapping of this handle.
    pub(crate) fn check_map(&self, meta: &MetaPage) -> Result<()> {
        if meta.last_pgno >= self.store.max_pgno() {
            return Err(Error::MapResized);
        }
        Ok(())
    }

    /// Make `meta` the current meta page.
    pub(crate) fn publish_meta(&self, meta: &MetaPage) -> Result<()> {
        let _guard = self.meta_lock.write();
        self.store.write_meta(meta, self.flags()).map_err(|err| {
            error!("meta write for txn {} failed: {}", meta.txnid, err);
            self.fatal.store(true, Ordering::SeqCst);
            err
        })
    }

    /// Begin a write transaction
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_write(self)
    }

    /// Begin a read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_read(self)
    }

    /// Statistics of the main database
    pub fn stat(&self) -> Result<Stat> {
        Ok(self.current_meta()?.main.stat(self.store.page_size()))
    }

    /// Environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.current_meta()?;
        Ok(EnvInfo {
            map_size: self.store.map_size(),
            last_pgno: meta.last_pgno,
            last_txnid: meta.txnid,
            max_readers: self.readers.max_readers(),
            num_readers: self.readers.num_readers(),
        })
    }

    /// Get environment flags.
    pub fn flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set or clear runtime-changeable flags.
    ///
    /// Only `NOSYNC`, `NOMETASYNC`, `MAPASYNC` and `NOMEMINIT` may change
    /// after open.
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::InvalidArgument);
        }
        if flags.contains(EnvFlags::MAPASYNC) && on && !self.flags().contains(EnvFlags::WRITEMAP) {
            return Err(Error::InvalidArgument);
        }
        if on {
            self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
        Ok(())
    }

    /// Path that was used in `open`
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File descriptor of the data file
    pub fn fd(&self) -> RawFd {
        self.store.file().as_raw_fd()
    }

    pub fn max_readers(&self) -> u32 {
        self.readers.max_readers()
    }

    pub fn max_dbs(&self) -> u32 {
        self.options.max_dbs
    }

    /// Largest key accepted; duplicate values share the limit.
    pub fn max_key_size(&self) -> usize {
        // A branch node holds a key and a duplicate separator
        MAX_KEY_SIZE.min((node_max(self.store.page_size()) - 18) / 2)
    }

    /// Change the map size.
    ///
    /// `&mut self` guarantees that no transaction is open. A size of zero
    /// adopts the size recorded by the last commit.
    pub fn set_map_size(&mut self, size: usize) -> Result<()> {
        let meta = self.current_meta()?;
        let page_size = self.store.page_size();
        let size = if size == 0 {
            (meta.map_size as usize).max(self.store.map_size())
        } else {
            size
        };
        let used = (meta.last_pgno as usize + 1) * page_size;
        if size < used {
            return Err(Error::InvalidArgument);
        }
        let size = size.next_multiple_of(page_size);
        self.store.resize(size)?;
        debug!("map size set to {}", size);
        Ok(())
    }

    /// Flush data to disk.
    ///
    /// With `force` the flush is synchronous even when the environment
    /// runs with `NOSYNC` or `MAPASYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        let flags = self.flags();
        if flags.contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        if force {
            self.store.sync(flags - EnvFlags::MAPASYNC)
        } else if !flags.contains(EnvFlags::NOSYNC) {
            self.store.sync(flags)
        } else {
            Ok(())
        }
    }

    /// Occupied reader slots
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.readers.list()
    }

    /// Clear reader slots of dead processes, returning how many were freed.
    pub fn reader_check(&self) -> usize {
        self.readers.check()
    }

    /// Release a database handle.
    ///
    /// The handle must not be used by any open transaction.
    pub fn close_db(&self, db: Database) {
        if db.dbi() != 0 {
            self.unregister_db(db.dbi());
        }
    }

    /// Close the environment; every transaction must be finished.
    pub fn close(self) {
        drop(self)
    }

    /// Library version as (major, minor, patch)
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    pub fn version_string() -> &'static str {
        VERSION_STRING.as_str()
    }

    pub(crate) fn db_name(&self, dbi: usize) -> Option<Vec<u8>> {
        self.dbs.read().get(dbi).cloned().flatten()
    }

    pub(crate) fn find_db(&self, name: &[u8]) -> Option<usize> {
        self.dbs
            .read()
            .iter()
            .position(|n| n.as_deref() == Some(name))
    }

    /// Reserve a registry slot for `name`.
    pub(crate) fn register_db(&self, name: &[u8]) -> Result<usize> {
        let mut dbs = self.dbs.write();
        if let Some(dbi) = dbs.iter().position(|n| n.as_deref() == Some(name)) {
            return Ok(dbi);
        }
        let dbi = dbs
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|i| i + 1)
            .ok_or(Error::DbsFull)?;
        dbs[dbi] = Some(name.to_vec());
        Ok(dbi)
    }

    pub(crate) fn unregister_db(&self, dbi: usize) {
        if let Some(slot) = self.dbs.write().get_mut(dbi) {
            *slot = None;
        }
    }

    pub(crate) fn options(&self) -> &EnvOptions {
        &self.options
    }

    pub(crate) fn store(&self) -> &PageStore {
        &self.store
    }

    pub(crate) fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        debug!("closing environment {}", self.path.display());
    }
}

/// Newest of the two meta candidates.
///
/// When neither validates, a version mismatch wins over a checksum
/// failure, which wins over a bad magic.
fn pick_meta(candidates: [Result<MetaPage>; 2]) -> Result<MetaPage> {
    let [a, b] = candidates;
    match (a, b) {
        (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { b } else { a }),
        (Ok(meta), Err(err)) | (Err(err), Ok(meta)) => {
            warn!("ignoring invalid meta page ({}), using txn {}", err, meta.txnid);
            Ok(meta)
        }
        (Err(a), Err(b)) => {
            let rank = |e: &Error| match e {
                Error::VersionMismatch => 3,
                Error::Corrupted => 2,
                Error::Invalid => 1,
                _ => 0,
            };
            Err(if rank(&b) > rank(&a) { b } else { a })
        }
    }
}
