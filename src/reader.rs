use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt as UnixFileExt, OpenOptionsExt};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use fs2::FileExt;
use log::{debug, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::constants::{LOCK_MAGIC, LOCK_VERSION};
use crate::error::{Error, Result};
use crate::meta::read_u32;
use crate::types::ReaderInfo;

/// Size of the lock file header
const LOCK_HEADER_SIZE: usize = 64;
/// Slot txnid while the reader has not published a snapshot
const UNPUBLISHED: u64 = u64::MAX;

/// One reader slot, laid out identically in memory and in the lock file
#[repr(C)]
pub(crate) struct ReaderSlot {
    /// Owning process, 0 when free
    pid: AtomicU32,
    _pad: u32,
    /// Snapshot pinned by the reader
    txnid: AtomicU64,
    _reserved: [u64; 6],
}

impl ReaderSlot {
    fn new() -> Self {
        ReaderSlot {
            pid: AtomicU32::new(0),
            _pad: 0,
            txnid: AtomicU64::new(UNPUBLISHED),
            _reserved: [0; 6],
        }
    }
}

const SLOT_SIZE: usize = std::mem::size_of::<ReaderSlot>();

enum Slots {
    /// Shared table in the lock file
    Mapped { _file: File, map: MmapRaw },
    /// Process-local table used with `NOLOCK`
    Local(Box<[ReaderSlot]>),
}

/// Bounded table of reader slots pinning snapshots
pub(crate) struct ReaderTable {
    slots: Slots,
    max_readers: u32,
    pid: u32,
}

impl std::fmt::Debug for ReaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderTable")
            .field("max_readers", &self.max_readers)
            .field("num_readers", &self.num_readers())
            .finish()
    }
}

impl ReaderTable {
    /// Table kept in process memory.
    pub fn local(max_readers: u32) -> Self {
        let slots = (0..max_readers).map(|_| ReaderSlot::new()).collect();
        ReaderTable {
            slots: Slots::Local(slots),
            max_readers,
            pid: process::id(),
        }
    }

    /// Open or initialize the shared table in the lock file.
    ///
    /// The first process to get an exclusive lock resets the table; every
    /// user then holds a shared lock for as long as the table is mapped.
    pub fn open(path: &Path, max_readers: u32, mode: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(mode)
            .open(path)?;

        if FileExt::try_lock_exclusive(&file).is_ok() {
            debug!("initializing reader table {} with {} slots", path.display(), max_readers);
            let mut header = [0u8; LOCK_HEADER_SIZE];
            header[0..4].copy_from_slice(&LOCK_MAGIC.to_le_bytes());
            header[4..8].copy_from_slice(&LOCK_VERSION.to_le_bytes());
            header[8..12].copy_from_slice(&max_readers.to_le_bytes());

            file.set_len(0)?;
            file.set_len((LOCK_HEADER_SIZE + max_readers as usize * SLOT_SIZE) as u64)?;
            file.write_all_at(&header, 0)?;
            // Idle slots must read as unpublished
            let idle = UNPUBLISHED.to_le_bytes();
            for i in 0..max_readers as usize {
                file.write_all_at(&idle, (LOCK_HEADER_SIZE + i * SLOT_SIZE + 8) as u64)?;
            }
            FileExt::unlock(&file)?;
        }
        FileExt::lock_shared(&file)?;

        // Another process may own the table, so trust its header
        let mut header = [0u8; LOCK_HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        if read_u32(&header, 0) != LOCK_MAGIC {
            return Err(Error::Invalid);
        }
        if read_u32(&header, 4) != LOCK_VERSION {
            return Err(Error::VersionMismatch);
        }
        let max_readers = read_u32(&header, 8);
        let len = LOCK_HEADER_SIZE + max_readers as usize * SLOT_SIZE;
        if max_readers == 0 || file.metadata()?.len() < len as u64 {
            return Err(Error::Invalid);
        }

        let map = MmapOptions::new().len(len).map_raw(&file)?;
        Ok(ReaderTable {
            slots: Slots::Mapped { _file: file, map },
            max_readers,
            pid: process::id(),
        })
    }

    fn slots(&self) -> &[ReaderSlot] {
        match &self.slots {
            // SAFETY: the mapping covers the header and `max_readers` slots,
            // is page aligned and only accessed through atomics.
            Slots::Mapped { map, .. } => unsafe {
                std::slice::from_raw_parts(
                    map.as_ptr().add(LOCK_HEADER_SIZE) as *const ReaderSlot,
                    self.max_readers as usize,
                )
            },
            Slots::Local(slots) => slots,
        }
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Claim a free slot for this process.
    pub fn acquire(&self) -> Result<usize> {
        for (i, slot) in self.slots().iter().enumerate() {
            if slot
                .pid
                .compare_exchange(0, self.pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.txnid.store(UNPUBLISHED, Ordering::SeqCst);
                return Ok(i);
            }
        }
        Err(Error::ReadersFull)
    }

    /// Pin snapshot `txnid` in `slot`.
    pub fn publish(&self, slot: usize, txnid: u64) -> Result<()> {
        let slot = self.owned(slot)?;
        slot.txnid.store(txnid, Ordering::SeqCst);
        Ok(())
    }

    /// Unpin the snapshot of `slot` and hand the slot back.
    pub fn release(&self, slot: usize) -> Result<()> {
        let slot = self.owned(slot)?;
        slot.txnid.store(UNPUBLISHED, Ordering::SeqCst);
        slot.pid.store(0, Ordering::Release);
        Ok(())
    }

    fn owned(&self, slot: usize) -> Result<&ReaderSlot> {
        let entry = self.slots().get(slot).ok_or(Error::BadRslot)?;
        if entry.pid.load(Ordering::Acquire) != self.pid {
            return Err(Error::BadRslot);
        }
        Ok(entry)
    }

    /// Oldest snapshot pinned by any reader
    pub fn oldest(&self) -> Option<u64> {
        self.slots()
            .iter()
            .filter(|s| s.pid.load(Ordering::Acquire) != 0)
            .map(|s| s.txnid.load(Ordering::SeqCst))
            .filter(|&t| t != UNPUBLISHED)
            .min()
    }

    pub fn num_readers(&self) -> u32 {
        self.slots()
            .iter()
            .filter(|s| s.pid.load(Ordering::Relaxed) != 0)
            .count() as u32
    }

    pub fn list(&self) -> Vec<ReaderInfo> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let pid = s.pid.load(Ordering::Acquire);
                if pid == 0 {
                    return None;
                }
                let txnid = s.txnid.load(Ordering::Acquire);
                Some(ReaderInfo {
                    slot: i,
                    pid,
                    txnid: (txnid != UNPUBLISHED).then_some(txnid),
                })
            })
            .collect()
    }

    /// Clear slots owned by processes that no longer exist.
    pub fn check(&self) -> usize {
        let mut cleared = 0;
        for (i, slot) in self.slots().iter().enumerate() {
            let pid = slot.pid.load(Ordering::Acquire);
            if pid == 0 || pid == self.pid || process_alive(pid) {
                continue;
            }
            warn!("clearing stale reader slot {} of dead process {}", i, pid);
            slot.txnid.store(UNPUBLISHED, Ordering::SeqCst);
            if slot
                .pid
                .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn slots_are_bounded() {
        let table = ReaderTable::local(2);
        let a = table.acquire().unwrap();
        let b = table.acquire().unwrap();
        assert!(matches!(table.acquire(), Err(Error::ReadersFull)));
        assert_eq!(table.num_readers(), 2);

        table.publish(a, 5).unwrap();
        table.publish(b, 3).unwrap();
        assert_eq!(table.oldest(), Some(3));

        table.release(b).unwrap();
        assert_eq!(table.oldest(), Some(5));
        assert!(matches!(table.release(b), Err(Error::BadRslot)));
        assert!(table.acquire().is_ok());
    }

    #[test]
    fn lock_file_table_is_shared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        let first = ReaderTable::open(&path, 4, 0o644).unwrap();
        let second = ReaderTable::open(&path, 8, 0o644).unwrap();
        assert_eq!(second.max_readers(), 4);

        let slot = first.acquire().unwrap();
        first.publish(slot, 9).unwrap();
        assert_eq!(second.oldest(), Some(9));
        assert_eq!(second.list()[0].txnid, Some(9));
        assert_eq!(second.check(), 0);
        first.release(slot).unwrap();
        assert_eq!(second.num_readers(), 0);
    }
}
