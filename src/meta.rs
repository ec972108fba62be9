use crc32fast::Hasher;

use crate::constants::{
    DbFlags, PageFlags, Pgno, DATA_VERSION, MAX_PAGE_SIZE, MDB_MAGIC, MIN_PAGE_SIZE,
    PAGE_HEADER_SIZE, P_INVALID,
};
use crate::error::{Error, Result};
use crate::types::Stat;

/// Encoded size of a database root record
pub(crate) const DB_INFO_SIZE: usize = 48;

/// Offset of the meta body inside a meta page
const META_BODY: usize = PAGE_HEADER_SIZE;
/// Bytes covered by the checksum
const META_CHECKED: usize = 56 + DB_INFO_SIZE;
/// Meta body plus trailing checksum
pub(crate) const META_SIZE: usize = META_CHECKED + 4;

/// Root record of one B-tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DbInfo {
    /// Persistent database flags
    pub flags: DbFlags,
    /// Depth of B-tree
    pub depth: u16,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
    /// Root page number
    pub root: Pgno,
}

impl DbInfo {
    pub fn empty(flags: DbFlags) -> Self {
        DbInfo {
            flags: flags.persistent(),
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root == P_INVALID
    }

    pub fn encode(&self) -> [u8; DB_INFO_SIZE] {
        let mut buf = [0u8; DB_INFO_SIZE];
        buf[0..2].copy_from_slice(&(self.flags.bits() as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.branch_pages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.leaf_pages.to_le_bytes());
        buf[24..32].copy_from_slice(&self.overflow_pages.to_le_bytes());
        buf[32..40].copy_from_slice(&self.entries.to_le_bytes());
        buf[40..48].copy_from_slice(&self.root.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DB_INFO_SIZE {
            return Err(Error::Corrupted);
        }
        let flags = DbFlags::from_bits(read_u16(buf, 0) as u32).ok_or(Error::Corrupted)?;
        Ok(DbInfo {
            flags,
            depth: read_u16(buf, 2),
            branch_pages: read_u64(buf, 8),
            leaf_pages: read_u64(buf, 16),
            overflow_pages: read_u64(buf, 24),
            entries: read_u64(buf, 32),
            root: read_u64(buf, 40),
        })
    }

    pub fn stat(&self, page_size: usize) -> Stat {
        Stat {
            psize: page_size as u32,
            depth: self.depth as u32,
            branch_pages: self.branch_pages,
            leaf_pages: self.leaf_pages,
            overflow_pages: self.overflow_pages,
            entries: self.entries,
        }
    }
}

/// Decoded meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaPage {
    /// Page size of the data file
    pub page_size: u32,
    /// Size of the mmap region when committed
    pub map_size: u64,
    /// Last used page in the data file
    pub last_pgno: Pgno,
    /// Transaction that committed this meta
    pub txnid: u64,
    /// First page of the free-list run
    pub free_pgno: Pgno,
    /// Length of the free-list run in pages
    pub free_len: u64,
    /// Root record of the main database
    pub main: DbInfo,
}

impl MetaPage {
    /// Meta of a freshly created file.
    pub fn initial(page_size: usize, map_size: usize) -> Self {
        MetaPage {
            page_size: page_size as u32,
            map_size: map_size as u64,
            last_pgno: 1,
            txnid: 0,
            free_pgno: P_INVALID,
            free_len: 0,
            main: DbInfo::empty(DbFlags::empty()),
        }
    }

    /// Write this meta as page `slot` into `page`.
    pub fn encode_into(&self, slot: usize, page: &mut [u8]) {
        page.fill(0);
        page[0..8].copy_from_slice(&(slot as u64).to_le_bytes());
        page[8..10].copy_from_slice(&PageFlags::META.bits().to_le_bytes());

        let body = &mut page[META_BODY..META_BODY + META_SIZE];
        body[0..4].copy_from_slice(&MDB_MAGIC.to_le_bytes());
        body[4..8].copy_from_slice(&DATA_VERSION.to_le_bytes());
        body[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        body[16..24].copy_from_slice(&self.map_size.to_le_bytes());
        body[24..32].copy_from_slice(&self.last_pgno.to_le_bytes());
        body[32..40].copy_from_slice(&self.txnid.to_le_bytes());
        body[40..48].copy_from_slice(&self.free_pgno.to_le_bytes());
        body[48..56].copy_from_slice(&self.free_len.to_le_bytes());
        body[56..56 + DB_INFO_SIZE].copy_from_slice(&self.main.encode());

        let crc = checksum(&body[..META_CHECKED]);
        body[META_CHECKED..META_SIZE].copy_from_slice(&crc.to_le_bytes());
    }

    /// Validate and decode the meta stored at the start of `page`.
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < META_BODY + META_SIZE {
            return Err(Error::Invalid);
        }
        let body = &page[META_BODY..META_BODY + META_SIZE];
        if read_u32(body, 0) != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        if read_u32(body, 4) != DATA_VERSION {
            return Err(Error::VersionMismatch);
        }
        if checksum(&body[..META_CHECKED]) != read_u32(body, META_CHECKED) {
            return Err(Error::Corrupted);
        }

        let page_size = read_u32(body, 8);
        if !valid_page_size(page_size as usize) {
            return Err(Error::Corrupted);
        }

        Ok(MetaPage {
            page_size,
            map_size: read_u64(body, 16),
            last_pgno: read_u64(body, 24),
            txnid: read_u64(body, 32),
            free_pgno: read_u64(body, 40),
            free_len: read_u64(body, 48),
            main: DbInfo::decode(&body[56..56 + DB_INFO_SIZE])?,
        })
    }

    /// Page size recorded in a meta page, whether or not it validates
    pub fn raw_page_size(page: &[u8]) -> Option<usize> {
        if page.len() < META_BODY + 12 {
            return None;
        }
        let size = read_u32(&page[META_BODY..], 8) as usize;
        valid_page_size(size).then_some(size)
    }
}

pub(crate) fn valid_page_size(size: usize) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two()
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[inline]
pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}
