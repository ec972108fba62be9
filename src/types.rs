use crate::constants::Pgno;

/// Statistics of one database tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
}

/// Environment information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data memory map
    pub map_size: usize,
    /// Last page number used in the data file
    pub last_pgno: Pgno,
    /// Id of the last committed transaction
    pub last_txnid: u64,
    /// Number of reader slots
    pub max_readers: u32,
    /// Number of reader slots currently in use
    pub num_readers: u32,
}

/// One occupied reader slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Slot index in the reader table
    pub slot: usize,
    /// Process owning the slot
    pub pid: u32,
    /// Snapshot pinned by the slot, `None` while the slot is being published
    pub txnid: Option<u64>,
}
