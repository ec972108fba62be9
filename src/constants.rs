use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        const FIXEDMAP = 0x01;
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const WRITEMAP = 0x80000;
        const MAPASYNC = 0x100000;
        const NOTLS = 0x200000;
        const NOLOCK = 0x400000;
        const NORDAHEAD = 0x800000;
        const NOMEMINIT = 0x1000000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

impl DbFlags {
    /// Flags stored with the database root and fixed at creation.
    pub const PERSISTENT: DbFlags = DbFlags::REVERSEKEY
        .union(DbFlags::DUPSORT)
        .union(DbFlags::INTEGERKEY)
        .union(DbFlags::DUPFIXED)
        .union(DbFlags::INTEGERDUP)
        .union(DbFlags::REVERSEDUP);

    pub(crate) fn persistent(self) -> DbFlags {
        self & DbFlags::PERSISTENT
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
    }
}

// Transaction state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TxnFlags: u32 {
        const RDONLY = 0x20000;
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const RESET = 0x04;
    }
}

// Node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u16 {
        const BIGDATA = 0x01;
        const SUBDATA = 0x02;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
        const FREELIST = 0x10;
    }
}

/// Page number within the data file.
pub type Pgno = u64;

/// Marker for "no page".
pub const P_INVALID: Pgno = u64::MAX;

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Smallest and largest page sizes accepted from an existing meta page
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 32768;
/// Size of the common page header
pub const PAGE_HEADER_SIZE: usize = 16;
/// Magic number identifying a data file
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Magic number identifying a lock file
pub const LOCK_MAGIC: u32 = 0xBEEF_10CC;
/// On-disk format version of data and lock files
pub const DATA_VERSION: u32 = 1;
pub const LOCK_VERSION: u32 = 1;
/// Library version numbers
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 9;
pub const VERSION_PATCH: u32 = 70;
/// Meta pages at the front of the file
pub const META_PAGES: usize = 2;
/// Id of the unnamed database
pub const MAIN_DBI: usize = 0;

pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_DBS: u32 = 0;
pub const MAX_KEY_SIZE: usize = 511;

/// File names used in directory mode
pub const DATA_NAME: &str = "data.mdb";
pub const LOCK_NAME: &str = "lock.mdb";
/// Suffix of the lock file in NOSUBDIR mode
pub const LOCK_SUFFIX: &str = "-lock";
