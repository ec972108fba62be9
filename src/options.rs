use crate::constants::{EnvFlags, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS};
use crate::error::{Error, Result};

/// What `begin_txn` does while another write transaction is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Wait until the current writer finishes
    #[default]
    Block,
    /// Return `Error::BadTxn` immediately
    Fail,
}

/// Immutable configuration used to open an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOptions {
    /// Requested map size, `None` keeps the stored size or the default
    pub map_size: Option<usize>,
    /// Number of reader slots
    pub max_readers: u32,
    /// Number of named databases
    pub max_dbs: u32,
    /// Environment flags
    pub flags: EnvFlags,
    /// Writer contention policy
    pub write_policy: WritePolicy,
    /// Permission bits for newly created files
    pub mode: u32,
}

impl Default for EnvOptions {
    fn default() -> Self {
        EnvOptions {
            map_size: None,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            flags: EnvFlags::empty(),
            write_policy: WritePolicy::Block,
            mode: 0o644,
        }
    }
}

impl EnvOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = Some(size);
        self
    }

    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    pub fn max_dbs(mut self, dbs: u32) -> Self {
        self.max_dbs = dbs;
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Reject option sets that cannot describe a usable environment.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_readers == 0 {
            return Err(Error::InvalidArgument);
        }
        // Writes go through the map only when it is writable
        if self.flags.contains(EnvFlags::RDONLY | EnvFlags::WRITEMAP) {
            return Err(Error::InvalidArgument);
        }
        if self.flags.contains(EnvFlags::MAPASYNC) && !self.flags.contains(EnvFlags::WRITEMAP) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Build options from raw flag bits, rejecting unknown ones.
    pub fn with_raw_flags(self, bits: u32) -> Result<Self> {
        let flags = EnvFlags::from_bits(bits).ok_or(Error::InvalidArgument)?;
        Ok(self.flags(flags))
    }
}
