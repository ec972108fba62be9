use std::cmp::Ordering;

use crate::constants::DbFlags;

/// Key and duplicate ordering of one database, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Comparator {
    flags: DbFlags,
}

impl Comparator {
    pub fn new(flags: DbFlags) -> Self {
        Comparator { flags }
    }

    pub fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    pub fn keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.flags.contains(DbFlags::INTEGERKEY) {
            cmp_int(a, b)
        } else if self.flags.contains(DbFlags::REVERSEKEY) {
            cmp_reverse(a, b)
        } else {
            a.cmp(b)
        }
    }

    pub fn dups(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.flags.contains(DbFlags::INTEGERDUP) {
            cmp_int(a, b)
        } else if self.flags.contains(DbFlags::REVERSEDUP) {
            cmp_reverse(a, b)
        } else {
            a.cmp(b)
        }
    }

    /// Order a stored `(key, dup)` pair against a search target.
    ///
    /// A target without a duplicate sorts before every duplicate of its key.
    pub fn entry(&self, key: &[u8], dup: &[u8], target_key: &[u8], target_dup: Option<&[u8]>) -> Ordering {
        match self.keys(key, target_key) {
            Ordering::Equal if self.is_dupsort() => match target_dup {
                Some(td) => self.dups(dup, td),
                None => Ordering::Greater,
            },
            ord => ord,
        }
    }
}

/// Native-endian unsigned integers of 4 or 8 bytes
fn cmp_int(a: &[u8], b: &[u8]) -> Ordering {
    match (int_value(a), int_value(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

fn int_value(v: &[u8]) -> Option<u64> {
    match v.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(v);
            Some(u32::from_ne_bytes(b) as u64)
        }
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(v);
            Some(u64::from_ne_bytes(b))
        }
        _ => None,
    }
}

/// Compare from the last byte towards the first
fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}
