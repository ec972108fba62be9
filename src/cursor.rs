use std::cmp::Ordering;

use crate::btree::{branch_index, check_level, leaf_search};
use crate::cmp::Comparator;
use crate::constants::Pgno;
use crate::error::{Error, Result};
use crate::meta::DbInfo;
use crate::page::NodeRef;
use crate::transaction::Transaction;

/// A key/value pair borrowed from the transaction
pub type Item<'txn> = (&'txn [u8], &'txn [u8]);

/// Read position inside one database.
///
/// Records are visited in `(key, duplicate)` order. Returned slices live as
/// long as the transaction, so they stay valid while the cursor moves.
#[derive(Clone)]
pub struct Cursor<'txn> {
    txn: &'txn Transaction<'txn>,
    info: DbInfo,
    cmp: Comparator,
    /// Page and slot per tree level, leaf last
    stack: Vec<(Pgno, usize)>,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("txn", &self.txn.id())
            .field("stack", &self.stack)
            .finish()
    }
}

impl<'txn> Cursor<'txn> {
    pub(crate) fn new(txn: &'txn Transaction<'txn>, info: DbInfo) -> Result<Self> {
        txn.check_read()?;
        Ok(Cursor {
            txn,
            info,
            cmp: Comparator::new(info.flags),
            stack: Vec::with_capacity(info.depth as usize),
        })
    }

    /// Position at the first record
    pub fn first(&mut self) -> Result<Option<Item<'txn>>> {
        if !self.descend_edge(true)? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Position at the last record
    pub fn last(&mut self) -> Result<Option<Item<'txn>>> {
        if !self.descend_edge(false)? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Record under the cursor
    pub fn get_current(&self) -> Result<Option<Item<'txn>>> {
        match self.node()? {
            Some(node) => Ok(Some((node.key, self.txn.node_data(&node)?))),
            None => Ok(None),
        }
    }

    /// Move to the next record; an unpositioned cursor starts at the first.
    pub fn next(&mut self) -> Result<Option<Item<'txn>>> {
        if self.stack.is_empty() {
            return self.first();
        }
        if !self.step(true)? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Move to the previous record; an unpositioned cursor starts at the last.
    pub fn prev(&mut self) -> Result<Option<Item<'txn>>> {
        if self.stack.is_empty() {
            return self.last();
        }
        if !self.step(false)? {
            return Ok(None);
        }
        self.get_current()
    }

    /// Position at `key`, on its first duplicate.
    pub fn set(&mut self, key: &[u8]) -> Result<Option<Item<'txn>>> {
        match self.seek(key, None)? {
            Some(node) if self.cmp.keys(node.key, key) == Ordering::Equal => self.get_current(),
            _ => Ok(None),
        }
    }

    /// Position at the first key greater than or equal to `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Item<'txn>>> {
        match self.seek(key, None)? {
            Some(_) => self.get_current(),
            None => Ok(None),
        }
    }

    /// Position at the exact `key`/`data` pair.
    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Item<'txn>>> {
        match self.get_both_range(key, data)? {
            Some((k, v)) if self.same_dup(v, data) => Ok(Some((k, v))),
            _ => Ok(None),
        }
    }

    /// Position at `key` on the first duplicate not below `data`.
    pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Item<'txn>>> {
        if !self.cmp.is_dupsort() {
            return self.set(key);
        }
        match self.seek(key, Some(data))? {
            Some(node) if self.cmp.keys(node.key, key) == Ordering::Equal => self.get_current(),
            _ => Ok(None),
        }
    }

    fn same_dup(&self, stored: &[u8], data: &[u8]) -> bool {
        if self.cmp.is_dupsort() {
            self.cmp.dups(stored, data) == Ordering::Equal
        } else {
            stored == data
        }
    }

    /// First duplicate of the current key
    pub fn first_dup(&mut self) -> Result<Option<Item<'txn>>> {
        match self.get_current()? {
            Some((key, _)) => self.set(key),
            None => Ok(None),
        }
    }

    /// Last duplicate of the current key
    pub fn last_dup(&mut self) -> Result<Option<Item<'txn>>> {
        let mut last = self.get_current()?;
        while let Some(item) = self.next_dup()? {
            last = Some(item);
        }
        Ok(last)
    }

    /// Next duplicate of the current key, staying put when there is none.
    pub fn next_dup(&mut self) -> Result<Option<Item<'txn>>> {
        self.step_within_key(true)
    }

    /// Previous duplicate of the current key, staying put when there is none.
    pub fn prev_dup(&mut self) -> Result<Option<Item<'txn>>> {
        self.step_within_key(false)
    }

    /// First record of the next key
    pub fn next_nodup(&mut self) -> Result<Option<Item<'txn>>> {
        let Some((key, _)) = self.get_current()? else {
            return self.first();
        };
        while let Some(item) = self.next()? {
            if self.cmp.keys(item.0, key) != Ordering::Equal {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Last record of the previous key
    pub fn prev_nodup(&mut self) -> Result<Option<Item<'txn>>> {
        let Some((key, _)) = self.get_current()? else {
            return self.last();
        };
        while let Some(item) = self.prev()? {
            if self.cmp.keys(item.0, key) != Ordering::Equal {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Number of duplicates of the current key
    pub fn count(&self) -> Result<usize> {
        let Some((key, _)) = self.get_current()? else {
            return Ok(0);
        };
        if !self.cmp.is_dupsort() {
            return Ok(1);
        }
        let mut probe = self.clone();
        let mut count = 0;
        let mut item = probe.set(key)?;
        while item.is_some() {
            count += 1;
            item = probe.next_dup()?;
        }
        Ok(count)
    }

    fn step_within_key(&mut self, forward: bool) -> Result<Option<Item<'txn>>> {
        if !self.cmp.is_dupsort() {
            return Ok(None);
        }
        let Some((key, _)) = self.get_current()? else {
            return Ok(None);
        };
        let saved = self.stack.clone();
        if self.step(forward)? {
            if let Some(item) = self.get_current()? {
                if self.cmp.keys(item.0, key) == Ordering::Equal {
                    return Ok(Some(item));
                }
            }
        }
        self.stack = saved;
        Ok(None)
    }

    fn node(&self) -> Result<Option<NodeRef<'txn>>> {
        let Some(&(pgno, idx)) = self.stack.last() else {
            return Ok(None);
        };
        let page = self.txn.page(pgno)?;
        if idx >= page.num_keys() {
            return Ok(None);
        }
        Ok(Some(page.node(idx)?))
    }

    /// Walk down the leftmost or rightmost path of the tree.
    fn descend_edge(&mut self, leftmost: bool) -> Result<bool> {
        self.stack.clear();
        if self.info.is_empty() {
            return Ok(false);
        }
        self.push_edge(self.info.root, leftmost)?;
        Ok(true)
    }

    fn push_edge(&mut self, mut pgno: Pgno, leftmost: bool) -> Result<()> {
        loop {
            let page = self.txn.page(pgno)?;
            let idx = if leftmost { 0 } else { page.num_keys().saturating_sub(1) };
            self.stack.push((pgno, idx));
            if !page.is_branch() {
                return Ok(());
            }
            check_level(self.stack.len() - 1, self.info.depth)?;
            pgno = page.node(idx)?.child();
        }
    }

    /// Move one record forward or backward across leaves.
    fn step(&mut self, forward: bool) -> Result<bool> {
        for level in (0..self.stack.len()).rev() {
            let (pgno, idx) = self.stack[level];
            let keys = self.txn.page(pgno)?.num_keys();
            let target = if forward {
                (idx + 1 < keys).then_some(idx + 1)
            } else {
                idx.checked_sub(1).filter(|&i| i < keys)
            };
            let Some(target) = target else {
                continue;
            };
            self.stack.truncate(level);
            self.stack.push((pgno, target));
            let page = self.txn.page(pgno)?;
            if page.is_branch() {
                self.push_edge(page.node(target)?.child(), forward)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Position at the first record not ordered before `(key, dup)`.
    pub(crate) fn seek(&mut self, key: &[u8], dup: Option<&[u8]>) -> Result<Option<NodeRef<'txn>>> {
        self.stack.clear();
        if self.info.is_empty() {
            return Ok(None);
        }
        let mut pgno = self.info.root;
        loop {
            let page = self.txn.page(pgno)?;
            if page.is_branch() {
                check_level(self.stack.len(), self.info.depth)?;
                let idx = branch_index(&page, &self.cmp, key, dup)?;
                self.stack.push((pgno, idx));
                pgno = page.node(idx)?.child();
                continue;
            }
            if !page.is_leaf() {
                return Err(Error::Corrupted);
            }
            let (idx, _) = leaf_search(&page, &self.cmp, key, dup)?;
            let keys = page.num_keys();
            if idx < keys {
                self.stack.push((pgno, idx));
                return self.node();
            }
            // Past the end of this leaf: the match starts the next one
            self.stack.push((pgno, keys.saturating_sub(1)));
            if self.step(true)? {
                return self.node();
            }
            return Ok(None);
        }
    }
}

enum Start {
    First,
    From(Vec<u8>),
    DupsOf(Vec<u8>),
}

/// Ordered iterator over the records of a database.
///
/// Yields `Result` items and stops after the first error.
pub struct Iter<'txn> {
    cursor: Cursor<'txn>,
    start: Option<Start>,
    dup_of: Option<Vec<u8>>,
    done: bool,
}

impl<'txn> Iter<'txn> {
    pub(crate) fn new(cursor: Cursor<'txn>) -> Self {
        Iter {
            cursor,
            start: Some(Start::First),
            dup_of: None,
            done: false,
        }
    }

    pub(crate) fn from_key(cursor: Cursor<'txn>, key: &[u8]) -> Self {
        Iter {
            start: Some(Start::From(key.to_vec())),
            ..Iter::new(cursor)
        }
    }

    pub(crate) fn dups_of(cursor: Cursor<'txn>, key: &[u8]) -> Self {
        Iter {
            start: Some(Start::DupsOf(key.to_vec())),
            dup_of: Some(key.to_vec()),
            ..Iter::new(cursor)
        }
    }

    fn advance(&mut self) -> Result<Option<Item<'txn>>> {
        match self.start.take() {
            Some(Start::First) => self.cursor.first(),
            Some(Start::From(key)) => self.cursor.set_range(&key),
            Some(Start::DupsOf(key)) => self.cursor.set(&key),
            None if self.dup_of.is_some() => self.cursor.next_dup(),
            None => self.cursor.next(),
        }
    }
}

impl<'txn> Iterator for Iter<'txn> {
    type Item = Result<Item<'txn>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
