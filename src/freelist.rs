use std::collections::BTreeMap;

use log::trace;

use crate::constants::{PageFlags, Pgno, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::meta::{read_u32, read_u64};
use crate::midl::Idl;
use crate::page::{overflow_pages, write_run_header};

/// Page accounting of one write transaction.
///
/// `records` maps the id of the transaction that freed pages to those
/// pages. A record is reclaimed into `pool` once its id is older than every
/// pinned snapshot.
#[derive(Debug, Clone, Default)]
pub(crate) struct FreeState {
    /// Records loaded from the free list and not reclaimed yet
    pub records: BTreeMap<u64, Idl>,
    /// Reclaimed pages ready for reuse
    pub pool: Idl,
    /// Highest record id merged into the pool
    pub merged_max: Option<u64>,
    /// Committed pages released by this transaction
    pub freed: Idl,
    /// Pages allocated and released by this transaction
    pub loose: Vec<Pgno>,
}

impl FreeState {
    pub fn new(records: BTreeMap<u64, Idl>) -> Self {
        FreeState {
            records,
            ..Default::default()
        }
    }

    /// Take `n` consecutive reusable pages, reclaiming records below `oldest`.
    pub fn alloc(&mut self, n: usize, oldest: u64) -> Option<Pgno> {
        if n == 1 {
            if let Some(pgno) = self.loose.pop() {
                trace!("reusing loose page {}", pgno);
                return Some(pgno);
            }
        }
        loop {
            if let Some(pgno) = self.pool.take_run(n) {
                return Some(pgno);
            }
            let id = *self.records.keys().next().filter(|&&id| id < oldest)?;
            let pages = self.records.remove(&id)?;
            trace!("reclaiming {} pages freed by txn {}", pages.len(), id);
            self.pool.append_list(&pages);
            self.merged_max = Some(self.merged_max.map_or(id, |m| m.max(id)));
        }
    }

    /// Records to persist when transaction `txnid` commits.
    ///
    /// `extra` holds pages that become free with this commit, such as the
    /// previous free-list run.
    pub fn into_records(self, txnid: u64, extra: &[Pgno]) -> BTreeMap<u64, Idl> {
        let mut records = self.records;

        let mut mine = self.freed;
        for &pgno in self.loose.iter().chain(extra) {
            mine.append(pgno);
        }
        if !mine.is_empty() {
            records.insert(txnid, mine);
        }

        if let Some(id) = self.merged_max {
            if !self.pool.is_empty() {
                records.entry(id).or_default().append_list(&self.pool);
            }
        }
        records
    }
}

/// Serialize records as `txnid u64 | count u32 | pgno u64 * count`.
pub(crate) fn encode(records: &BTreeMap<u64, Idl>) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, pages) in records {
        let mut pages = pages.clone();
        let pages = pages.as_slice();
        if pages.is_empty() {
            continue;
        }
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(pages.len() as u32).to_le_bytes());
        for pgno in pages {
            out.extend_from_slice(&pgno.to_le_bytes());
        }
    }
    out
}

/// Parse a free-list run read from the data file.
pub(crate) fn decode(run: &[u8]) -> Result<BTreeMap<u64, Idl>> {
    let mut records = BTreeMap::new();
    let mut off = PAGE_HEADER_SIZE;
    while off + 12 <= run.len() {
        let id = read_u64(run, off);
        if id == 0 {
            break;
        }
        let count = read_u32(run, off + 8) as usize;
        off += 12;
        let end = off + count * 8;
        if end > run.len() {
            return Err(Error::Corrupted);
        }
        let pages = (0..count).map(|i| read_u64(run, off + i * 8)).collect();
        records.insert(id, Idl::from_vec(pages));
        off = end;
    }
    Ok(records)
}

/// Pages needed to store an encoded stream
pub(crate) fn run_len(stream: &[u8], page_size: usize) -> usize {
    if stream.is_empty() {
        return 0;
    }
    overflow_pages(stream.len(), page_size)
}

/// Build the page images of a `count`-page free-list run starting at `pgno`.
pub(crate) fn build_run(pgno: Pgno, count: usize, stream: &[u8], page_size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; count * page_size];
    write_run_header(&mut buf, pgno, PageFlags::FREELIST, count as u32);
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + stream.len()].copy_from_slice(stream);
    buf
}
