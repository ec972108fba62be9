use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::debug;

use crate::btree::check_level;
use crate::constants::{EnvFlags, NodeFlags, PageFlags, Pgno, DATA_NAME, META_PAGES, P_INVALID};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::meta::{DbInfo, MetaPage};
use crate::page::write_page;
use crate::transaction::Transaction;

impl Environment {
    /// Write a consistent copy of the environment to `dest`.
    ///
    /// `dest` is an existing directory, or the new data file itself under
    /// `NOSUBDIR`. With `compact` only live pages are written, renumbered
    /// from the front of the file.
    pub fn copy<P: AsRef<Path>>(&self, dest: P, compact: bool) -> Result<()> {
        let dest = dest.as_ref();
        let path = if self.flags().contains(EnvFlags::NOSUBDIR) {
            dest.to_path_buf()
        } else {
            dest.join(DATA_NAME)
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(self.options().mode)
            .open(&path)?;
        self.copy_to(&mut file, compact)?;
        file.sync_all()?;
        debug!("copied environment to {}", path.display());
        Ok(())
    }

    /// Stream a consistent copy of the environment into `out`.
    ///
    /// The copy reads from a snapshot, so the writer is never blocked.
    pub fn copy_to<W: Write>(&self, out: &mut W, compact: bool) -> Result<()> {
        let txn = self.begin_ro_txn()?;
        let result = if compact {
            copy_compact(&txn, out)
        } else {
            copy_plain(&txn, out)
        };
        txn.abort();
        result
    }
}

fn write_metas<W: Write>(out: &mut W, meta: &MetaPage, page_size: usize) -> Result<()> {
    let mut page = vec![0u8; page_size];
    for slot in 0..META_PAGES {
        meta.encode_into(slot, &mut page);
        out.write_all(&page)?;
    }
    Ok(())
}

/// Page-for-page copy of the snapshot
fn copy_plain<W: Write>(txn: &Transaction<'_>, out: &mut W) -> Result<()> {
    let meta = *txn.meta();
    write_metas(out, &meta, txn.page_size())?;
    let count = meta.last_pgno + 1 - META_PAGES as Pgno;
    if count > 0 {
        out.write_all(txn.pages(META_PAGES as Pgno, count as usize)?)?;
    }
    debug!("plain copy of txn {}: {} pages", meta.txnid, meta.last_pgno + 1);
    Ok(())
}

fn copy_compact<W: Write>(txn: &Transaction<'_>, out: &mut W) -> Result<()> {
    let mut meta = *txn.meta();
    let live = if meta.main.is_empty() {
        0
    } else {
        count_pages(txn, meta.main.root, 0, meta.main.depth)?
    };

    // Pages are emitted in post-order, so the main root comes last
    let last_pgno = META_PAGES as Pgno - 1 + live;
    if !meta.main.is_empty() {
        meta.main.root = last_pgno;
    }
    meta.last_pgno = last_pgno;
    meta.free_pgno = P_INVALID;
    meta.free_len = 0;
    write_metas(out, &meta, txn.page_size())?;

    if live > 0 {
        let mut compactor = Compactor {
            txn,
            out,
            next: META_PAGES as Pgno,
        };
        let main = txn.meta().main;
        let root = compactor.emit(main.root, 0, main.depth)?;
        if root != last_pgno {
            return Err(Error::Corrupted);
        }
    }
    debug!("compact copy of txn {}: {} live pages", meta.txnid, live);
    Ok(())
}

/// Live pages reachable from `pgno`, named databases and overflow runs included
fn count_pages(txn: &Transaction<'_>, pgno: Pgno, level: usize, depth: u16) -> Result<u64> {
    let page = txn.page(pgno)?;
    if page.is_branch() {
        check_level(level, depth)?;
    }
    let mut count = 1;
    for i in 0..page.num_keys() {
        let node = page.node(i)?;
        if page.is_branch() {
            count += count_pages(txn, node.child(), level + 1, depth)?;
        } else if node.flags.contains(NodeFlags::BIGDATA) {
            count += txn.page(node.overflow_pgno())?.run_pages() as u64;
        } else if node.flags.contains(NodeFlags::SUBDATA) {
            let info = DbInfo::decode(node.data)?;
            if !info.is_empty() {
                count += count_pages(txn, info.root, 0, info.depth)?;
            }
        }
    }
    Ok(count)
}

/// Writes live pages in post-order under new, dense page numbers
struct Compactor<'a, 'env, W> {
    txn: &'a Transaction<'env>,
    out: &'a mut W,
    next: Pgno,
}

impl<W: Write> Compactor<'_, '_, W> {
    fn emit(&mut self, pgno: Pgno, level: usize, depth: u16) -> Result<Pgno> {
        let txn = self.txn;
        let page = txn.page(pgno)?;
        let branch = page.is_branch();
        if branch {
            check_level(level, depth)?;
        }
        let mut entries = page.entries()?;

        for entry in &mut entries {
            if branch {
                let child = self.emit(entry.child(), level + 1, depth)?;
                entry.set_child(child);
            } else if entry.flags.contains(NodeFlags::BIGDATA) {
                let first = entry.overflow_pgno();
                let count = txn.page(first)?.run_pages() as usize;
                let mut run = txn.pages(first, count)?.to_vec();
                let target = self.next;
                run[0..8].copy_from_slice(&target.to_le_bytes());
                self.out.write_all(&run)?;
                self.next += count as Pgno;
                entry.data = target.to_le_bytes().to_vec();
            } else if entry.flags.contains(NodeFlags::SUBDATA) {
                let mut info = DbInfo::decode(&entry.data)?;
                if !info.is_empty() {
                    info.root = self.emit(info.root, 0, info.depth)?;
                    entry.data = info.encode().to_vec();
                }
            }
        }

        let target = self.next;
        self.next += 1;
        let flags = if branch { PageFlags::BRANCH } else { PageFlags::LEAF };
        let mut buf = vec![0u8; txn.page_size()];
        write_page(&mut buf, target, flags, &entries)?;
        self.out.write_all(&buf)?;
        Ok(target)
    }
}
