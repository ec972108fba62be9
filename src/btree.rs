use std::cmp::Ordering;

use log::trace;

use crate::cmp::Comparator;
use crate::constants::{NodeFlags, PageFlags, Pgno, PAGE_HEADER_SIZE, P_INVALID};
use crate::error::{Error, Result};
use crate::meta::DbInfo;
use crate::page::{
    entries_size, fits, node_max, overflow_pages, page_room, split_point, write_page, write_run_header,
    Entry, NodeRef, PageRef,
};
use crate::transaction::Transaction;

/// Separator pushed to the parent when a page splits
struct Split {
    key: Vec<u8>,
    dup: Vec<u8>,
    right: Pgno,
}

/// State of a subtree after a removal
struct Removed {
    pgno: Pgno,
    keys: usize,
    underfull: bool,
    leaf: bool,
}

/// Child slot of a branch page whose range covers the target.
///
/// Slot 0 has no separator and covers everything below slot 1.
pub(crate) fn branch_index(page: &PageRef<'_>, cmp: &Comparator, key: &[u8], dup: Option<&[u8]>) -> Result<usize> {
    let (mut lo, mut hi) = (1, page.num_keys());
    while lo < hi {
        let mid = (lo + hi) / 2;
        let node = page.node(mid)?;
        if cmp.entry(node.key, node.dup(), key, dup) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo - 1)
}

/// First leaf slot not ordered before the target, and whether it matches
pub(crate) fn leaf_search(page: &PageRef<'_>, cmp: &Comparator, key: &[u8], dup: Option<&[u8]>) -> Result<(usize, bool)> {
    let n = page.num_keys();
    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        let node = page.node(mid)?;
        if cmp.entry(node.key, node.data, key, dup) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let exact = lo < n && {
        let node = page.node(lo)?;
        cmp.entry(node.key, node.data, key, dup) == Ordering::Equal
    };
    Ok((lo, exact))
}

fn branch_position(entries: &[Entry], cmp: &Comparator, key: &[u8], dup: Option<&[u8]>) -> usize {
    entries[1..].partition_point(|e| cmp.entry(&e.key, e.dup(), key, dup) != Ordering::Greater)
}

fn leaf_position(entries: &[Entry], cmp: &Comparator, key: &[u8], dup: Option<&[u8]>) -> (usize, bool) {
    let pos = entries.partition_point(|e| cmp.entry(&e.key, &e.data, key, dup) == Ordering::Less);
    let exact = pos < entries.len() && cmp.entry(&entries[pos].key, &entries[pos].data, key, dup) == Ordering::Equal;
    (pos, exact)
}

/// Fail when a branch sits at `level` but leaves are expected no deeper
/// than `depth`.
pub(crate) fn check_level(level: usize, depth: u16) -> Result<()> {
    if level + 1 >= depth as usize {
        return Err(Error::Corrupted);
    }
    Ok(())
}

/// Exact lookup of `key` in a database without duplicates.
pub(crate) fn find<'t>(txn: &'t Transaction<'_>, info: &DbInfo, key: &[u8]) -> Result<Option<NodeRef<'t>>> {
    if info.is_empty() {
        return Ok(None);
    }
    let cmp = Comparator::new(info.flags);
    let mut pgno = info.root;
    for level in 0.. {
        let page = txn.page(pgno)?;
        if page.is_branch() {
            check_level(level, info.depth)?;
            let idx = branch_index(&page, &cmp, key, None)?;
            pgno = page.node(idx)?.child();
            continue;
        }
        if !page.is_leaf() {
            return Err(Error::Corrupted);
        }
        let (idx, exact) = leaf_search(&page, &cmp, key, None)?;
        return if exact { Ok(Some(page.node(idx)?)) } else { Ok(None) };
    }
    Err(Error::Corrupted)
}

/// Insert a leaf record, replacing the value of an existing key in
/// databases without duplicates.
pub(crate) fn put(txn: &mut Transaction<'_>, info: &mut DbInfo, key: &[u8], data: &[u8], flags: NodeFlags) -> Result<()> {
    let psize = txn.page_size();
    let cmp = Comparator::new(info.flags);

    let mut entry = Entry::leaf(key, data);
    entry.flags = flags;
    if !cmp.is_dupsort() && entry.size() > node_max(psize) {
        entry = write_overflow(txn, info, key, data)?;
    }

    if info.is_empty() {
        let pgno = txn.new_pages(1)?;
        write_page(txn.page_mut(pgno)?, pgno, PageFlags::LEAF, &[entry])?;
        info.root = pgno;
        info.depth = 1;
        info.leaf_pages += 1;
        info.entries += 1;
        return Ok(());
    }

    let root = info.root;
    let (root, split, inserted) = insert(txn, &cmp, info, root, 0, entry)?;
    info.root = root;
    if let Some(split) = split {
        let mut first = Entry::branch(b"", b"", root);
        first.clear_separator();
        let entries = [first, Entry::branch(&split.key, &split.dup, split.right)];
        let pgno = txn.new_pages(1)?;
        write_page(txn.page_mut(pgno)?, pgno, PageFlags::BRANCH, &entries)?;
        trace!("root split, new root {} at depth {}", pgno, info.depth + 1);
        info.root = pgno;
        info.depth += 1;
        info.branch_pages += 1;
    }
    if inserted {
        info.entries += 1;
    }
    Ok(())
}

fn write_overflow(txn: &mut Transaction<'_>, info: &mut DbInfo, key: &[u8], data: &[u8]) -> Result<Entry> {
    let n = overflow_pages(data.len(), txn.page_size());
    let pgno = txn.new_pages(n)?;
    let buf = txn.page_mut(pgno)?;
    write_run_header(buf, pgno, PageFlags::OVERFLOW, n as u32);
    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + data.len()].copy_from_slice(data);
    info.overflow_pages += n as u64;
    Ok(Entry::big(key, data.len(), pgno))
}

fn free_overflow(txn: &mut Transaction<'_>, info: &mut DbInfo, pgno: Pgno) -> Result<()> {
    let count = txn.page(pgno)?.run_pages() as usize;
    txn.free_pages(pgno, count)?;
    info.overflow_pages = info.overflow_pages.saturating_sub(count as u64);
    Ok(())
}

fn insert(
    txn: &mut Transaction<'_>,
    cmp: &Comparator,
    info: &mut DbInfo,
    pgno: Pgno,
    level: usize,
    entry: Entry,
) -> Result<(Pgno, Option<Split>, bool)> {
    let pgno = txn.touch(pgno)?;
    let (leaf, mut entries) = {
        let page = txn.page(pgno)?;
        (page.is_leaf(), page.entries()?)
    };
    let dup = cmp.is_dupsort().then_some(entry.data.as_slice());

    let inserted = if leaf {
        let (pos, exact) = leaf_position(&entries, cmp, &entry.key, dup);
        if exact && !cmp.is_dupsort() {
            if entries[pos].flags.contains(NodeFlags::BIGDATA) {
                free_overflow(txn, info, entries[pos].overflow_pgno())?;
            }
            entries[pos] = entry;
            false
        } else {
            entries.insert(pos, entry);
            true
        }
    } else {
        check_level(level, info.depth)?;
        let idx = branch_position(&entries, cmp, &entry.key, dup);
        let child = entries[idx].child();
        let (child, split, inserted) = insert(txn, cmp, info, child, level + 1, entry)?;
        entries[idx].set_child(child);
        if let Some(split) = split {
            entries.insert(idx + 1, Entry::branch(&split.key, &split.dup, split.right));
        }
        inserted
    };

    let split = store(txn, cmp, info, pgno, leaf, entries)?;
    Ok((pgno, split, inserted))
}

/// Write `entries` back into `pgno`, splitting into a new right sibling if
/// they do not fit.
fn store(
    txn: &mut Transaction<'_>,
    cmp: &Comparator,
    info: &mut DbInfo,
    pgno: Pgno,
    leaf: bool,
    mut entries: Vec<Entry>,
) -> Result<Option<Split>> {
    let psize = txn.page_size();
    let flags = if leaf { PageFlags::LEAF } else { PageFlags::BRANCH };
    if fits(&entries, psize) {
        write_page(txn.page_mut(pgno)?, pgno, flags, &entries)?;
        return Ok(None);
    }

    let at = split_point(&entries, psize).ok_or(Error::PageFull)?;
    let mut right_entries = entries.split_off(at);
    let key = right_entries[0].key.clone();
    let dup = if leaf {
        if cmp.is_dupsort() {
            right_entries[0].data.clone()
        } else {
            Vec::new()
        }
    } else {
        let dup = right_entries[0].dup().to_vec();
        right_entries[0].clear_separator();
        dup
    };

    let right = txn.new_pages(1)?;
    write_page(txn.page_mut(pgno)?, pgno, flags, &entries)?;
    write_page(txn.page_mut(right)?, right, flags, &right_entries)?;
    if leaf {
        info.leaf_pages += 1;
    } else {
        info.branch_pages += 1;
    }
    trace!("split page {} at {}, right sibling {}", pgno, at, right);
    Ok(Some(Split { key, dup, right }))
}

/// Remove the record matching `key` (and `dup` in duplicate databases).
pub(crate) fn delete(txn: &mut Transaction<'_>, info: &mut DbInfo, key: &[u8], dup: Option<&[u8]>) -> Result<()> {
    if info.is_empty() {
        return Err(Error::NotFound);
    }
    let cmp = Comparator::new(info.flags);
    let root = info.root;
    let removed = remove(txn, &cmp, info, root, 0, key, dup)?;
    info.root = removed.pgno;
    info.entries = info.entries.saturating_sub(1);

    if removed.keys == 0 {
        txn.free_pages(removed.pgno, 1)?;
        if removed.leaf {
            info.leaf_pages = info.leaf_pages.saturating_sub(1);
        } else {
            info.branch_pages = info.branch_pages.saturating_sub(1);
        }
        info.root = P_INVALID;
        info.depth = 0;
        return Ok(());
    }

    // A root with a single child is replaced by that child
    loop {
        let child = {
            let page = txn.page(info.root)?;
            if !page.is_branch() || page.num_keys() != 1 {
                break;
            }
            check_level(0, info.depth)?;
            page.node(0)?.child()
        };
        txn.free_pages(info.root, 1)?;
        info.root = child;
        info.depth -= 1;
        info.branch_pages = info.branch_pages.saturating_sub(1);
    }
    Ok(())
}

fn remove(
    txn: &mut Transaction<'_>,
    cmp: &Comparator,
    info: &mut DbInfo,
    pgno: Pgno,
    level: usize,
    key: &[u8],
    dup: Option<&[u8]>,
) -> Result<Removed> {
    let pgno = txn.touch(pgno)?;
    let (leaf, mut entries) = {
        let page = txn.page(pgno)?;
        (page.is_leaf(), page.entries()?)
    };

    if leaf {
        let (pos, exact) = leaf_position(&entries, cmp, key, dup);
        if !exact {
            return Err(Error::NotFound);
        }
        let old = entries.remove(pos);
        if old.flags.contains(NodeFlags::BIGDATA) {
            free_overflow(txn, info, old.overflow_pgno())?;
        }
    } else {
        check_level(level, info.depth)?;
        let idx = branch_position(&entries, cmp, key, dup);
        let child = remove(txn, cmp, info, entries[idx].child(), level + 1, key, dup)?;
        entries[idx].set_child(child.pgno);
        if child.keys == 0 {
            txn.free_pages(child.pgno, 1)?;
            if child.leaf {
                info.leaf_pages = info.leaf_pages.saturating_sub(1);
            } else {
                info.branch_pages = info.branch_pages.saturating_sub(1);
            }
            entries.remove(idx);
            if idx == 0 {
                if let Some(first) = entries.first_mut() {
                    first.clear_separator();
                }
            }
        } else if child.underfull {
            merge(txn, info, &mut entries, idx)?;
        }
    }

    let psize = txn.page_size();
    let underfull = entries_size(&entries) < page_room(psize) / 4;
    let flags = if leaf { PageFlags::LEAF } else { PageFlags::BRANCH };
    write_page(txn.page_mut(pgno)?, pgno, flags, &entries)?;
    Ok(Removed {
        pgno,
        keys: entries.len(),
        underfull,
        leaf,
    })
}

/// Fold child `idx` of a branch together with a neighbour when both fit in
/// one page.
fn merge(txn: &mut Transaction<'_>, info: &mut DbInfo, entries: &mut Vec<Entry>, idx: usize) -> Result<()> {
    let (left, right) = if idx + 1 < entries.len() {
        (idx, idx + 1)
    } else if idx > 0 {
        (idx - 1, idx)
    } else {
        return Ok(());
    };
    let left_pgno = entries[left].child();
    let right_pgno = entries[right].child();

    let (leaf, mut merged, mut right_entries) = {
        let lp = txn.page(left_pgno)?;
        let rp = txn.page(right_pgno)?;
        if lp.is_leaf() != rp.is_leaf() {
            return Err(Error::Corrupted);
        }
        (lp.is_leaf(), lp.entries()?, rp.entries()?)
    };
    if !leaf {
        // The right page's first child gets the separator held by the parent
        let child = right_entries[0].child();
        right_entries[0] = Entry::branch(&entries[right].key, entries[right].dup(), child);
    }
    merged.append(&mut right_entries);
    if !fits(&merged, txn.page_size()) {
        return Ok(());
    }

    let new_left = txn.touch(left_pgno)?;
    let flags = if leaf { PageFlags::LEAF } else { PageFlags::BRANCH };
    write_page(txn.page_mut(new_left)?, new_left, flags, &merged)?;
    txn.free_pages(right_pgno, 1)?;
    if leaf {
        info.leaf_pages = info.leaf_pages.saturating_sub(1);
    } else {
        info.branch_pages = info.branch_pages.saturating_sub(1);
    }
    entries[left].set_child(new_left);
    entries.remove(right);
    trace!("merged page {} into {}", right_pgno, new_left);
    Ok(())
}

/// Release every page of the tree of `info`.
pub(crate) fn free_tree(txn: &mut Transaction<'_>, info: &DbInfo) -> Result<()> {
    free_subtree(txn, info.root, 0, info.depth)
}

fn free_subtree(txn: &mut Transaction<'_>, pgno: Pgno, level: usize, depth: u16) -> Result<()> {
    let (children, runs) = {
        let page = txn.page(pgno)?;
        if page.is_branch() {
            check_level(level, depth)?;
        }
        let mut children = Vec::new();
        let mut runs = Vec::new();
        for i in 0..page.num_keys() {
            let node = page.node(i)?;
            if page.is_branch() {
                children.push(node.child());
            } else if node.flags.contains(NodeFlags::BIGDATA) {
                let first = node.overflow_pgno();
                runs.push((first, txn.page(first)?.run_pages() as usize));
            }
        }
        (children, runs)
    };
    for child in children {
        free_subtree(txn, child, level + 1, depth)?;
    }
    for (first, count) in runs {
        txn.free_pages(first, count)?;
    }
    txn.free_pages(pgno, 1)
}

/// Whether any leaf of the tree holds a named database record
pub(crate) fn has_subdata(txn: &Transaction<'_>, info: &DbInfo) -> Result<bool> {
    subdata_below(txn, info.root, 0, info.depth)
}

fn subdata_below(txn: &Transaction<'_>, pgno: Pgno, level: usize, depth: u16) -> Result<bool> {
    let page = txn.page(pgno)?;
    if page.is_branch() {
        check_level(level, depth)?;
    }
    for i in 0..page.num_keys() {
        let node = page.node(i)?;
        if page.is_branch() {
            if subdata_below(txn, node.child(), level + 1, depth)? {
                return Ok(true);
            }
        } else if node.flags.contains(NodeFlags::SUBDATA) {
            return Ok(true);
        }
    }
    Ok(false)
}
