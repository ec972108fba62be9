use crate::constants::{NodeFlags, PageFlags, Pgno, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::meta::{read_u16, read_u32, read_u64};

/// Fixed part of every node: dsize u32, flags u16, ksize u16
pub(crate) const NODE_HEADER_SIZE: usize = 8;
/// Size of a slot pointer
const PTR_SIZE: usize = 2;

/// Largest node (pointer included) a page of `page_size` bytes accepts.
///
/// Any page holds at least two nodes of this size.
pub(crate) fn node_max(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 2
}

/// Usable bytes below the page header
pub(crate) fn page_room(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Number of pages needed for an overflow value of `size` bytes
pub(crate) fn overflow_pages(size: usize, page_size: usize) -> usize {
    (PAGE_HEADER_SIZE + size).div_ceil(page_size)
}

/// Read-only view over a page
#[derive(Clone, Copy)]
pub(crate) struct PageRef<'a> {
    data: &'a [u8],
}

impl<'a> PageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PageRef { data }
    }

    pub fn pgno(&self) -> Pgno {
        read_u64(self.data, 0)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(read_u16(self.data, 8))
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    /// Page count of an overflow or free-list run
    pub fn run_pages(&self) -> u32 {
        read_u32(self.data, 10)
    }

    pub fn num_keys(&self) -> usize {
        let lower = read_u16(self.data, 10) as usize;
        lower.saturating_sub(PAGE_HEADER_SIZE) / PTR_SIZE
    }

    /// Decode node `idx` of a branch or leaf page.
    pub fn node(&self, idx: usize) -> Result<NodeRef<'a>> {
        let ptr = PAGE_HEADER_SIZE + idx * PTR_SIZE;
        if idx >= self.num_keys() || ptr + PTR_SIZE > self.data.len() {
            return Err(Error::Corrupted);
        }
        let off = read_u16(self.data, ptr) as usize;
        if off + NODE_HEADER_SIZE > self.data.len() {
            return Err(Error::Corrupted);
        }
        let dsize = read_u32(self.data, off);
        let flags = NodeFlags::from_bits_truncate(read_u16(self.data, off + 4));
        let ksize = read_u16(self.data, off + 6) as usize;
        let key_start = off + NODE_HEADER_SIZE;
        let stored = if flags.contains(NodeFlags::BIGDATA) {
            8
        } else {
            dsize as usize
        };
        let end = key_start + ksize + stored;
        if end > self.data.len() {
            return Err(Error::Corrupted);
        }
        // Branch nodes and big values start with a page number
        if self.is_branch() && stored < 8 {
            return Err(Error::Corrupted);
        }
        Ok(NodeRef {
            flags,
            dsize,
            key: &self.data[key_start..key_start + ksize],
            data: &self.data[key_start + ksize..end],
        })
    }

    /// Decode all nodes into owned entries for rewriting.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        (0..self.num_keys())
            .map(|i| self.node(i).map(|n| n.to_entry()))
            .collect()
    }
}

/// Borrowed node of a page
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeRef<'a> {
    pub flags: NodeFlags,
    /// Logical data size
    pub dsize: u32,
    pub key: &'a [u8],
    /// Stored data: inline value, overflow page number or child pointer
    pub data: &'a [u8],
}

impl<'a> NodeRef<'a> {
    /// Child page of a branch node
    pub fn child(&self) -> Pgno {
        read_u64(self.data, 0)
    }

    /// Duplicate separator of a branch node
    pub fn dup(&self) -> &'a [u8] {
        &self.data[8..]
    }

    /// First overflow page of a big leaf value
    pub fn overflow_pgno(&self) -> Pgno {
        read_u64(self.data, 0)
    }

    pub fn to_entry(&self) -> Entry {
        Entry {
            flags: self.flags,
            dsize: self.dsize,
            key: self.key.to_vec(),
            data: self.data.to_vec(),
        }
    }
}

/// Owned node used while a page is being rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub flags: NodeFlags,
    pub dsize: u32,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn leaf(key: &[u8], data: &[u8]) -> Self {
        Entry {
            flags: NodeFlags::empty(),
            dsize: data.len() as u32,
            key: key.to_vec(),
            data: data.to_vec(),
        }
    }

    /// Leaf node whose value lives in an overflow run
    pub fn big(key: &[u8], size: usize, first: Pgno) -> Self {
        Entry {
            flags: NodeFlags::BIGDATA,
            dsize: size as u32,
            key: key.to_vec(),
            data: first.to_le_bytes().to_vec(),
        }
    }

    pub fn branch(key: &[u8], dup: &[u8], child: Pgno) -> Self {
        let mut data = Vec::with_capacity(8 + dup.len());
        data.extend_from_slice(&child.to_le_bytes());
        data.extend_from_slice(dup);
        Entry {
            flags: NodeFlags::empty(),
            dsize: data.len() as u32,
            key: key.to_vec(),
            data,
        }
    }

    pub fn child(&self) -> Pgno {
        read_u64(&self.data, 0)
    }

    pub fn set_child(&mut self, child: Pgno) {
        self.data[0..8].copy_from_slice(&child.to_le_bytes());
    }

    pub fn dup(&self) -> &[u8] {
        &self.data[8..]
    }

    /// Turn a branch entry into the leftmost one, which carries no separator
    pub fn clear_separator(&mut self) {
        self.key.clear();
        self.data.truncate(8);
        self.dsize = 8;
    }

    pub fn overflow_pgno(&self) -> Pgno {
        read_u64(&self.data, 0)
    }

    /// Bytes taken in a page, slot pointer included
    pub fn size(&self) -> usize {
        NODE_HEADER_SIZE + self.key.len() + self.data.len() + PTR_SIZE
    }
}

pub(crate) fn entries_size(entries: &[Entry]) -> usize {
    entries.iter().map(Entry::size).sum()
}

pub(crate) fn fits(entries: &[Entry], page_size: usize) -> bool {
    entries_size(entries) <= page_room(page_size)
}

/// Encode a branch or leaf page into `buf`.
pub(crate) fn write_page(buf: &mut [u8], pgno: Pgno, flags: PageFlags, entries: &[Entry]) -> Result<()> {
    if !fits(entries, buf.len()) {
        return Err(Error::PageFull);
    }
    buf.fill(0);
    buf[0..8].copy_from_slice(&pgno.to_le_bytes());
    buf[8..10].copy_from_slice(&flags.bits().to_le_bytes());

    let mut upper = buf.len();
    for (i, entry) in entries.iter().enumerate() {
        let len = NODE_HEADER_SIZE + entry.key.len() + entry.data.len();
        upper -= len;
        let node = &mut buf[upper..upper + len];
        node[0..4].copy_from_slice(&entry.dsize.to_le_bytes());
        node[4..6].copy_from_slice(&entry.flags.bits().to_le_bytes());
        node[6..8].copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
        node[8..8 + entry.key.len()].copy_from_slice(&entry.key);
        node[8 + entry.key.len()..].copy_from_slice(&entry.data);

        let ptr = PAGE_HEADER_SIZE + i * PTR_SIZE;
        buf[ptr..ptr + PTR_SIZE].copy_from_slice(&(upper as u16).to_le_bytes());
    }

    let lower = PAGE_HEADER_SIZE + entries.len() * PTR_SIZE;
    buf[10..12].copy_from_slice(&(lower as u16).to_le_bytes());
    buf[12..14].copy_from_slice(&(upper as u16).to_le_bytes());
    Ok(())
}

/// Write the header of an overflow or free-list run of `count` pages.
pub(crate) fn write_run_header(buf: &mut [u8], pgno: Pgno, flags: PageFlags, count: u32) {
    buf[0..8].copy_from_slice(&pgno.to_le_bytes());
    buf[8..10].copy_from_slice(&flags.bits().to_le_bytes());
    buf[10..14].copy_from_slice(&count.to_le_bytes());
}

/// Split index giving two halves that both fit, as balanced as possible.
pub(crate) fn split_point(entries: &[Entry], page_size: usize) -> Option<usize> {
    let room = page_room(page_size);
    let total = entries_size(entries);
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for i in 1..entries.len() {
        left += entries[i - 1].size();
        let right = total - left;
        if left <= room && right <= room {
            let skew = left.abs_diff(right);
            if best.map_or(true, |(_, b)| skew < b) {
                best = Some((i, skew));
            }
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;

    #[test]
    fn leaf_page_layout() {
        let entries = vec![
            Entry::leaf(b"alpha", b"1"),
            Entry::big(b"beta", 10_000, 77),
            Entry::leaf(b"gamma", b""),
        ];
        let mut buf = vec![0u8; PAGE_SIZE];
        write_page(&mut buf, 5, PageFlags::LEAF, &entries).unwrap();

        let page = PageRef::new(&buf);
        assert_eq!(page.pgno(), 5);
        assert!(page.is_leaf());
        assert_eq!(page.num_keys(), 3);
        let big = page.node(1).unwrap();
        assert!(big.flags.contains(NodeFlags::BIGDATA));
        assert_eq!(big.dsize, 10_000);
        assert_eq!(big.overflow_pgno(), 77);
        assert_eq!(page.entries().unwrap(), entries);
        assert!(page.node(3).is_err());
    }

    #[test]
    fn branch_entries_carry_children() {
        let mut first = Entry::branch(b"ignored", b"", 9);
        first.clear_separator();
        let second = Entry::branch(b"m", b"dup", 11);
        let mut buf = vec![0u8; PAGE_SIZE];
        write_page(&mut buf, 3, PageFlags::BRANCH, &[first, second]).unwrap();

        let page = PageRef::new(&buf);
        assert!(page.is_branch());
        assert_eq!(page.node(0).unwrap().key, b"");
        assert_eq!(page.node(0).unwrap().child(), 9);
        assert_eq!(page.node(1).unwrap().child(), 11);
        assert_eq!(page.node(1).unwrap().dup(), b"dup");
    }

    #[test]
    fn short_branch_node_is_corrupted() {
        let empty = Entry {
            flags: NodeFlags::empty(),
            dsize: 0,
            key: Vec::new(),
            data: Vec::new(),
        };
        let mut buf = vec![0u8; PAGE_SIZE];
        write_page(&mut buf, 4, PageFlags::BRANCH, &[empty.clone()]).unwrap();
        assert!(matches!(PageRef::new(&buf).node(0), Err(Error::Corrupted)));

        // The same node is a valid empty value on a leaf
        write_page(&mut buf, 4, PageFlags::LEAF, &[empty]).unwrap();
        assert_eq!(PageRef::new(&buf).node(0).unwrap().data, b"");
    }

    #[test]
    fn oversized_pages_split_evenly() {
        let value = vec![7u8; 900];
        let entries: Vec<Entry> = (0..6u8).map(|i| Entry::leaf(&[i], &value)).collect();
        assert!(!fits(&entries, PAGE_SIZE));
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            write_page(&mut buf, 2, PageFlags::LEAF, &entries),
            Err(Error::PageFull)
        ));
        assert_eq!(split_point(&entries, PAGE_SIZE), Some(3));
        assert_eq!(overflow_pages(10_000, PAGE_SIZE), 3);
        assert_eq!(overflow_pages(PAGE_SIZE - PAGE_HEADER_SIZE, PAGE_SIZE), 1);
    }
}
