use std::fs::File;
use std::os::unix::fs::FileExt as UnixFileExt;

use log::trace;
use memmap2::{MmapOptions, MmapRaw};

use crate::constants::{EnvFlags, Pgno};
use crate::error::{Error, Result};
use crate::meta::MetaPage;

/// Memory-mapped page file.
///
/// Pages are read through the map. Writes use positional file writes, or
/// go through the map itself under `WRITEMAP`. Remapping needs `&mut self`,
/// so no page slice can outlive a resize.
#[derive(Debug)]
pub(crate) struct PageStore {
    /// Data file
    file: File,
    /// Shared mapping of the data file
    map: MmapRaw,
    /// Page size of the file
    page_size: usize,
    /// Length of the mapping
    map_size: usize,
    /// Pages are written through the mapping
    writemap: bool,
}

impl PageStore {
    pub fn map(file: File, page_size: usize, map_size: usize, flags: EnvFlags) -> Result<Self> {
        let writemap = flags.contains(EnvFlags::WRITEMAP);
        let map = Self::map_file(&file, map_size, writemap)?;
        Ok(PageStore {
            file,
            map,
            page_size,
            map_size,
            writemap,
        })
    }

    fn map_file(file: &File, map_size: usize, writemap: bool) -> Result<MmapRaw> {
        if writemap && file.metadata()?.len() < map_size as u64 {
            file.set_len(map_size as u64)?;
        }
        let mut options = MmapOptions::new();
        options.len(map_size);
        let map = if writemap {
            options.map_raw(file)?
        } else {
            options.map_raw_read_only(file)?
        };
        Ok(map)
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Pages that fit in the mapping
    pub fn max_pgno(&self) -> Pgno {
        (self.map_size / self.page_size) as Pgno
    }

    /// Borrow `count` consecutive pages starting at `pgno`.
    pub fn pages(&self, pgno: Pgno, count: usize) -> Result<&[u8]> {
        let end = pgno
            .checked_add(count as u64)
            .ok_or(Error::PageNotFound)?;
        if count == 0 || end > self.max_pgno() {
            return Err(Error::PageNotFound);
        }
        let offset = pgno as usize * self.page_size;
        // SAFETY: the range lies inside the mapping, which lives as long as
        // `&self` and is only replaced through `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), count * self.page_size) })
    }

    pub fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        self.pages(pgno, 1)
    }

    /// Write a run of pages starting at `pgno`.
    pub fn write_pages(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let offset = pgno as usize * self.page_size;
        if offset + data.len() > self.map_size {
            return Err(Error::MapFull);
        }
        trace!("writing {} bytes at page {}", data.len(), pgno);
        if self.writemap {
            // SAFETY: bounds checked above; pages written here belong to the
            // single writer and are not referenced by any reader snapshot.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
            }
        } else {
            self.file.write_all_at(data, offset as u64)?;
        }
        Ok(())
    }

    /// Extend the file so that it holds at least `pages` pages.
    pub fn ensure_pages(&self, pages: u64) -> Result<()> {
        let len = pages * self.page_size as u64;
        if self.file.metadata()?.len() < len {
            self.file.set_len(len)?;
        }
        Ok(())
    }

    /// Flush data pages.
    pub fn sync(&self, flags: EnvFlags) -> Result<()> {
        if self.writemap {
            if flags.contains(EnvFlags::MAPASYNC) {
                self.map.flush_async()?;
            } else {
                self.map.flush()?;
            }
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Write `meta` into its slot and flush it unless asked not to.
    pub fn write_meta(&self, meta: &MetaPage, flags: EnvFlags) -> Result<()> {
        let slot = (meta.txnid % 2) as usize;
        let mut page = vec![0u8; self.page_size];
        meta.encode_into(slot, &mut page);
        self.write_pages(slot as Pgno, &page)?;

        if flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
            return Ok(());
        }
        if self.writemap {
            let offset = slot * self.page_size;
            if flags.contains(EnvFlags::MAPASYNC) {
                self.map.flush_async_range(offset, self.page_size)?;
            } else {
                self.map.flush_range(offset, self.page_size)?;
            }
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Grow the mapping.
    pub fn resize(&mut self, map_size: usize) -> Result<()> {
        if map_size < self.map_size {
            return Err(Error::InvalidArgument);
        }
        if map_size == self.map_size {
            return Ok(());
        }
        self.map = Self::map_file(&self.file, map_size, self.writemap)?;
        self.map_size = map_size;
        Ok(())
    }
}
