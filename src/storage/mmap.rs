//! # Read-Only Memory Map
//!
//! `MmapRegion` wraps the shared, read-only mapping of the database file.
//! All snapshot reads go through it; the writer never touches it except to
//! remap when the file grows, and transfers bytes to disk exclusively with
//! positioned writes on the file descriptor.
//!
//! ## Size Ladder
//!
//! The map is usually larger than the file so that growth rarely forces a
//! remap: sizes double from 32 KiB up to 1 GiB, then advance in 1 GiB
//! steps, capped at just under 2 GiB (the maximum database size). Pages
//! past the end of the file are never dereferenced; every access is
//! bounded by the active meta's high-water mark, and the file is grown
//! before any page beyond the old end is published.
//!
//! ## Remapping
//!
//! The region lives behind the database's mmap `RwLock`. Transactions pin
//! it with the read half for their whole lifetime, so a remap (write half)
//! waits until no transaction can observe the old window.

use std::fs::File;

use eyre::{bail, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use crate::config::{MAX_MAP_SIZE, MAX_MMAP_STEP, MIN_MMAP_SIZE, PAGE_HEADER_SIZE};
use crate::storage::page::PageHeader;
use crate::storage::{Meta, Pgid};

/// Picks the map size for a desired minimum: the next power of two from
/// 32 KiB up to 1 GiB, then the next 1 GiB step, capped at 2 GiB.
pub fn mmap_size(size: usize) -> Result<usize> {
    let mut step = MIN_MMAP_SIZE;
    while step <= MAX_MMAP_STEP {
        if size <= step {
            return Ok(step);
        }
        step *= 2;
    }

    if size > MAX_MAP_SIZE {
        bail!("mmap too large: {} exceeds {} byte cap", size, MAX_MAP_SIZE);
    }

    let mut sz = size;
    let remainder = sz % MAX_MMAP_STEP;
    if remainder > 0 {
        sz += MAX_MMAP_STEP - remainder;
    }
    if sz > MAX_MAP_SIZE {
        sz = MAX_MAP_SIZE;
    }
    Ok(sz)
}

#[derive(Debug, Default)]
pub struct MmapRegion {
    map: Option<Mmap>,
    size: usize,
}

impl MmapRegion {
    pub fn unmapped() -> Self {
        Self::default()
    }

    /// Drops the current mapping and maps `size` bytes of `file` shared
    /// and read-only.
    pub fn remap(&mut self, file: &File, size: usize) -> Result<()> {
        // Unmap first so the address space is free for the new window.
        self.map = None;
        self.size = 0;

        // SAFETY: Mmap::map is unsafe because the underlying file could be
        // truncated or modified externally while mapped. This is safe because:
        // 1. The process holds an advisory file lock for the database's
        //    lifetime, and the single writer only ever appends pages.
        // 2. The mapping is read-only; no view handed out can mutate it.
        // 3. Accesses are bounded by the committed high-water mark, which
        //    never points past the synced end of the file.
        let map = unsafe {
            MmapOptions::new()
                .len(size)
                .map(file)
                .wrap_err("failed to memory-map database file")?
        };

        self.map = Some(map);
        self.size = size;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn data(&self) -> &[u8] {
        self.map.as_ref().expect("database file is not mapped")
    }

    /// The full run (head page plus overflow pages) starting at `id`.
    pub fn page(&self, id: Pgid, page_size: usize) -> &[u8] {
        let pos = id as usize * page_size;
        assert!(
            pos + page_size <= self.size,
            "page {} beyond mapped region ({} bytes)",
            id,
            self.size
        );

        let header =
            PageHeader::from_bytes(&self.data()[pos..pos + page_size]).expect("page header");
        let len = (header.overflow() as usize + 1) * page_size;
        assert!(
            pos + len <= self.size,
            "page run {}+{} beyond mapped region",
            id,
            header.overflow()
        );
        &self.data()[pos..pos + len]
    }

    /// Transient view of the meta struct on page `idx` (0 or 1).
    pub fn meta_view(&self, idx: usize, page_size: usize) -> Result<&Meta> {
        let pos = idx * page_size + PAGE_HEADER_SIZE;
        Meta::from_bytes(&self.data()[pos..])
    }

    /// The newer of the two metas that validates, copied out. When only
    /// one validates it wins regardless of age; when neither does, the
    /// error of the newer one is returned.
    pub fn meta(&self, page_size: usize) -> Result<Meta> {
        let meta0 = self.meta_view(0, page_size)?;
        let meta1 = self.meta_view(1, page_size)?;

        let (newer, older) = if meta1.txid() > meta0.txid() {
            (meta1, meta0)
        } else {
            (meta0, meta1)
        };

        match newer.validate() {
            Ok(()) => Ok(*newer),
            Err(newer_err) => match older.validate() {
                Ok(()) => Ok(*older),
                Err(_) => Err(newer_err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAGIC;
    use std::io::Write;

    #[test]
    fn size_ladder_doubles_up_to_a_gigabyte() {
        assert_eq!(mmap_size(0).unwrap(), MIN_MMAP_SIZE);
        assert_eq!(mmap_size(MIN_MMAP_SIZE).unwrap(), MIN_MMAP_SIZE);
        assert_eq!(mmap_size(MIN_MMAP_SIZE + 1).unwrap(), MIN_MMAP_SIZE * 2);
        assert_eq!(mmap_size(1 << 20).unwrap(), 1 << 20);
        assert_eq!(mmap_size((1 << 20) + 1).unwrap(), 1 << 21);
        assert_eq!(mmap_size(1 << 30).unwrap(), 1 << 30);
    }

    #[test]
    fn size_ladder_steps_then_clamps_above_a_gigabyte() {
        // One past 1 GiB rounds to the 2 GiB step, which is clamped to the cap.
        assert_eq!(mmap_size((1 << 30) + 1).unwrap(), MAX_MAP_SIZE);
        assert_eq!(mmap_size(MAX_MAP_SIZE).unwrap(), MAX_MAP_SIZE);
    }

    #[test]
    fn sizes_above_the_cap_are_rejected() {
        assert!(mmap_size(MAX_MAP_SIZE + 1).is_err());
    }

    #[test]
    fn maps_and_reads_meta_pages() {
        let page_size = 4096usize;
        let mut file = tempfile::tempfile().unwrap();
        let mut buf = vec![0u8; page_size * 4];
        for i in 0..2u64 {
            let mut meta = Meta::new(page_size as u32);
            meta.set_txid(i);
            meta.write_into(&mut buf[i as usize * page_size..]);
        }
        file.write_all(&buf).unwrap();

        let mut region = MmapRegion::unmapped();
        region.remap(&file, mmap_size(buf.len()).unwrap()).unwrap();

        let meta = region.meta(page_size).unwrap();
        assert_eq!(meta.magic(), MAGIC);
        assert_eq!(meta.txid(), 1);
        assert_eq!(meta.pgid_hwm(), 4);
    }

    #[test]
    fn falls_back_to_the_older_meta_when_the_newer_is_corrupt() {
        let page_size = 4096usize;
        let mut file = tempfile::tempfile().unwrap();
        let mut buf = vec![0u8; page_size * 4];
        for i in 0..2u64 {
            let mut meta = Meta::new(page_size as u32);
            meta.set_txid(i);
            meta.write_into(&mut buf[i as usize * page_size..]);
        }
        // Corrupt meta 1 (the newer) after its checksum was computed.
        buf[page_size + PAGE_HEADER_SIZE + 40] ^= 0xFF;
        file.write_all(&buf).unwrap();

        let mut region = MmapRegion::unmapped();
        region.remap(&file, mmap_size(buf.len()).unwrap()).unwrap();

        let meta = region.meta(page_size).unwrap();
        assert_eq!(meta.txid(), 0);
    }
}
