//! Disk manager for page-level file I/O.
//!
//! One data file, fixed-size pages, direct I/O where the platform
//! supports it. Page 0 is the metadata page: it persists the free list,
//! the allocation high-water mark and the per-tree root pointers, and
//! is rewritten on close.

use crate::aligned::AlignedBuf;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tern_common::page::{PageId, METADATA_PAGE_ID, PAGE_SIZE};
use tern_common::{Metadata, Result};
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Number of zero-filled pages appended when the file runs out.
const GROWTH_CHUNK_PAGES: usize = 16;

/// Manages reading, writing, allocating and deallocating pages in the
/// data file.
pub struct DiskManager {
    /// The data file, opened with O_DIRECT when configured.
    file: File,
    /// In-memory image of the metadata page, shared with the engine and
    /// the trees.
    metadata: Arc<RwLock<Metadata>>,
    /// Physical file length in pages. Held for the whole of a page
    /// allocation so concurrent allocators cannot hand out one id twice
    /// or extend the file twice.
    file_pages: Mutex<u64>,
}

impl DiskManager {
    /// Opens the data file at `path`, creating it if absent.
    ///
    /// A new file gets a fresh metadata page written at page 0; an
    /// existing file has its metadata page read back and decoded.
    pub fn open(path: &Path, direct_io: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        apply_direct_io(&mut options, direct_io);

        let file = options.open(path)?;
        let file_len = file.metadata()?.len();

        let disk = Self {
            file,
            metadata: Arc::new(RwLock::new(Metadata::default())),
            file_pages: Mutex::new(file_len / PAGE_SIZE as u64),
        };

        if file_len < PAGE_SIZE as u64 {
            info!(path = %path.display(), "disk.open.create");
            disk.write_metadata_page()?;
            *disk.file_pages.lock() = 1;
        } else {
            let mut buf = AlignedBuf::page();
            disk.read_page(METADATA_PAGE_ID, &mut buf)?;
            *disk.metadata.write() = Metadata::decode(&buf)?;
            info!(path = %path.display(), pages = file_len / PAGE_SIZE as u64, "disk.open.existing");
        }

        Ok(disk)
    }

    /// Returns the shared metadata image.
    pub fn metadata(&self) -> Arc<RwLock<Metadata>> {
        Arc::clone(&self.metadata)
    }

    /// Reads one page into `buf`, which must be page-sized and, under
    /// direct I/O, page-aligned. Fails on a short read.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        self.file.read_exact_at(buf, page_id.file_offset())?;
        Ok(())
    }

    /// Writes one page. `data` must be page-sized and, under direct
    /// I/O, page-aligned.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.file.write_all_at(data, page_id.file_offset())?;
        Ok(())
    }

    /// Allocates a page identifier, reusing the free list head when one
    /// is available and growing the file by a zeroed chunk otherwise.
    ///
    /// The returned page is allocated on disk but carries no content
    /// contract beyond "was zeroed at file extension".
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut file_pages = self.file_pages.lock();

        {
            let mut meta = self.metadata.write();
            if !meta.deallocated_page_ids.is_empty() {
                let page_id = meta.deallocated_page_ids.remove(0);
                debug!(%page_id, "disk.allocate.reuse");
                return Ok(page_id);
            }
        }

        let next = self.metadata.read().max_allocated_page_id + 1;
        if next >= *file_pages {
            let chunk = AlignedBuf::with_pages(GROWTH_CHUNK_PAGES);
            self.file
                .write_all_at(&chunk, *file_pages * PAGE_SIZE as u64)?;
            *file_pages += GROWTH_CHUNK_PAGES as u64;
            debug!(pages = *file_pages, "disk.allocate.grow");
        }

        self.metadata.write().max_allocated_page_id = next;
        Ok(PageId(next))
    }

    /// Returns a page identifier to the free list.
    ///
    /// Deallocating an id twice is a caller bug and is not policed.
    pub fn deallocate_page(&self, page_id: PageId) {
        self.metadata.write().deallocated_page_ids.push(page_id);
    }

    /// Writes the metadata page and syncs the file. The file itself is
    /// closed when the manager is dropped.
    pub fn close(&self) -> Result<()> {
        self.write_metadata_page()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn write_metadata_page(&self) -> Result<()> {
        let image = self.metadata.read().encode()?;
        let mut buf = AlignedBuf::page();
        buf.copy_from_slice(&image);
        self.write_page(METADATA_PAGE_ID, &buf)
    }
}

#[cfg(target_os = "linux")]
fn apply_direct_io(options: &mut OpenOptions, direct_io: bool) {
    use std::os::unix::fs::OpenOptionsExt;
    if direct_io {
        options.custom_flags(libc::O_DIRECT);
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_direct_io(_options: &mut OpenOptions, _direct_io: bool) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_disk(dir: &tempfile::TempDir) -> DiskManager {
        DiskManager::open(&dir.path().join("test.db"), false).unwrap()
    }

    #[test]
    fn test_open_creates_metadata_page() {
        let dir = tempdir().unwrap();
        let disk = open_disk(&dir);

        let meta = disk.metadata();
        let meta = meta.read();
        assert_eq!(meta.max_allocated_page_id, 0);
        assert!(meta.deallocated_page_ids.is_empty());
    }

    #[test]
    fn test_allocate_extends_file_in_chunks() {
        let dir = tempdir().unwrap();
        let disk = open_disk(&dir);

        assert_eq!(disk.allocate_page().unwrap(), PageId(1));
        assert_eq!(disk.allocate_page().unwrap(), PageId(2));

        // One chunk covers the first growth.
        let len = std::fs::metadata(dir.path().join("test.db")).unwrap().len();
        assert_eq!(len, (1 + GROWTH_CHUNK_PAGES as u64) * PAGE_SIZE as u64);
    }

    #[test]
    fn test_allocate_reuses_freed_pages_head_first() {
        let dir = tempdir().unwrap();
        let disk = open_disk(&dir);

        let p1 = disk.allocate_page().unwrap();
        let p2 = disk.allocate_page().unwrap();
        let _p3 = disk.allocate_page().unwrap();

        disk.deallocate_page(p2);
        disk.deallocate_page(p1);

        assert_eq!(disk.allocate_page().unwrap(), p2);
        assert_eq!(disk.allocate_page().unwrap(), p1);
        assert_eq!(disk.allocate_page().unwrap(), PageId(4));
    }

    #[test]
    fn test_write_read_page() {
        let dir = tempdir().unwrap();
        let disk = open_disk(&dir);

        let page_id = disk.allocate_page().unwrap();
        let mut data = AlignedBuf::page();
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xEF;
        disk.write_page(page_id, &data).unwrap();

        let mut read_back = AlignedBuf::page();
        disk.read_page(page_id, &mut read_back).unwrap();
        assert_eq!(read_back[0], 0xAB);
        assert_eq!(read_back[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_metadata_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let disk = DiskManager::open(&path, false).unwrap();
            let p1 = disk.allocate_page().unwrap();
            disk.allocate_page().unwrap();
            disk.deallocate_page(p1);
            disk.metadata().write().root_pages.insert(7, PageId(2));
            disk.close().unwrap();
        }

        {
            let disk = DiskManager::open(&path, false).unwrap();
            let meta = disk.metadata();
            let meta = meta.read();
            assert_eq!(meta.max_allocated_page_id, 2);
            assert_eq!(meta.deallocated_page_ids, vec![PageId(1)]);
            assert_eq!(meta.root_pages.get(&7), Some(&PageId(2)));
        }
    }

    #[test]
    fn test_read_unallocated_page_fails() {
        let dir = tempdir().unwrap();
        let disk = open_disk(&dir);

        let mut buf = AlignedBuf::page();
        assert!(disk.read_page(PageId(500), &mut buf).is_err());
    }
}
