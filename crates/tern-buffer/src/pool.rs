//! Buffer pool manager.
//!
//! A fixed array of page frames, a page table mapping resident page ids
//! to frames, a free-frame list and an LRU replacer over the unpinned
//! frames. Callers never see frames directly: access goes through RAII
//! read/write guards that pin the frame and hold its reader/writer lock
//! for the guard's lifetime.
//!
//! Locking discipline: page table, then free-frame list, then replacer
//! internals, then a frame's pin mutex. Frame data locks are never
//! acquired while a pool-level mutex is held, except for frames that
//! are unreachable through the page table (freshly chosen victims and
//! free frames), whose data locks are uncontended by construction.

use crate::aligned::AlignedBuf;
use crate::disk::DiskManager;
use crate::frame::{Frame, FrameId};
use crate::replacer::{LruReplacer, Replacer};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tern_common::page::layout;
use tern_common::page::PageId;
use tern_common::{Metadata, Result, TernError};
use tracing::warn;

/// Buffer pool manager.
pub struct BufferPool {
    /// Fixed array of frames, each with a preallocated aligned buffer.
    frames: Vec<Frame>,
    /// Resident pages: page id to frame index.
    page_table: RwLock<HashMap<PageId, FrameId>>,
    /// Frames holding no page.
    free_frames: Mutex<Vec<FrameId>>,
    /// Unpinned resident frames, in recency order.
    replacer: LruReplacer,
    /// The file under the pool.
    disk: DiskManager,
}

impl BufferPool {
    /// Creates a pool of `num_frames` frames over the given file.
    pub fn new(num_frames: usize, disk: DiskManager) -> Self {
        let frames: Vec<_> = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();
        // Popped from the back, so frame 0 is handed out first.
        let free_frames: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            frames,
            page_table: RwLock::new(HashMap::with_capacity(num_frames)),
            free_frames: Mutex::new(free_frames),
            replacer: LruReplacer::new(num_frames),
            disk,
        }
    }

    /// Returns the shared metadata image of the underlying file.
    pub fn metadata(&self) -> Arc<RwLock<Metadata>> {
        self.disk.metadata()
    }

    /// Allocates a page on disk. The page is not resident until a guard
    /// is taken on it, and is handed out zero-filled: a reused free-list
    /// page comes back carrying its previous image otherwise.
    pub fn new_page(&self) -> Result<PageId> {
        let page_id = self.disk.allocate_page()?;
        let zeroes = AlignedBuf::page();
        if let Err(e) = self.disk.write_page(page_id, &zeroes) {
            self.disk.deallocate_page(page_id);
            return Err(e);
        }
        Ok(page_id)
    }

    /// Returns an allocated-but-never-populated page to the free list,
    /// for the caller whose guard acquisition failed after allocation.
    pub fn cleanup_page(&self, page_id: PageId) {
        self.disk.deallocate_page(page_id);
    }

    /// Acquires a shared guard on a page, fetching it into the pool if
    /// necessary.
    pub fn new_read_guard(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.fetch(page_id)?;
        let data = frame.read_data();
        Ok(PageReadGuard {
            pool: self,
            frame,
            data: Some(data),
        })
    }

    /// Acquires an exclusive guard on a page, fetching it into the pool
    /// if necessary.
    pub fn new_write_guard(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.fetch(page_id)?;
        let data = frame.write_data();
        Ok(PageWriteGuard {
            pool: self,
            frame,
            data: Some(data),
            defused: false,
        })
    }

    /// Flushes every dirty frame and writes the metadata page.
    pub fn close(&self) -> Result<()> {
        for frame in &self.frames {
            if let Some(page_id) = frame.page_id() {
                if frame.is_dirty() {
                    let data = frame.read_data();
                    self.disk.write_page(page_id, &data)?;
                    drop(data);
                    frame.set_dirty(false);
                }
            }
        }
        self.disk.close()
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames holding no page.
    pub fn free_count(&self) -> usize {
        self.free_frames.lock().len()
    }

    /// Returns the number of resident pages.
    pub fn cached_pages(&self) -> usize {
        self.page_table.read().len()
    }

    /// Pins the frame holding `page_id`, loading the page on a miss.
    ///
    /// The hit path runs under the shared page-table lock. On a miss the
    /// disk read happens before the exclusive section, so a lost race
    /// costs one redundant read; frame selection, the rare dirty
    /// write-back and the table insert run under the exclusive lock so
    /// that no other thread can pin the victim mid-eviction.
    fn fetch(&self, page_id: PageId) -> Result<&Frame> {
        {
            let table = self.page_table.read();
            if let Some(&frame_id) = table.get(&page_id) {
                return Ok(self.pin_resident(frame_id));
            }
        }

        let mut buf = AlignedBuf::page();
        self.disk.read_page(page_id, &mut buf)?;
        verify_checksum(page_id, &buf)?;

        let mut table = self.page_table.write();
        if let Some(&frame_id) = table.get(&page_id) {
            return Ok(self.pin_resident(frame_id));
        }

        let frame_id = self.acquire_frame(&mut table)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.install(page_id, &buf);
        table.insert(page_id, frame_id);
        Ok(frame)
    }

    /// Pin path for a page already in the table. Caller holds the page
    /// table in either mode, which excludes eviction of this frame. The
    /// replacer update happens under the pin mutex so a concurrent
    /// unpin cannot interleave its own replacer call.
    fn pin_resident(&self, frame_id: FrameId) -> &Frame {
        let frame = &self.frames[frame_id.0 as usize];
        let mut pins = frame.pin_lock();
        *pins += 1;
        if *pins == 1 {
            self.replacer.remove(frame_id);
        }
        frame
    }

    /// Picks a frame for a new page: the free list first, then an LRU
    /// victim, writing the victim back if dirty. Caller holds the page
    /// table exclusively.
    fn acquire_frame(
        &self,
        table: &mut HashMap<PageId, FrameId>,
    ) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.lock().pop() {
            return Ok(frame_id);
        }

        let victim_id = self.replacer.victim().ok_or(TernError::PoolExhausted)?;
        let victim = &self.frames[victim_id.0 as usize];
        let old_page = victim
            .page_id()
            .expect("replacer tracked a frame holding no page");

        if victim.is_dirty() {
            let data = victim.read_data();
            if let Err(e) = self.disk.write_page(old_page, &data) {
                drop(data);
                // The frame stays resident and dirty; nothing is lost.
                self.replacer.insert(victim_id);
                warn!(page_id = %old_page, error = %e, "pool.evict.writeback_failed");
                return Err(e);
            }
            victim.set_dirty(false);
        }

        table.remove(&old_page);
        Ok(victim_id)
    }

    /// Releases one pin. On the transition to unpinned the frame becomes
    /// an eviction candidate; the replacer insert happens under the pin
    /// mutex, mirroring `pin_resident`.
    fn unpin(&self, frame: &Frame) {
        let _table = self.page_table.read();
        let mut pins = frame.pin_lock();
        debug_assert!(*pins > 0, "unpin of unpinned {}", frame.frame_id());
        *pins -= 1;
        if *pins == 0 {
            self.replacer.insert(frame.frame_id());
        }
    }
}

/// Rejects pages whose stored checksum does not match their content.
/// Never-populated pages carry no checksum and are exempt.
fn verify_checksum(page_id: PageId, page: &[u8]) -> Result<()> {
    if page[layout::PAGE_FILLED_OFFSET] == layout::PAGE_EMPTY {
        return Ok(());
    }
    let stored = u32::from_le_bytes(page[..4].try_into().expect("4-byte slice"));
    if crc32fast::hash(&page[layout::CRC_COVER_START..]) != stored {
        return Err(TernError::Corruption { page_id: page_id.0 });
    }
    Ok(())
}

/// RAII shared guard over one page's bytes.
///
/// Holding the guard pins the frame and holds its read lock; both are
/// released on drop.
pub struct PageReadGuard<'a> {
    pool: &'a BufferPool,
    frame: &'a Frame,
    data: Option<RwLockReadGuard<'a, AlignedBuf>>,
}

impl PageReadGuard<'_> {
    /// Returns the guarded page's id.
    pub fn page_id(&self) -> PageId {
        self.frame.page_id().expect("guarded frame holds a page")
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().expect("read guard released")
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        // Lock release strictly precedes the unpin so that a pin count
        // of zero implies no one holds the data lock.
        self.data.take();
        self.pool.unpin(self.frame);
    }
}

/// RAII exclusive guard over one page's bytes.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    frame: &'a Frame,
    data: Option<RwLockWriteGuard<'a, AlignedBuf>>,
    defused: bool,
}

impl PageWriteGuard<'_> {
    /// Returns the guarded page's id.
    pub fn page_id(&self) -> PageId {
        self.frame.page_id().expect("guarded frame holds a page")
    }

    /// Marks the page dirty so it is written back on eviction or close.
    pub fn set_dirty(&self) {
        self.frame.set_dirty(true);
    }

    /// Drops the page entirely: removes it from the pool and returns its
    /// identifier to the free list.
    ///
    /// Fails with `PageInUse` if any other guard exists on the page, in
    /// which case nothing is deleted and this guard releases normally.
    pub fn delete_page(mut self) -> Result<()> {
        let mut table = self.pool.page_table.write();
        // Pins move only under the page-table lock, so this check holds
        // for the whole deletion.
        if self.frame.pin_count() != 1 {
            let page_id = self.page_id().0;
            drop(table);
            return Err(TernError::PageInUse { page_id });
        }

        let page_id = self.page_id();
        table.remove(&page_id);
        self.data.take();
        self.frame.reset();
        self.pool.free_frames.lock().push(self.frame.frame_id());
        drop(table);

        self.pool.disk.deallocate_page(page_id);
        self.defused = true;
        Ok(())
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().expect("write guard released")
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("write guard released")
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        self.data.take();
        self.pool.unpin(self.frame);
    }
}
