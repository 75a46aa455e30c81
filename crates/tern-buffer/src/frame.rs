//! Buffer frame management.

use crate::aligned::AlignedBuf;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tern_common::page::PageId;

/// Sentinel value indicating no page is loaded in the frame.
const NO_PAGE: u64 = u64::MAX;

/// Unique identifier for a frame in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame in the buffer pool holding a single page.
///
/// The buffer is allocated once, page-aligned, and reused for the life
/// of the pool. The reader/writer lock over the buffer is what guard
/// handles acquire; the pin count keeps the frame out of the replacer
/// while any guard exists.
pub struct Frame {
    /// Frame identifier, the index into the pool's frame array.
    frame_id: FrameId,
    /// The page currently stored in this frame (NO_PAGE = none).
    page_id: AtomicU64,
    /// Page data buffer.
    data: RwLock<AlignedBuf>,
    /// Number of guards currently holding this frame.
    pin_count: Mutex<u32>,
    /// Whether the buffer diverged from the on-disk page.
    is_dirty: AtomicBool,
}

impl Frame {
    /// Creates a new empty buffer frame with its aligned buffer.
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(NO_PAGE),
            data: RwLock::new(AlignedBuf::page()),
            pin_count: Mutex::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Returns the frame ID.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page currently stored in this frame.
    pub fn page_id(&self) -> Option<PageId> {
        let raw = self.page_id.load(Ordering::Acquire);
        if raw == NO_PAGE {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Locks the pin count.
    ///
    /// The replacer update for a pin transition must happen while this
    /// lock is held: otherwise an unpin racing a re-pin can reorder
    /// their replacer calls and leave a pinned frame evictable.
    pub fn pin_lock(&self) -> MutexGuard<'_, u32> {
        self.pin_count.lock()
    }

    /// Returns the current pin count.
    pub fn pin_count(&self) -> u32 {
        *self.pin_count.lock()
    }

    /// Returns true if this frame is dirty.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Marks this frame dirty or clean.
    pub fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::Release);
    }

    /// Reads the page data.
    pub fn read_data(&self) -> RwLockReadGuard<'_, AlignedBuf> {
        self.data.read()
    }

    /// Writes to the page data.
    pub fn write_data(&self) -> RwLockWriteGuard<'_, AlignedBuf> {
        self.data.write()
    }

    /// Loads a page image into the frame: copies `src` into the buffer,
    /// records the page id, clears the dirty flag and pins once.
    ///
    /// Only called on frames not reachable through the page table, so
    /// the data lock is uncontended.
    pub fn install(&self, page_id: PageId, src: &[u8]) {
        self.data.write().copy_from_slice(src);
        self.page_id.store(page_id.0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        *self.pin_count.lock() = 1;
    }

    /// Resets the frame to the empty state for return to the free list.
    pub fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        *self.pin_count.lock() = 0;
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("is_dirty", &self.is_dirty())
            .finish()
    }
}
