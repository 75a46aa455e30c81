//! Page replacement policy for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;

/// Trait for page replacement algorithms.
///
/// A replacer tracks the frames whose pin count is zero. Frames move in
/// on the pinned-to-unpinned transition, out on the reverse transition
/// or through eviction.
pub trait Replacer: Send + Sync {
    /// Adds a frame as an eviction candidate, most recent first.
    fn insert(&self, frame_id: FrameId);

    /// Removes a frame that was re-pinned before eviction. A no-op if
    /// the frame is not tracked.
    fn remove(&self, frame_id: FrameId);

    /// Removes and returns the eviction victim, or None if no frame is
    /// evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Index of the list sentinel inside `LruInner::links`.
///
/// The links array holds one node per frame plus the sentinel; the list
/// is circular, so `links[SENTINEL].next` is the most recently used
/// frame and `links[SENTINEL].prev` the least recently used one.
struct Link {
    prev: u32,
    next: u32,
    present: bool,
}

struct LruInner {
    links: Vec<Link>,
    len: usize,
}

/// LRU replacement policy.
///
/// Frame identifiers are dense pool indices, so the recency list is an
/// index-linked doubly linked list over a flat array: insert, remove
/// and victim selection are all O(1).
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

impl LruReplacer {
    /// Creates a replacer for a pool of `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        let sentinel = num_frames as u32;
        let mut links: Vec<Link> = (0..=num_frames)
            .map(|_| Link {
                prev: sentinel,
                next: sentinel,
                present: false,
            })
            .collect();
        links[num_frames].present = true;

        Self {
            inner: Mutex::new(LruInner { links, len: 0 }),
        }
    }
}

impl LruInner {
    fn sentinel(&self) -> u32 {
        (self.links.len() - 1) as u32
    }

    fn unlink(&mut self, idx: u32) {
        let prev = self.links[idx as usize].prev;
        let next = self.links[idx as usize].next;
        self.links[prev as usize].next = next;
        self.links[next as usize].prev = prev;
        self.links[idx as usize].present = false;
        self.len -= 1;
    }
}

impl Replacer for LruReplacer {
    fn insert(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0;
        if idx as usize >= inner.links.len() - 1 || inner.links[idx as usize].present {
            return;
        }

        // Link in at the MRU end, right after the sentinel.
        let sentinel = inner.sentinel();
        let head = inner.links[sentinel as usize].next;
        inner.links[idx as usize] = Link {
            prev: sentinel,
            next: head,
            present: true,
        };
        inner.links[sentinel as usize].next = idx;
        inner.links[head as usize].prev = idx;
        inner.len += 1;
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0;
        if (idx as usize) < inner.links.len() - 1 && inner.links[idx as usize].present {
            inner.unlink(idx);
        }
    }

    fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        if inner.len == 0 {
            return None;
        }

        let tail = inner.links[inner.sentinel() as usize].prev;
        inner.unlink(tail);
        Some(FrameId(tail))
    }

    fn size(&self) -> usize {
        self.inner.lock().len
    }
}
