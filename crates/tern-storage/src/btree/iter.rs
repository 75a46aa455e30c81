//! Ordered iteration over a tree's leaf chain.

use crate::page::header::PageHeader;
use crate::page::leaf::LeafElement;
use crate::page::Slot;
use bytes::Bytes;
use tern_buffer::{BufferPool, PageReadGuard};
use tern_common::page::PageId;
use tern_common::Result;

/// Iterator over the live entries of one tree, in ascending key order.
///
/// Holds a read guard on one leaf at a time; the guard is released when
/// the leaf is exhausted, before the next leaf's guard is taken, and on
/// drop. Entries written behind the iterator's position by concurrent
/// inserts may or may not be observed.
pub struct TreeIter<'a> {
    pool: &'a BufferPool,
    leaf: Option<PageReadGuard<'a>>,
    slot: usize,
}

impl<'a> TreeIter<'a> {
    /// Positions a new iterator on the tree's leftmost leaf. A zero
    /// first-leaf means the tree is empty.
    pub(crate) fn new(pool: &'a BufferPool, first_leaf: PageId) -> Result<Self> {
        let leaf = if first_leaf.is_zero() {
            None
        } else {
            Some(pool.new_read_guard(first_leaf)?)
        };
        Ok(Self {
            pool,
            leaf,
            slot: 0,
        })
    }
}

impl Iterator for TreeIter<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;
            let slot_count = PageHeader::read(leaf).slot_count as usize;

            while self.slot < slot_count {
                let slot = Slot::read(leaf, self.slot);
                self.slot += 1;
                if slot.is_tombstone() {
                    continue;
                }
                let element = LeafElement::decode(slot.element(leaf));
                return Some(Ok((element.key, element.value)));
            }

            let next_leaf = PageHeader::read(leaf).next_leaf;
            // Release the exhausted leaf before touching the next one.
            self.leaf = None;
            self.slot = 0;
            if next_leaf.is_zero() {
                return None;
            }
            match self.pool.new_read_guard(next_leaf) {
                Ok(guard) => self.leaf = Some(guard),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
