//! B+-tree over slotted pages.
//!
//! One tree is one root pointer plus a chain of leaves; everything else
//! lives in the pages. Writes hold the tree-wide write lock for the
//! whole operation and descend with write guards, propagating splits
//! back up the recursion; reads hold the tree-wide read lock and hand
//! guards down the descent. Latch crabbing is deliberately absent.

mod iter;

pub use iter::TreeIter;

use crate::page::{header, internal, leaf};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tern_buffer::{BufferPool, PageWriteGuard};
use tern_common::page::PageId;
use tern_common::{Metadata, Result, TernError};
use tracing::debug;

/// Root bookkeeping, guarded by the tree-wide lock.
struct TreeRoots {
    root: PageId,
    first_leaf: PageId,
}

/// A separator on its way up the tree after a split.
struct Promotion {
    key: Bytes,
    left: PageId,
    right: PageId,
}

/// An ordered key/value map persisted as one B+-tree in the shared
/// data file.
pub struct BPlusTree {
    tree_id: u64,
    pool: Arc<BufferPool>,
    metadata: Arc<RwLock<Metadata>>,
    roots: RwLock<TreeRoots>,
}

impl BPlusTree {
    /// Opens the tree with the given id, reading its root pointers from
    /// the shared metadata. Zero pointers mean a newly created tree.
    pub(crate) fn new(
        tree_id: u64,
        pool: Arc<BufferPool>,
        metadata: Arc<RwLock<Metadata>>,
    ) -> Self {
        let roots = {
            let meta = metadata.read();
            TreeRoots {
                root: meta.root_pages.get(&tree_id).copied().unwrap_or(PageId::ZERO),
                first_leaf: meta
                    .first_leaf_pages
                    .get(&tree_id)
                    .copied()
                    .unwrap_or(PageId::ZERO),
            }
        };

        Self {
            tree_id,
            pool,
            metadata,
            roots: RwLock::new(roots),
        }
    }

    /// Returns this tree's identifier.
    pub fn id(&self) -> u64 {
        self.tree_id
    }

    /// Looks up `key`.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let roots = self.roots.read();
        if roots.root.is_zero() {
            return Err(TernError::KeyNotFound);
        }

        let mut node = self.pool.new_read_guard(roots.root)?;
        loop {
            if header::is_leaf(&node) {
                return leaf::find_value(&node, key).ok_or(TernError::KeyNotFound);
            }
            let child = internal::find_next_child(&node, key);
            // The child guard is taken before the parent is released.
            node = self.pool.new_read_guard(child)?;
        }
    }

    /// Inserts `key` with `value`, replacing any existing value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut roots = self.roots.write();

        if roots.root.is_zero() {
            // A fresh zero page decodes as an empty leaf; no init write
            // is needed.
            let root = self.pool.new_page()?;
            roots.root = root;
            roots.first_leaf = root;
            debug!(tree_id = self.tree_id, root = %root, "btree.root.create");
        }

        let mut root_guard = self.pool.new_write_guard(roots.root)?;
        let promotion = self.insert_into(&mut root_guard, key, value)?;
        drop(root_guard);

        if let Some(promotion) = promotion {
            let new_root = self.pool.new_page()?;
            let mut guard = match self.pool.new_write_guard(new_root) {
                Ok(guard) => guard,
                Err(e) => {
                    self.pool.cleanup_page(new_root);
                    return Err(e);
                }
            };
            header::set_node_type(&mut guard, false);
            internal::insert(&mut guard, &promotion.key, promotion.left, promotion.right);
            guard.set_dirty();
            drop(guard);

            roots.root = new_root;
            debug!(tree_id = self.tree_id, root = %new_root, "btree.root.split");
        }

        Ok(())
    }

    /// Removes `key` if present, tombstoning it in its leaf. Returns
    /// whether a live entry was removed. Pages are never rebalanced or
    /// reclaimed by deletion.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let roots = self.roots.write();
        if roots.root.is_zero() {
            return Ok(false);
        }

        let mut node = self.pool.new_write_guard(roots.root)?;
        loop {
            if header::is_leaf(&node) {
                let removed = leaf::delete(&mut node, key);
                if removed {
                    node.set_dirty();
                }
                return Ok(removed);
            }
            let child = internal::find_next_child(&node, key);
            node = self.pool.new_write_guard(child)?;
        }
    }

    /// Creates an ordered iterator over the live entries.
    pub fn iter(&self) -> Result<TreeIter<'_>> {
        let roots = self.roots.read();
        TreeIter::new(&self.pool, roots.first_leaf)
    }

    /// Records the tree's root pointers in the shared metadata so they
    /// reach the metadata page on engine close.
    pub fn close(&self) {
        let roots = self.roots.read();
        let mut meta = self.metadata.write();
        meta.root_pages.insert(self.tree_id, roots.root);
        meta.first_leaf_pages.insert(self.tree_id, roots.first_leaf);
        debug!(
            tree_id = self.tree_id,
            root = %roots.root,
            first_leaf = %roots.first_leaf,
            "btree.tree.close"
        );
    }

    /// Recursive write descent. Returns a promotion when this node was
    /// split and its parent has a new separator to absorb.
    fn insert_into<'a>(
        &'a self,
        node: &mut PageWriteGuard<'a>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Promotion>> {
        if header::is_leaf(node) {
            return self.insert_into_leaf(node, key, value);
        }

        let child_id = internal::find_next_child(node, key);
        let mut child = self.pool.new_write_guard(child_id)?;
        let promotion = self.insert_into(&mut child, key, value)?;
        drop(child);

        let Some(promotion) = promotion else {
            return Ok(None);
        };

        if internal::insert(node, &promotion.key, promotion.left, promotion.right) {
            node.set_dirty();
            return Ok(None);
        }

        // This internal node is full too: split it and route the
        // promoted separator into the matching half.
        let right_id = self.pool.new_page()?;
        let mut right = match self.pool.new_write_guard(right_id) {
            Ok(guard) => guard,
            Err(e) => {
                self.pool.cleanup_page(right_id);
                return Err(e);
            }
        };

        let separator = internal::split(node, &mut right);
        let inserted = if promotion.key < separator {
            internal::insert(node, &promotion.key, promotion.left, promotion.right)
        } else {
            internal::insert(&mut right, &promotion.key, promotion.left, promotion.right)
        };
        if !inserted {
            return Err(TernError::Internal(
                "separator does not fit after internal split".to_string(),
            ));
        }
        node.set_dirty();
        right.set_dirty();

        Ok(Some(Promotion {
            key: separator,
            left: node.page_id(),
            right: right_id,
        }))
    }

    /// Leaf-level insert: replace in place, insert in place, or split
    /// and place the entry in the matching half.
    fn insert_into_leaf<'a>(
        &'a self,
        node: &mut PageWriteGuard<'a>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Promotion>> {
        let replace = leaf::find_value(node, key).is_some();
        let fits = if replace {
            leaf::set_value(node, key, value)
        } else {
            leaf::insert(node, key, value)
        };
        if fits {
            node.set_dirty();
            return Ok(None);
        }

        let right_id = self.pool.new_page()?;
        let mut right = match self.pool.new_write_guard(right_id) {
            Ok(guard) => guard,
            Err(e) => {
                self.pool.cleanup_page(right_id);
                return Err(e);
            }
        };

        let separator = leaf::split(node, &mut right, right_id);
        let target_is_left = key < separator.as_ref();
        let target: &mut PageWriteGuard<'_> = if target_is_left { &mut *node } else { &mut right };
        let placed = if replace {
            leaf::set_value(target, key, value)
        } else {
            leaf::insert(target, key, value)
        };
        if !placed {
            return Err(TernError::Internal(
                "entry does not fit after leaf split".to_string(),
            ));
        }
        node.set_dirty();
        right.set_dirty();
        debug!(
            tree_id = self.tree_id,
            left = %node.page_id(),
            right = %right_id,
            "btree.leaf.split"
        );

        Ok(Some(Promotion {
            key: separator,
            left: node.page_id(),
            right: right_id,
        }))
    }
}
