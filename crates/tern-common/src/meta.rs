//! The metadata page: free list, per-tree root pointers, tree-id counter.
//!
//! Persisted at page 0 of the data file. All integers are fixed-width
//! little-endian; the encoded image is padded to exactly one page.
//!
//! Layout:
//! - curr_tree_id: 8 bytes
//! - root page count: 8 bytes, then (tree_id: 8, root_page: 8) pairs
//! - max_allocated_page_id: 8 bytes
//! - free list length: 8 bytes, then page ids (8 bytes each)
//! - first leaf count: 8 bytes, then (tree_id: 8, first_leaf_page: 8) pairs

use crate::error::{Result, TernError};
use crate::page::{PageId, PAGE_SIZE};
use std::collections::BTreeMap;

/// In-memory image of the metadata page.
///
/// Shared between the disk manager (free list, max page id), the engine
/// (tree-id counter) and the trees (root and first-leaf registration).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Last tree identifier handed out. Monotonic, never reused.
    pub curr_tree_id: u64,
    /// Highest page identifier ever allocated.
    pub max_allocated_page_id: u64,
    /// Page identifiers returned to the allocator, reused head-first.
    pub deallocated_page_ids: Vec<PageId>,
    /// Root page of each tree. A missing or zero entry means the tree
    /// is empty.
    pub root_pages: BTreeMap<u64, PageId>,
    /// Leftmost leaf of each tree, the entry point for ordered
    /// iteration.
    pub first_leaf_pages: BTreeMap<u64, PageId>,
}

impl Metadata {
    /// Encodes the metadata into a page-sized buffer.
    ///
    /// Fails if the encoding would not fit in one page (a pathologically
    /// long free list); nothing is truncated.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let needed = 8
            + 8
            + self.root_pages.len() * 16
            + 8
            + 8
            + self.deallocated_page_ids.len() * 8
            + 8
            + self.first_leaf_pages.len() * 16;
        if needed > PAGE_SIZE {
            return Err(TernError::Internal(format!(
                "metadata image of {needed} bytes exceeds page size"
            )));
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        let mut pos = 0;

        put_u64(&mut buf, &mut pos, self.curr_tree_id);

        put_u64(&mut buf, &mut pos, self.root_pages.len() as u64);
        for (&tree_id, &root) in &self.root_pages {
            put_u64(&mut buf, &mut pos, tree_id);
            put_u64(&mut buf, &mut pos, root.0);
        }

        put_u64(&mut buf, &mut pos, self.max_allocated_page_id);

        put_u64(&mut buf, &mut pos, self.deallocated_page_ids.len() as u64);
        for &page_id in &self.deallocated_page_ids {
            put_u64(&mut buf, &mut pos, page_id.0);
        }

        put_u64(&mut buf, &mut pos, self.first_leaf_pages.len() as u64);
        for (&tree_id, &first_leaf) in &self.first_leaf_pages {
            put_u64(&mut buf, &mut pos, tree_id);
            put_u64(&mut buf, &mut pos, first_leaf.0);
        }

        Ok(buf)
    }

    /// Decodes a metadata page read back from disk.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let curr_tree_id = get_u64(data, &mut pos)?;

        let root_count = get_u64(data, &mut pos)?;
        let mut root_pages = BTreeMap::new();
        for _ in 0..root_count {
            let tree_id = get_u64(data, &mut pos)?;
            let root = get_u64(data, &mut pos)?;
            root_pages.insert(tree_id, PageId(root));
        }

        let max_allocated_page_id = get_u64(data, &mut pos)?;

        let free_count = get_u64(data, &mut pos)?;
        let mut deallocated_page_ids = Vec::with_capacity(free_count as usize);
        for _ in 0..free_count {
            deallocated_page_ids.push(PageId(get_u64(data, &mut pos)?));
        }

        let first_leaf_count = get_u64(data, &mut pos)?;
        let mut first_leaf_pages = BTreeMap::new();
        for _ in 0..first_leaf_count {
            let tree_id = get_u64(data, &mut pos)?;
            let first_leaf = get_u64(data, &mut pos)?;
            first_leaf_pages.insert(tree_id, PageId(first_leaf));
        }

        Ok(Self {
            curr_tree_id,
            max_allocated_page_id,
            deallocated_page_ids,
            root_pages,
            first_leaf_pages,
        })
    }
}

fn put_u64(buf: &mut [u8], pos: &mut usize, value: u64) {
    buf[*pos..*pos + 8].copy_from_slice(&value.to_le_bytes());
    *pos += 8;
}

fn get_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let end = *pos + 8;
    let bytes = buf
        .get(*pos..end)
        .ok_or_else(|| TernError::Internal("truncated metadata page".to_string()))?;
    *pos = end;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}
