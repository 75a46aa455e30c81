//! Storage engine: the registry of open trees over one data file.

use crate::btree::BPlusTree;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tern_buffer::{BufferPool, DiskManager};
use tern_common::{Metadata, Result, StorageConfig, TernError};
use tracing::{debug, info};

/// The storage engine. Owns the buffer pool and hands out trees.
///
/// Trees are cached per identifier: opening the same tree twice yields
/// the same instance, so all users share its tree-wide lock.
pub struct StorageEngine {
    pool: Arc<BufferPool>,
    metadata: Arc<RwLock<Metadata>>,
    open_trees: Mutex<HashMap<u64, Arc<BPlusTree>>>,
}

impl StorageEngine {
    /// Opens the engine over the configured data file, creating it if
    /// absent.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let disk = DiskManager::open(&config.path, config.direct_io)?;
        let metadata = disk.metadata();
        let pool = Arc::new(BufferPool::new(config.pool_frames, disk));

        info!(
            path = %config.path.display(),
            frames = config.pool_frames,
            "engine.open"
        );
        Ok(Self {
            pool,
            metadata,
            open_trees: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates a fresh tree identifier. The tree exists from its
    /// first insert; until then its root pointer is zero.
    pub fn new_tree(&self) -> u64 {
        let mut meta = self.metadata.write();
        meta.curr_tree_id += 1;
        meta.curr_tree_id
    }

    /// Opens a tree by identifier, returning the cached instance when
    /// the tree is already open.
    pub fn open_tree(&self, tree_id: u64) -> Arc<BPlusTree> {
        let mut trees = self.open_trees.lock();
        Arc::clone(trees.entry(tree_id).or_insert_with(|| {
            debug!(tree_id, "engine.tree.open");
            Arc::new(BPlusTree::new(
                tree_id,
                Arc::clone(&self.pool),
                Arc::clone(&self.metadata),
            ))
        }))
    }

    /// Closes one tree: flushes its root pointers into the metadata and
    /// drops it from the registry.
    pub fn close_tree(&self, tree_id: u64) -> Result<()> {
        let tree = self
            .open_trees
            .lock()
            .remove(&tree_id)
            .ok_or(TernError::TreeNotOpen(tree_id))?;
        tree.close();
        Ok(())
    }

    /// Closes every open tree, flushes the pool and persists the
    /// metadata page.
    pub fn close(&self) -> Result<()> {
        for (_, tree) in self.open_trees.lock().drain() {
            tree.close();
        }
        self.pool.close()?;
        info!("engine.close");
        Ok(())
    }
}
