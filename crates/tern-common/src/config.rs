//! Configuration structures for TernDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the database file.
    pub path: PathBuf,
    /// Buffer pool size in number of frames.
    pub pool_frames: usize,
    /// Open the file with O_DIRECT, bypassing the OS page cache.
    /// Only honored on Linux; elsewhere the flag is ignored.
    pub direct_io: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tern.db"),
            pool_frames: 1024,
            direct_io: cfg!(target_os = "linux"),
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn pool_size_bytes(&self) -> usize {
        self.pool_frames * crate::page::PAGE_SIZE
    }
}
