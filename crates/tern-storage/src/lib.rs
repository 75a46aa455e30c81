//! Storage core for TernDB.
//!
//! This crate provides:
//! - Slotted-page codecs for leaf and internal B+-tree nodes
//! - The B+-tree itself, with ordered iteration over its leaf chain
//! - The storage engine registry that tracks open trees

pub mod page;

mod btree;
mod engine;

pub use btree::{BPlusTree, TreeIter};
pub use engine::StorageEngine;
