//! B+tree index for CortenDB.
//!
//! This crate provides:
//! - A branchless lower-bound search primitive
//! - Fixed-width key/value encoding for in-page storage
//! - Leaf and inner node views over buffer-managed pages
//! - A concurrent, latch-coupled B+tree built on the buffer manager

mod key;
mod node;
mod search;
mod tree;

pub use key::{IndexKey, IndexValue};
pub use node::{
    inner_capacity, is_leaf, leaf_capacity, InnerMut, InnerRef, LeafMut, LeafRef,
    NODE_HEADER_SIZE,
};
pub use search::{lower_bound, lower_bound_by};
pub use tree::BTree;
