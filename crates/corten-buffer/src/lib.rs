//! Buffer management for CortenDB.
//!
//! This crate provides in-memory page caching over on-disk segment files:
//! - Fix/unfix page pinning with shared or exclusive page latches
//! - Two-queue (FIFO/LRU) replacement: pages enter the FIFO on first load
//!   and promote to the LRU on re-reference
//! - Dirty page tracking with write-back on eviction and on drop
//! - Segment files grown on demand, one file per 16-bit segment id

mod frame;
mod manager;
mod segment;

pub use frame::{BufferFrame, PageGuard, PageState};
pub use manager::{BufferManager, BufferManagerConfig};
pub use segment::{SegmentFile, SegmentManager};
