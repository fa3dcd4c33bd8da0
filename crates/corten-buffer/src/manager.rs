//! Buffer manager: page table, two-queue replacement, fix/unfix.

use crate::frame::{BufferFrame, PageGuard, PageState};
use crate::segment::SegmentManager;
use corten_common::page::{PageId, PAGE_SIZE};
use corten_common::{CortenError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr::NonNull;
use sysinfo::System;

/// Configuration for the buffer manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferManagerConfig {
    /// Page size in bytes; must equal the build-time `PAGE_SIZE`.
    pub page_size: usize,
    /// Maximum number of pages resident in memory at the same time.
    pub page_count: usize,
    /// Directory holding the segment files.
    pub data_dir: PathBuf,
    /// Enable fsync after block writes.
    pub fsync_enabled: bool,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            page_count: 1024,
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Reference to a frame stored in the replacement queues.
///
/// Frames are boxed in the page table and never removed while the manager is
/// alive, so their addresses are stable.
#[derive(Clone, Copy)]
struct FrameRef(NonNull<BufferFrame>);

// SAFETY: BufferFrame is Sync and the pointed-to frame outlives every
// FrameRef (the page table is append-only for the manager's lifetime).
unsafe impl Send for FrameRef {}
unsafe impl Sync for FrameRef {}

impl FrameRef {
    fn new(frame: &BufferFrame) -> Self {
        Self(NonNull::from(frame))
    }

    fn get(&self) -> &BufferFrame {
        // SAFETY: see the Send/Sync justification above.
        unsafe { self.0.as_ref() }
    }

    fn is(&self, frame: &BufferFrame) -> bool {
        std::ptr::eq(self.0.as_ptr(), frame)
    }
}

/// Buffer manager.
///
/// Mediates between an in-memory page cache and on-disk segment files:
///
/// - a page table mapping page id to frame, append-only within a run,
/// - two replacement queues (FIFO for pages referenced once, LRU for pages
///   referenced again),
/// - page loading with segment files grown on demand,
/// - write-back of dirty pages on eviction and on drop.
///
/// Pages are pinned with [`fix_page`] and released with [`unfix_page`]; a
/// page may be fixed shared by many threads or exclusively by one.
///
/// [`fix_page`]: BufferManager::fix_page
/// [`unfix_page`]: BufferManager::unfix_page
pub struct BufferManager {
    config: BufferManagerConfig,
    segments: SegmentManager,
    /// Page id -> frame. Boxed entries keep frame addresses stable while the
    /// map grows behind its latch.
    page_table: RwLock<HashMap<u64, Box<BufferFrame>>>,
    /// Pages loaded once, in load order.
    fifo: RwLock<Vec<FrameRef>>,
    /// Pages referenced again, least recently used first.
    lru: RwLock<Vec<FrameRef>>,
}

impl BufferManager {
    /// Creates a new buffer manager.
    ///
    /// Fails if the configured page size does not match the build-time
    /// `PAGE_SIZE`.
    pub fn new(config: BufferManagerConfig) -> Result<Self> {
        if config.page_size != PAGE_SIZE {
            return Err(CortenError::PageSizeMismatch {
                expected: PAGE_SIZE,
                actual: config.page_size,
            });
        }

        let segments = SegmentManager::new(config.data_dir.clone(), config.fsync_enabled)?;

        Ok(Self {
            config,
            segments,
            page_table: RwLock::new(HashMap::new()),
            fifo: RwLock::new(Vec::new()),
            lru: RwLock::new(Vec::new()),
        })
    }

    /// Creates a buffer manager sized to 25% of available system RAM.
    ///
    /// Queries the system for available memory and allocates 25% of it for
    /// page frames. Minimum 1,000 frames to ensure useful caching even on
    /// low-memory systems.
    pub fn auto_sized(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4; // 25% of available RAM
        let page_count = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferManagerConfig {
            page_count,
            data_dir: data_dir.into(),
            ..Default::default()
        })
    }

    /// Returns the maximum number of resident pages.
    pub fn page_count(&self) -> usize {
        self.config.page_count
    }

    /// Fixes a page in the requested mode.
    ///
    /// When the page is not in memory it is read from its segment file,
    /// evicting another page if the pool is full. The returned guard holds
    /// the page latch (shared or exclusive) until it is unfixed or dropped.
    ///
    /// Fails with [`CortenError::BufferFull`] when every candidate frame is
    /// latched; the caller holds no latches on receipt of an error.
    pub fn fix_page(&self, pid: PageId, exclusive: bool) -> Result<PageGuard<'_>> {
        let frame = self.frame_for(pid);

        frame.lock(exclusive);
        // The guard releases the page latch on every early return below.
        let guard = PageGuard::new(frame, exclusive);

        match frame.state() {
            PageState::InFifo => self.promote_to_lru(frame),
            PageState::InLru => {
                let mut lru = self.lru.write();
                Self::move_to_tail(&mut lru, frame);
            }
            PageState::NotLoaded => {
                if !self.load_page(frame)? {
                    return Err(CortenError::BufferFull);
                }
            }
            PageState::Loading => {
                // Wait for the concurrent loader, then re-check its outcome.
                frame.wait_for_load();
                if !frame.is_resident() {
                    return Err(CortenError::BufferFull);
                }
            }
        }

        Ok(guard)
    }

    /// Unfixes a page returned by an earlier [`fix_page`] call.
    ///
    /// When `is_dirty` is true the page is written back to disk eventually
    /// (at eviction or shutdown). Must not be called with `is_dirty = true`
    /// for a page fixed in shared mode.
    ///
    /// [`fix_page`]: BufferManager::fix_page
    pub fn unfix_page(&self, page: PageGuard<'_>, is_dirty: bool) {
        if is_dirty {
            assert!(
                page.is_exclusive(),
                "page fixed in shared mode cannot be unfixed dirty"
            );
            page.frame().set_dirty(true);
        }
        drop(page);
    }

    /// Returns the page ids currently in the FIFO queue, in FIFO order.
    ///
    /// For inspection only; not consistent with concurrent fixes.
    pub fn fifo_snapshot(&self) -> Vec<PageId> {
        self.fifo.read().iter().map(|f| f.get().pid()).collect()
    }

    /// Returns the page ids currently in the LRU queue, least recently used
    /// first.
    ///
    /// For inspection only; not consistent with concurrent fixes.
    pub fn lru_snapshot(&self) -> Vec<PageId> {
        self.lru.read().iter().map(|f| f.get().pid()).collect()
    }

    /// Looks up the frame for a page id, creating it on first sight.
    fn frame_for(&self, pid: PageId) -> &BufferFrame {
        let key = pid.as_u64();

        {
            let table = self.page_table.read();
            if let Some(frame) = table.get(&key) {
                // SAFETY: frames are boxed and never removed while the
                // manager is alive, so the address outlives the map guard.
                return unsafe { &*(frame.as_ref() as *const BufferFrame) };
            }
        }

        let mut table = self.page_table.write();
        let frame = table
            .entry(key)
            .or_insert_with(|| Box::new(BufferFrame::new(pid)));
        // SAFETY: as above.
        unsafe { &*(frame.as_ref() as *const BufferFrame) }
    }

    /// Moves a frame from the FIFO queue to the LRU tail on re-reference.
    ///
    /// Caller holds the frame's page latch.
    fn promote_to_lru(&self, frame: &BufferFrame) {
        let mut fifo = self.fifo.write();
        let mut lru = self.lru.write();

        // A concurrent shared fixer may have promoted it already.
        if frame.state() == PageState::InLru {
            Self::move_to_tail(&mut lru, frame);
            return;
        }
        debug_assert_eq!(frame.state(), PageState::InFifo);

        let pos = fifo
            .iter()
            .position(|f| f.is(frame))
            .expect("frame marked InFifo is missing from the FIFO queue");
        fifo.remove(pos);

        lru.push(FrameRef::new(frame));
        frame.set_state(PageState::InLru);
    }

    /// Moves a frame already in the LRU queue to its tail.
    fn move_to_tail(lru: &mut Vec<FrameRef>, frame: &BufferFrame) {
        let pos = lru
            .iter()
            .position(|f| f.is(frame))
            .expect("frame marked InLru is missing from the LRU queue");
        let entry = lru.remove(pos);
        lru.push(entry);
    }

    /// Loads the page for a frame into memory.
    ///
    /// Caller holds the frame's page latch. Returns `Ok(false)` when no
    /// frame could be evicted to make room.
    fn load_page(&self, frame: &BufferFrame) -> Result<bool> {
        let _loading = frame.loading_latch().lock();

        match frame.state() {
            // Someone else loaded the page while we waited for the latch.
            PageState::InFifo | PageState::InLru => return Ok(true),
            PageState::Loading => {
                unreachable!("frame is mid-load while its loading latch is free")
            }
            PageState::NotLoaded => {}
        }

        frame.set_state(PageState::Loading);

        match self.admit_to_fifo(frame) {
            Ok(true) => {}
            Ok(false) => {
                frame.set_state(PageState::NotLoaded);
                return Ok(false);
            }
            Err(e) => {
                frame.set_state(PageState::NotLoaded);
                return Err(e);
            }
        }

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        if let Err(e) = self.read_segment_page(frame.pid(), &mut buf[..]) {
            self.withdraw_from_fifo(frame);
            frame.set_state(PageState::NotLoaded);
            return Err(e);
        }

        // SAFETY: we hold the loading latch and the frame is not resident.
        unsafe { frame.install_data(buf) };
        frame.set_state(PageState::InFifo);
        Ok(true)
    }

    /// Appends a frame to the FIFO queue, evicting another frame first when
    /// the pool is at capacity.
    ///
    /// On `Ok(true)` the frame is at the FIFO tail; on `Ok(false)` or error
    /// it is in no queue. Eviction candidates are scanned FIFO first, then
    /// LRU, taking the first frame whose page latch can be acquired without
    /// blocking.
    fn admit_to_fifo(&self, frame: &BufferFrame) -> Result<bool> {
        let mut fifo = self.fifo.write();

        {
            let lru = self.lru.read();
            if fifo.len() + lru.len() < self.config.page_count {
                fifo.push(FrameRef::new(frame));
                return Ok(true);
            }
        }

        if let Some(pos) = Self::lock_evictable(&fifo) {
            let victim = fifo.remove(pos);
            fifo.push(FrameRef::new(frame));
            drop(fifo);
            return self.evict(victim, frame);
        }

        let mut lru = self.lru.write();
        if let Some(pos) = Self::lock_evictable(&lru) {
            let victim = lru.remove(pos);
            drop(lru);
            fifo.push(FrameRef::new(frame));
            drop(fifo);
            return self.evict(victim, frame);
        }

        Ok(false)
    }

    /// Finds the first frame in a queue whose page latch can be taken
    /// exclusively without blocking, and takes it.
    fn lock_evictable(queue: &[FrameRef]) -> Option<usize> {
        queue.iter().position(|f| f.get().try_lock_exclusive())
    }

    /// Completes the eviction of a latched victim frame: flushes it when
    /// dirty, drops its buffer, and releases its latch.
    ///
    /// The victim has already been removed from its queue and `incoming` has
    /// been appended to the FIFO. A failed flush rolls both moves back so no
    /// modified page is lost.
    fn evict(&self, victim: FrameRef, incoming: &BufferFrame) -> Result<bool> {
        let victim = victim.get();
        debug_assert!(victim.is_resident());

        if victim.is_dirty() {
            if let Err(e) = self.flush_frame(victim) {
                self.undo_eviction(victim, incoming);
                // SAFETY: locked by lock_evictable above.
                unsafe { victim.unlock_exclusive() };
                return Err(e);
            }
        }

        log::debug!("evicted page {}", victim.pid());

        victim.set_state(PageState::NotLoaded);
        // SAFETY: we hold the victim's latch exclusively.
        unsafe {
            victim.release_data();
            victim.unlock_exclusive();
        }
        Ok(true)
    }

    /// Rolls back a failed eviction: the incoming frame leaves the FIFO and
    /// the still-dirty victim returns to the tail of its queue.
    fn undo_eviction(&self, victim: &BufferFrame, incoming: &BufferFrame) {
        let mut fifo = self.fifo.write();
        let pos = fifo
            .iter()
            .position(|f| f.is(incoming))
            .expect("incoming frame is missing from the FIFO queue");
        fifo.remove(pos);
        if victim.state() == PageState::InFifo {
            fifo.push(FrameRef::new(victim));
        }
        drop(fifo);

        if victim.state() == PageState::InLru {
            self.lru.write().push(FrameRef::new(victim));
        }
    }

    /// Removes a frame from the FIFO queue after a failed load.
    fn withdraw_from_fifo(&self, frame: &BufferFrame) {
        let mut fifo = self.fifo.write();
        if let Some(pos) = fifo.iter().position(|f| f.is(frame)) {
            fifo.remove(pos);
        }
    }

    /// Reads a page from its segment file, growing the file to cover the
    /// page first.
    fn read_segment_page(&self, pid: PageId, buf: &mut [u8]) -> Result<()> {
        let segment = self.segments.segment(pid.segment_id())?;
        let offset = pid.page_index() * PAGE_SIZE as u64;
        segment.ensure_size(offset + PAGE_SIZE as u64)?;
        segment.read_block(offset, buf)
    }

    /// Writes a frame's page back to its segment file and clears the dirty
    /// bit.
    ///
    /// Caller holds the frame's page latch exclusively.
    fn flush_frame(&self, frame: &BufferFrame) -> Result<()> {
        let pid = frame.pid();
        let segment = self.segments.segment(pid.segment_id())?;
        let offset = pid.page_index() * PAGE_SIZE as u64;
        // SAFETY: caller holds the latch exclusively and the frame is
        // resident.
        let data = unsafe { frame.data() };
        segment.write_block(data, offset)?;
        frame.set_dirty(false);
        Ok(())
    }
}

impl Drop for BufferManager {
    /// Writes all dirty resident pages to disk and releases their buffers.
    ///
    /// Every page must be unfixed before the manager is dropped.
    fn drop(&mut self) {
        for queue in [&self.fifo, &self.lru] {
            let frames = queue.read();
            for entry in frames.iter() {
                let frame = entry.get();
                frame.lock(true);
                debug_assert!(frame.is_resident());

                if frame.is_dirty() {
                    if let Err(e) = self.flush_frame(frame) {
                        log::warn!("failed to flush page {} during shutdown: {e}", frame.pid());
                    }
                }

                frame.set_state(PageState::NotLoaded);
                // SAFETY: we hold the latch exclusively.
                unsafe {
                    frame.release_data();
                    frame.unlock_exclusive();
                }
            }
        }
    }
}
