//! Buffer frame management.

use corten_common::page::{PageId, PAGE_SIZE};
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Residency state of a buffer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// No page data in memory.
    NotLoaded = 0,
    /// A thread is currently reading the page from its segment file.
    Loading = 1,
    /// Resident; the frame sits in the FIFO queue.
    InFifo = 2,
    /// Resident; the frame sits in the LRU queue.
    InLru = 3,
}

impl PageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PageState::NotLoaded,
            1 => PageState::Loading,
            2 => PageState::InFifo,
            3 => PageState::InLru,
            _ => unreachable!("invalid page state {value}"),
        }
    }
}

/// A frame holding one page of the buffer pool.
///
/// A frame is created the first time its page id is fixed and lives for the
/// rest of the buffer manager's life; only its backing buffer comes and goes
/// with residency. The page latch is a raw readers/writer lock because it is
/// acquired in [`BufferManager::fix_page`] and released in a later
/// `unfix_page` (or guard drop), not within a single critical section.
///
/// [`BufferManager::fix_page`]: crate::BufferManager::fix_page
pub struct BufferFrame {
    /// Page identity, immutable for the life of the frame.
    pid: PageId,
    /// Residency state (`PageState` as u8).
    state: AtomicU8,
    /// Set on any exclusive unfix that declared a write; sticky until the
    /// next flush.
    dirty: AtomicBool,
    /// Latch protecting the page data across the fix/unfix boundary.
    latch: RawRwLock,
    /// Serializes state transitions out of `NotLoaded`/`Loading`.
    loading_latch: Mutex<()>,
    /// Page data, present iff the frame is resident.
    data: UnsafeCell<Option<Box<[u8; PAGE_SIZE]>>>,
}

// SAFETY: `data` is only installed under `loading_latch` before the frame
// becomes resident, read through `PageGuard` while `latch` is held, and
// dropped while `latch` is held exclusively (eviction, shutdown). All other
// fields are atomics or locks.
unsafe impl Send for BufferFrame {}
unsafe impl Sync for BufferFrame {}

impl BufferFrame {
    /// Creates a new, unloaded frame for the given page id.
    pub(crate) fn new(pid: PageId) -> Self {
        Self {
            pid,
            state: AtomicU8::new(PageState::NotLoaded as u8),
            dirty: AtomicBool::new(false),
            latch: RawRwLock::INIT,
            loading_latch: Mutex::new(()),
            data: UnsafeCell::new(None),
        }
    }

    /// Returns the page id held by this frame.
    #[inline]
    pub fn pid(&self) -> PageId {
        self.pid
    }

    /// Returns the current residency state.
    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns true if page data is in memory.
    #[inline]
    pub fn is_resident(&self) -> bool {
        matches!(self.state(), PageState::InFifo | PageState::InLru)
    }

    /// Returns true if this frame carries unwritten modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline]
    pub(crate) fn lock(&self, exclusive: bool) {
        if exclusive {
            self.latch.lock_exclusive();
        } else {
            self.latch.lock_shared();
        }
    }

    /// Attempts to take the page latch exclusively without blocking.
    #[inline]
    pub(crate) fn try_lock_exclusive(&self) -> bool {
        self.latch.try_lock_exclusive()
    }

    /// Releases an exclusive page latch acquisition.
    ///
    /// # Safety
    /// The caller must hold the latch exclusively.
    #[inline]
    pub(crate) unsafe fn unlock_exclusive(&self) {
        self.latch.unlock_exclusive();
    }

    /// Releases a shared page latch acquisition.
    ///
    /// # Safety
    /// The caller must hold the latch in shared mode.
    #[inline]
    pub(crate) unsafe fn unlock_shared(&self) {
        self.latch.unlock_shared();
    }

    /// Blocks until a concurrent load of this frame has finished.
    pub(crate) fn wait_for_load(&self) {
        drop(self.loading_latch.lock());
    }

    /// Locks the loading latch for the duration of a load attempt.
    pub(crate) fn loading_latch(&self) -> &Mutex<()> {
        &self.loading_latch
    }

    /// Installs the page buffer after a successful segment read.
    ///
    /// # Safety
    /// The caller must hold the loading latch and the frame must not be
    /// resident.
    pub(crate) unsafe fn install_data(&self, buf: Box<[u8; PAGE_SIZE]>) {
        debug_assert_eq!(self.state(), PageState::Loading);
        *self.data.get() = Some(buf);
    }

    /// Drops the page buffer on eviction or shutdown.
    ///
    /// # Safety
    /// The caller must hold the page latch exclusively.
    pub(crate) unsafe fn release_data(&self) {
        debug_assert!((*self.data.get()).is_some());
        *self.data.get() = None;
    }

    /// Returns the page bytes of a resident frame.
    ///
    /// # Safety
    /// The caller must hold the page latch (either mode) and the frame must
    /// be resident.
    pub(crate) unsafe fn data(&self) -> &[u8] {
        (*self.data.get())
            .as_deref()
            .expect("page data accessed while not resident")
    }

    /// Returns mutable page bytes of a resident frame.
    ///
    /// # Safety
    /// The caller must hold the page latch exclusively and the frame must be
    /// resident.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut [u8] {
        (*self.data.get())
            .as_deref_mut()
            .expect("page data accessed while not resident")
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferFrame")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// A fixed page.
///
/// The guard owns one acquisition of the frame's page latch in the mode
/// requested from [`fix_page`]; dropping it releases the latch. Passing the
/// guard to [`unfix_page`] additionally records whether the page was
/// modified.
///
/// [`fix_page`]: crate::BufferManager::fix_page
/// [`unfix_page`]: crate::BufferManager::unfix_page
pub struct PageGuard<'a> {
    frame: &'a BufferFrame,
    exclusive: bool,
}

impl<'a> PageGuard<'a> {
    /// Wraps a frame whose page latch is already held in the given mode.
    pub(crate) fn new(frame: &'a BufferFrame, exclusive: bool) -> Self {
        Self { frame, exclusive }
    }

    /// Returns the page id of the fixed page.
    #[inline]
    pub fn pid(&self) -> PageId {
        self.frame.pid()
    }

    /// Returns true if the page is fixed exclusively.
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub(crate) fn frame(&self) -> &'a BufferFrame {
        self.frame
    }

    /// Returns the page bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the guard holds the page latch and fix_page only returns
        // guards for resident frames.
        unsafe { self.frame.data() }
    }

    /// Returns the page bytes for modification.
    ///
    /// Panics if the page was fixed in shared mode.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.exclusive, "page fixed in shared mode cannot be written");
        // SAFETY: the guard holds the page latch exclusively and fix_page
        // only returns guards for resident frames.
        unsafe { self.frame.data_mut() }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard owns exactly one acquisition in `exclusive` mode.
        unsafe {
            if self.exclusive {
                self.frame.unlock_exclusive();
            } else {
                self.frame.unlock_shared();
            }
        }
    }
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("pid", &self.pid())
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = BufferFrame::new(PageId::new(0, 7));

        assert_eq!(frame.pid(), PageId::new(0, 7));
        assert_eq!(frame.state(), PageState::NotLoaded);
        assert!(!frame.is_dirty());
        assert!(!frame.is_resident());
    }

    #[test]
    fn test_frame_state_transitions() {
        let frame = BufferFrame::new(PageId::new(0, 1));

        frame.set_state(PageState::Loading);
        assert_eq!(frame.state(), PageState::Loading);
        assert!(!frame.is_resident());

        frame.set_state(PageState::InFifo);
        assert!(frame.is_resident());

        frame.set_state(PageState::InLru);
        assert!(frame.is_resident());

        frame.set_state(PageState::NotLoaded);
        assert!(!frame.is_resident());
    }

    #[test]
    fn test_frame_dirty_flag() {
        let frame = BufferFrame::new(PageId::new(0, 1));

        assert!(!frame.is_dirty());
        frame.set_dirty(true);
        assert!(frame.is_dirty());
        frame.set_dirty(false);
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_frame_data_install_and_release() {
        let frame = BufferFrame::new(PageId::new(0, 1));
        frame.set_state(PageState::Loading);

        let mut buf = Box::new([0u8; PAGE_SIZE]);
        buf[0] = 0xAB;
        unsafe { frame.install_data(buf) };
        frame.set_state(PageState::InFifo);

        frame.lock(false);
        assert_eq!(unsafe { frame.data() }[0], 0xAB);
        unsafe { frame.unlock_shared() };

        frame.lock(true);
        unsafe { frame.release_data() };
        frame.set_state(PageState::NotLoaded);
        unsafe { frame.unlock_exclusive() };
    }

    #[test]
    fn test_frame_try_lock() {
        let frame = BufferFrame::new(PageId::new(0, 1));

        frame.lock(false);
        // Shared holder blocks exclusive acquisition.
        assert!(!frame.try_lock_exclusive());
        unsafe { frame.unlock_shared() };

        assert!(frame.try_lock_exclusive());
        assert!(!frame.try_lock_exclusive());
        unsafe { frame.unlock_exclusive() };
    }

    #[test]
    fn test_page_guard_release_on_drop() {
        let frame = BufferFrame::new(PageId::new(0, 1));

        frame.lock(true);
        {
            let guard = PageGuard::new(&frame, true);
            assert!(guard.is_exclusive());
            assert_eq!(guard.pid(), PageId::new(0, 1));
        }

        // Latch was released by the guard drop.
        assert!(frame.try_lock_exclusive());
        unsafe { frame.unlock_exclusive() };
    }

    #[test]
    fn test_frame_debug() {
        let frame = BufferFrame::new(PageId::new(2, 5));
        let debug_str = format!("{:?}", frame);
        assert!(debug_str.contains("BufferFrame"));
        assert!(debug_str.contains("state"));
    }
}
