//! Concurrent B+tree over the buffer manager.

use crate::key::{IndexKey, IndexValue};
use crate::node::{self, InnerMut, InnerRef, LeafMut, LeafRef};
use corten_buffer::{BufferManager, PageGuard};
use corten_common::{PageId, Result};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

/// A B+tree index over fixed-width keys and values within one segment.
///
/// Tree operations pin pages through the buffer manager with latch
/// coupling: a descent holds at most the parent and the current node at
/// once, releasing the grandparent as soon as the child is pinned. Lookups
/// descend with shared latches. Inserts descend optimistically with shared
/// latches and retry the whole descent with exclusive latches when they
/// meet a full node; structural changes (splits, root growth) happen only
/// under exclusive latches and are followed by a full restart. Erase fixes
/// only the leaf exclusively and never merges, so the tree only grows.
///
/// All operations take `&self` and may run from many threads sharing the
/// tree.
pub struct BTree<'a, K: IndexKey, V: IndexValue> {
    /// Segment whose pages hold this tree's nodes.
    segment_id: u16,
    manager: &'a BufferManager,
    /// Current root page id; re-validated by descents after pinning.
    root: AtomicU64,
    /// Mints page indices for new nodes; never reused.
    node_count: AtomicU64,
    /// 1 = the root is a leaf. Never decreases.
    tree_height: AtomicU16,
    _marker: PhantomData<fn(K, V)>,
}

impl<'a, K: IndexKey, V: IndexValue> BTree<'a, K, V> {
    /// Creates a tree with a single empty leaf as root.
    pub fn new(segment_id: u16, manager: &'a BufferManager) -> Result<Self> {
        let tree = Self {
            segment_id,
            manager,
            root: AtomicU64::new(0),
            node_count: AtomicU64::new(0),
            tree_height: AtomicU16::new(0),
            _marker: PhantomData,
        };

        let pid = tree.create_new_node();
        let mut page = manager.fix_page(pid, true)?;
        LeafMut::<K, V>::init(page.data_mut());

        tree.root.store(pid.as_u64(), Ordering::Release);
        tree.tree_height.store(1, Ordering::Release);

        manager.unfix_page(page, true);
        Ok(tree)
    }

    /// Returns the current root page id.
    pub fn root_pid(&self) -> PageId {
        PageId::from_u64(self.root.load(Ordering::Acquire))
    }

    /// Returns the current tree height (1 = the root is a leaf).
    pub fn height(&self) -> u16 {
        self.tree_height.load(Ordering::Acquire)
    }

    /// Mints a fresh page id within this tree's segment.
    fn create_new_node(&self) -> PageId {
        PageId::new(self.segment_id, self.node_count.fetch_add(1, Ordering::Relaxed))
    }

    /// Looks up the value stored for `key`.
    pub fn lookup(&self, key: &K) -> Result<Option<V>> {
        loop {
            let root = self.root.load(Ordering::Acquire);
            let mut current = self.manager.fix_page(PageId::from_u64(root), false)?;

            if self.root.load(Ordering::Acquire) != root {
                // The root grew while we were pinning it.
                self.manager.unfix_page(current, false);
                continue;
            }

            let mut parent: Option<PageGuard<'_>> = None;

            while !node::is_leaf(current.data()) {
                let child = {
                    let inner = InnerRef::<K>::new(current.data());
                    let (pos, _) = inner.lower_bound(key);
                    inner.child_at(pos)
                };

                // Latch coupling: drop the grandparent, keep the parent
                // pinned until the child is.
                if let Some(p) = parent.take() {
                    self.manager.unfix_page(p, false);
                }
                let next = match self.manager.fix_page(child, false) {
                    Ok(guard) => guard,
                    Err(e) => {
                        self.manager.unfix_page(current, false);
                        return Err(e);
                    }
                };
                parent = Some(current);
                current = next;
            }

            let result = {
                let leaf = LeafRef::<K, V>::new(current.data());
                let (pos, found) = leaf.lower_bound(key);
                found.then(|| leaf.value_at(pos))
            };

            if let Some(p) = parent.take() {
                self.manager.unfix_page(p, false);
            }
            self.manager.unfix_page(current, false);
            return Ok(result);
        }
    }

    /// Inserts a key/value pair, overwriting the value when the key is
    /// already present.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let mut exclusive = false;

        'restart: loop {
            let root = self.root.load(Ordering::Acquire);
            let height = self.tree_height.load(Ordering::Acquire);
            let mut current_pid = PageId::from_u64(root);
            let mut current = self
                .manager
                .fix_page(current_pid, exclusive || height == 1)?;

            if self.root.load(Ordering::Acquire) != root {
                self.manager.unfix_page(current, false);
                continue 'restart;
            }

            let mut parent: Option<PageGuard<'_>> = None;

            while !node::is_leaf(current.data()) {
                let (has_space, level) = {
                    let inner = InnerRef::<K>::new(current.data());
                    (inner.has_space(), inner.level())
                };

                if !has_space {
                    if !exclusive {
                        // A split may be needed below a full node; redo the
                        // descent under exclusive latches.
                        self.manager.unfix_page(current, false);
                        if let Some(p) = parent.take() {
                            self.manager.unfix_page(p, false);
                        }
                        exclusive = true;
                        continue 'restart;
                    }

                    self.split_node(current, parent.take(), current_pid, level)?;
                    exclusive = false;
                    continue 'restart;
                }

                let child = {
                    let inner = InnerRef::<K>::new(current.data());
                    let (pos, _) = inner.lower_bound(&key);
                    inner.child_at(pos)
                };

                if let Some(p) = parent.take() {
                    self.manager.unfix_page(p, false);
                }
                let next = match self.manager.fix_page(child, exclusive || level == 1) {
                    Ok(guard) => guard,
                    Err(e) => {
                        self.manager.unfix_page(current, false);
                        return Err(e);
                    }
                };
                parent = Some(current);
                current = next;
                current_pid = child;
            }

            if !LeafRef::<K, V>::new(current.data()).has_space() {
                if !exclusive {
                    self.manager.unfix_page(current, false);
                    if let Some(p) = parent.take() {
                        self.manager.unfix_page(p, false);
                    }
                    exclusive = true;
                    continue 'restart;
                }

                self.split_node(current, parent.take(), current_pid, 0)?;
                exclusive = false;
                continue 'restart;
            }

            LeafMut::<K, V>::new(current.data_mut()).insert(&key, &value);

            self.manager.unfix_page(current, true);
            if let Some(p) = parent.take() {
                self.manager.unfix_page(p, false);
            }
            return Ok(());
        }
    }

    /// Removes `key` from the tree. Returns whether it was present.
    ///
    /// Leaves are never merged or rebalanced; an emptied leaf stays
    /// addressable from its parent.
    pub fn erase(&self, key: &K) -> Result<bool> {
        loop {
            let root = self.root.load(Ordering::Acquire);
            let height = self.tree_height.load(Ordering::Acquire);
            let mut current = self
                .manager
                .fix_page(PageId::from_u64(root), height == 1)?;

            if self.root.load(Ordering::Acquire) != root {
                self.manager.unfix_page(current, false);
                continue;
            }

            let mut parent: Option<PageGuard<'_>> = None;

            while !node::is_leaf(current.data()) {
                let (child, level) = {
                    let inner = InnerRef::<K>::new(current.data());
                    let (pos, _) = inner.lower_bound(key);
                    (inner.child_at(pos), inner.level())
                };

                if let Some(p) = parent.take() {
                    self.manager.unfix_page(p, false);
                }
                // Only the leaf needs an exclusive latch.
                let next = match self.manager.fix_page(child, level == 1) {
                    Ok(guard) => guard,
                    Err(e) => {
                        self.manager.unfix_page(current, false);
                        return Err(e);
                    }
                };
                parent = Some(current);
                current = next;
            }

            let erased = LeafMut::<K, V>::new(current.data_mut()).erase(key);

            if let Some(p) = parent.take() {
                self.manager.unfix_page(p, false);
            }
            self.manager.unfix_page(current, erased);
            return Ok(erased);
        }
    }

    /// Splits the exclusively latched full node in `current` (a leaf when
    /// `level == 0`), wiring the separator into the parent or growing a new
    /// root, then releases every involved page as dirty.
    ///
    /// The caller restarts the descent afterwards: the split may have
    /// changed which node the key belongs into.
    fn split_node(
        &self,
        mut current: PageGuard<'a>,
        parent: Option<PageGuard<'a>>,
        current_pid: PageId,
        level: u16,
    ) -> Result<()> {
        let right_pid = self.create_new_node();
        let mut right = match self.manager.fix_page(right_pid, true) {
            Ok(guard) => guard,
            Err(e) => {
                self.manager.unfix_page(current, false);
                if let Some(p) = parent {
                    self.manager.unfix_page(p, false);
                }
                return Err(e);
            }
        };

        let separator = if level == 0 {
            LeafMut::<K, V>::new(current.data_mut()).split(right.data_mut())
        } else {
            InnerMut::<K>::new(current.data_mut()).split(right.data_mut())
        };

        let parent = match parent {
            Some(mut p) => {
                InnerMut::<K>::new(p.data_mut()).insert_split(&separator, right_pid);
                p
            }
            None => {
                // The split node was the root.
                match self.grow_root(level + 1, &separator, current_pid, right_pid) {
                    Ok(guard) => guard,
                    Err(e) => {
                        self.manager.unfix_page(right, true);
                        self.manager.unfix_page(current, true);
                        return Err(e);
                    }
                }
            }
        };

        self.manager.unfix_page(right, true);
        self.manager.unfix_page(current, true);
        self.manager.unfix_page(parent, true);
        Ok(())
    }

    /// Installs a new inner root with two children and publishes it.
    ///
    /// Returns the new root's page still fixed exclusively.
    fn grow_root(
        &self,
        level: u16,
        separator: &K,
        left_child: PageId,
        right_child: PageId,
    ) -> Result<PageGuard<'a>> {
        let pid = self.create_new_node();
        let mut page = self.manager.fix_page(pid, true)?;

        let mut root = InnerMut::<K>::init(page.data_mut(), level);
        root.set_count(2);
        root.set_key(0, separator);
        root.set_child(0, left_child);
        root.set_child(1, right_child);

        // Publish the root pid last; descents re-validate it after pinning.
        self.tree_height.fetch_add(1, Ordering::AcqRel);
        self.root.store(pid.as_u64(), Ordering::Release);

        Ok(page)
    }
}
