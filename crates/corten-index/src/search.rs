//! Branchless lower-bound search.
//!
//! The inner hot loop of both point lookup and tree descent. The halving
//! loop updates the search index with a conditionally chosen increment
//! instead of branching on the comparison, which keeps the probe pattern
//! predictable.

/// Returns the smallest index `i` in `[0, len]` such that the element at
/// `i` is not less than `key`, reading elements through `element_at`.
///
/// `element_at` must present a sorted sequence of `len` elements; indices
/// passed to it are always in `[0, len)`.
pub fn lower_bound_by<K, F>(len: usize, key: &K, mut element_at: F) -> usize
where
    K: Ord,
    F: FnMut(usize) -> K,
{
    if len == 0 {
        return 0;
    }

    let mut remaining = len;
    let mut index = 0;

    loop {
        let half = remaining / 2;
        if half == 0 {
            break;
        }
        let probe = index + half;
        index = if element_at(probe) < *key { probe } else { index };
        remaining -= half;
    }

    if element_at(index) < *key {
        index += 1;
    }
    index
}

/// Returns the smallest index `i` in `[0, items.len()]` such that
/// `items[i] >= key`, or `items.len()` if no such element exists.
pub fn lower_bound<T: Ord>(items: &[T], key: &T) -> usize {
    lower_bound_by(items.len(), &key, |i| &items[i])
}
