//! Router nodes carrying a bounded buffer of deferred operations.
//!
//! A B-epsilon router defers writes: instead of descending to a leaf, an
//! operation is parked in the router's buffer and only pushed down when the
//! buffer overflows. At most one buffered operation exists per key; a
//! second operation for the same key merges with the first.

use super::{IndexNode, LeafNode};
use crate::{
    cache::NodeCache,
    error::{Error, Result},
    pod::{KeyType, ValueType},
    storage::Storage,
    uid::FatUid,
};
use itertools::{EitherOrBoth, Itertools};

/// A deferred operation parked in a router buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op<V> {
    Insert(V),
    Update(V),
    Delete,
}

/// Merges a second buffered operation for the same key into the first.
///
/// The buffered prefix of the logical history stays bounded at one entry
/// per key. `None` means the entry vanishes (an insert undone by a delete).
pub(crate) fn merge_ops<V: Copy>(old: &Op<V>, new: &Op<V>) -> Result<Option<Op<V>>> {
    Ok(match (old, new) {
        (Op::Insert(_), Op::Insert(v)) => Some(Op::Insert(*v)),
        (Op::Insert(_), Op::Update(v)) => Some(Op::Insert(*v)),
        (Op::Insert(_), Op::Delete) => None,
        (Op::Update(_), Op::Insert(v)) => Some(Op::Insert(*v)),
        (Op::Update(_), Op::Update(v)) => Some(Op::Update(*v)),
        (Op::Update(_), Op::Delete) => Some(Op::Delete),
        (Op::Delete, Op::Insert(v)) => Some(Op::Insert(*v)),
        (Op::Delete, Op::Update(_)) => {
            return Err(Error::Unsupported("update buffered after delete"))
        }
        (Op::Delete, Op::Delete) => Some(Op::Delete),
    })
}

/// An [`IndexNode`] plus a sorted, per-key-unique operation buffer.
pub struct EpsilonIndexNode<K, V> {
    router: IndexNode<K>,
    buffer: Vec<(K, Op<V>)>,
}

impl<K: KeyType, V: ValueType> EpsilonIndexNode<K, V> {
    pub fn new(pivot: K, left: FatUid, right: FatUid) -> Self {
        EpsilonIndexNode {
            router: IndexNode::new(pivot, left, right),
            buffer: Vec::new(),
        }
    }

    pub(crate) fn from_parts(router: IndexNode<K>, buffer: Vec<(K, Op<V>)>) -> Self {
        EpsilonIndexNode { router, buffer }
    }

    pub(crate) fn router(&self) -> &IndexNode<K> {
        &self.router
    }

    pub(crate) fn router_mut(&mut self) -> &mut IndexNode<K> {
        &mut self.router
    }

    pub fn children(&self) -> &[FatUid] {
        self.router.children()
    }

    pub fn children_count(&self) -> usize {
        self.router.children_count()
    }

    pub fn pivot_count(&self) -> usize {
        self.router.pivot_count()
    }

    pub fn child_index(&self, key: &K) -> usize {
        self.router.child_index(key)
    }

    pub fn child_at(&self, idx: usize) -> FatUid {
        self.router.child_at(idx)
    }

    pub fn insert_pivot(&mut self, pivot: K, right: FatUid) {
        self.router.insert_pivot(pivot, right)
    }

    pub fn require_split(&self, degree: usize) -> bool {
        self.router.require_split(degree)
    }

    pub fn can_trigger_split(&self, degree: usize) -> bool {
        self.router.can_trigger_split(degree)
    }

    pub fn require_merge(&self, degree: usize) -> bool {
        self.router.require_merge(degree)
    }

    pub fn can_donate(&self, degree: usize) -> bool {
        self.router.can_donate(degree)
    }

    pub fn buffer(&self) -> &[(K, Op<V>)] {
        &self.buffer
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn needs_flush(&self, buffer_size: usize) -> bool {
        self.buffer.len() >= buffer_size
    }

    /// Parks an operation in the buffer, merging with an earlier operation
    /// for the same key.
    pub fn apply_op(&mut self, key: K, op: Op<V>) -> Result<()> {
        match self.buffer.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(idx) => match merge_ops(&self.buffer[idx].1, &op)? {
                Some(merged) => self.buffer[idx].1 = merged,
                None => {
                    self.buffer.remove(idx);
                }
            },
            Err(idx) => self.buffer.insert(idx, (key, op)),
        }
        Ok(())
    }

    /// The buffered operation for `key`, if any.
    pub fn buffered_for(&self, key: &K) -> Option<&Op<V>> {
        self.buffer
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| &self.buffer[idx].1)
    }

    /// Buffered entries with key in `[lo, hi]`.
    pub fn buffered_range<'a>(&'a self, lo: &K, hi: &K) -> impl Iterator<Item = &'a (K, Op<V>)> + 'a {
        let start = self.buffer.partition_point(|(k, _)| k < lo);
        let end = self.buffer.partition_point(|(k, _)| k <= hi);
        self.buffer[start..end].iter()
    }

    /// Detaches the whole buffer for a flush.
    pub fn take_buffer(&mut self) -> Vec<(K, Op<V>)> {
        std::mem::take(&mut self.buffer)
    }

    /// Splits off the upper half, partitioning the buffer alongside the
    /// pivots: entries with key at or above the promoted pivot belong to
    /// the sibling's subtree and move with it.
    pub fn split(&mut self) -> (K, EpsilonIndexNode<K, V>) {
        let (promoted, router) = self.router.split();
        let cut = self.buffer.partition_point(|(k, _)| *k < promoted);
        let buffer = self.buffer.split_off(cut);
        (promoted, EpsilonIndexNode { router, buffer })
    }

    /// Absorbs the right-hand sibling including its buffer. Subtree key
    /// ranges are disjoint, so collisions cannot occur in a consistent
    /// tree; the merge table is still applied rather than assumed away.
    pub(crate) fn absorb_right(&mut self, sep: K, other: &mut EpsilonIndexNode<K, V>) -> Result<()> {
        self.router.absorb_right(sep, &mut other.router);
        let mine = std::mem::take(&mut self.buffer);
        let theirs = std::mem::take(&mut other.buffer);
        let mut merged = Vec::with_capacity(mine.len() + theirs.len());
        for entry in mine
            .into_iter()
            .merge_join_by(theirs, |(a, _), (b, _)| a.cmp(b))
        {
            match entry {
                EitherOrBoth::Left(e) | EitherOrBoth::Right(e) => merged.push(e),
                EitherOrBoth::Both((k, old), (_, new)) => {
                    if let Some(op) = merge_ops(&old, &new)? {
                        merged.push((k, op));
                    }
                }
            }
        }
        self.buffer = merged;
        Ok(())
    }

    /// Rebalances an under-flowing leaf child through this node; same
    /// protocol as the plain router.
    pub(crate) fn rebalance_leaf_child<S: Storage>(
        &mut self,
        cache: &NodeCache<K, V, S>,
        self_uid: FatUid,
        child_uid: FatUid,
        child: &mut LeafNode<K, V>,
        key: &K,
        degree: usize,
    ) -> Result<Option<FatUid>> {
        self.router
            .rebalance_leaf_child(cache, self_uid, child_uid, child, key, degree)
    }

    /// Rebalances an under-flowing buffered-router child. Besides the pivot
    /// rotation of the plain router, buffered entries follow the subtree
    /// they route into.
    pub(crate) fn rebalance_epsilon_child<S: Storage>(
        &mut self,
        cache: &NodeCache<K, V, S>,
        self_uid: FatUid,
        child_uid: FatUid,
        child: &mut EpsilonIndexNode<K, V>,
        key: &K,
        degree: usize,
    ) -> Result<Option<FatUid>> {
        let idx = self.router.child_index(key);
        if self.router.children()[idx] != child_uid {
            return Err(Error::Internal("uid mismatch during rebalance"));
        }

        let mut left = None;
        if idx > 0 {
            let uid = self.router.child_at(idx - 1);
            let handle = cache.get_with_parent(uid, Some(self_uid))?;
            left = Some((uid, handle.write()?));
        }
        let mut right = None;
        if idx < self.router.pivot_count() {
            let uid = self.router.child_at(idx + 1);
            let handle = cache.get_with_parent(uid, Some(self_uid))?;
            right = Some((uid, handle.write()?));
        }

        if let Some((_, guard)) = left.as_mut() {
            let sibling = guard.as_epsilon_mut()?;
            if sibling.can_donate(degree) {
                let (moved_pivot, moved_child) = sibling.router.pop_last();
                let sep =
                    std::mem::replace(&mut self.router.pivots_mut()[idx - 1], moved_pivot);
                child.router.push_front(sep, moved_child);
                // Buffered entries routing into the moved subtree follow it.
                let cut = sibling.buffer.partition_point(|(k, _)| *k < moved_pivot);
                let moved: Vec<_> = sibling.buffer.split_off(cut);
                child.buffer.splice(0..0, moved);
                cache.try_update_parent_uid(moved_child, child_uid);
                return Ok(None);
            }
        }
        if let Some((_, guard)) = right.as_mut() {
            let sibling = guard.as_epsilon_mut()?;
            if sibling.can_donate(degree) {
                let (moved_pivot, moved_child) = sibling.router.pop_first();
                let sep = std::mem::replace(&mut self.router.pivots_mut()[idx], moved_pivot);
                child.router.push_back(sep, moved_child);
                let cut = sibling.buffer.partition_point(|(k, _)| *k < moved_pivot);
                let moved: Vec<_> = sibling.buffer.drain(..cut).collect();
                child.buffer.extend(moved);
                cache.try_update_parent_uid(moved_child, child_uid);
                return Ok(None);
            }
        }

        if let Some((uid, mut guard)) = left {
            let sibling = guard.as_epsilon_mut()?;
            let adopted = child.router.children().to_vec();
            let sep = self.router.remove_separator(idx - 1);
            sibling.absorb_right(sep, child)?;
            for grandchild in adopted {
                cache.try_update_parent_uid(grandchild, uid);
            }
            self.router.remove_child(idx);
            return Ok(Some(child_uid));
        }
        if let Some((uid, mut guard)) = right {
            let sibling = guard.as_epsilon_mut()?;
            let adopted = sibling.router.children().to_vec();
            let sep = self.router.remove_separator(idx);
            child.absorb_right(sep, sibling)?;
            for grandchild in adopted {
                cache.try_update_parent_uid(grandchild, child_uid);
            }
            self.router.remove_child(idx + 1);
            return Ok(Some(uid));
        }

        Err(Error::Internal("no sibling available for rebalance"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn node() -> EpsilonIndexNode<u64, u64> {
        EpsilonIndexNode::new(10, FatUid::volatile(0), FatUid::volatile(1))
    }

    #[test]
    fn buffer_stays_sorted_and_unique() {
        let mut n = node();
        n.apply_op(7, Op::Insert(70)).unwrap();
        n.apply_op(3, Op::Insert(30)).unwrap();
        n.apply_op(5, Op::Delete).unwrap();
        n.apply_op(7, Op::Update(77)).unwrap();
        let keys: Vec<u64> = n.buffer().iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 5, 7]);
        assert_eq!(n.buffered_for(&7), Some(&Op::Insert(77)));
    }

    #[test]
    fn insert_update_delete_insert_collapses() {
        // The merge table keeps one entry per key through a full lifecycle.
        let mut n = node();
        n.apply_op(7, Op::Insert(70)).unwrap();
        n.apply_op(7, Op::Update(77)).unwrap();
        n.apply_op(7, Op::Delete).unwrap();
        assert_eq!(n.buffer_len(), 0);
        n.apply_op(7, Op::Insert(700)).unwrap();
        assert_eq!(n.buffer_len(), 1);
        assert_eq!(n.buffered_for(&7), Some(&Op::Insert(700)));
    }

    #[test]
    fn update_after_delete_is_rejected() {
        let mut n = node();
        n.apply_op(7, Op::Update(77)).unwrap();
        n.apply_op(7, Op::Delete).unwrap();
        assert_eq!(n.buffered_for(&7), Some(&Op::Delete));
        assert!(matches!(
            n.apply_op(7, Op::Update(78)),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn split_partitions_buffer_with_routing() {
        let mut n = EpsilonIndexNode::from_parts(
            IndexNode::from_parts(
                vec![10, 20, 30, 40],
                vec![
                    FatUid::volatile(0),
                    FatUid::volatile(1),
                    FatUid::volatile(2),
                    FatUid::volatile(3),
                    FatUid::volatile(4),
                ],
            ),
            vec![
                (5, Op::Insert(50)),
                (30, Op::Insert(300)),
                (35, Op::Delete),
            ],
        );
        let (promoted, sibling) = n.split();
        assert_eq!(promoted, 30);
        // Key 30 routes right of pivot 30, so its entry moves to the sibling.
        let left_keys: Vec<u64> = n.buffer().iter().map(|(k, _)| *k).collect();
        let right_keys: Vec<u64> = sibling.buffer().iter().map(|(k, _)| *k).collect();
        assert_eq!(left_keys, vec![5]);
        assert_eq!(right_keys, vec![30, 35]);
    }

    #[quickcheck]
    fn merged_ops_never_duplicate_keys(ops: Vec<(u8, u8)>) -> bool {
        let mut n: EpsilonIndexNode<u64, u64> = node();
        for (key, kind) in ops {
            let key = (key % 8) as u64;
            let op = match kind % 3 {
                0 => Op::Insert(u64::from(kind)),
                1 => Op::Update(u64::from(kind)),
                _ => Op::Delete,
            };
            // Update-after-delete is rejected; any other outcome must keep
            // the buffer sorted and per-key unique.
            let _ = n.apply_op(key, op);
        }
        n.buffer().windows(2).all(|w| w[0].0 < w[1].0)
    }
}
