//! Router nodes: pivot keys plus child uids.

use super::{router_min_children, LeafNode};
use crate::{
    cache::NodeCache,
    error::{Error, Result},
    pod::{KeyType, ValueType},
    storage::Storage,
    uid::FatUid,
};

/// A pure router: `|children| = |pivots| + 1`, pivots strictly increasing.
/// Pivot `p[i]` separates child `i` from child `i + 1`; keys equal to a
/// pivot route right.
pub struct IndexNode<K> {
    pivots: Vec<K>,
    children: Vec<FatUid>,
}

impl<K: KeyType> IndexNode<K> {
    pub fn new(pivot: K, left: FatUid, right: FatUid) -> Self {
        IndexNode {
            pivots: vec![pivot],
            children: vec![left, right],
        }
    }

    pub(crate) fn from_parts(pivots: Vec<K>, children: Vec<FatUid>) -> Self {
        debug_assert_eq!(children.len(), pivots.len() + 1);
        IndexNode { pivots, children }
    }

    pub fn pivots(&self) -> &[K] {
        &self.pivots
    }

    pub fn children(&self) -> &[FatUid] {
        &self.children
    }

    pub fn pivot_count(&self) -> usize {
        self.pivots.len()
    }

    pub fn children_count(&self) -> usize {
        self.children.len()
    }

    /// Index of the child responsible for `key`: the number of pivots `<= key`.
    pub fn child_index(&self, key: &K) -> usize {
        self.pivots.partition_point(|p| p <= key)
    }

    pub fn child_at(&self, idx: usize) -> FatUid {
        self.children[idx]
    }

    pub fn child_for(&self, key: &K) -> FatUid {
        self.children[self.child_index(key)]
    }

    /// Inserts a promoted pivot and the uid of the new right half.
    pub fn insert_pivot(&mut self, pivot: K, right: FatUid) {
        let idx = self.pivots.partition_point(|p| p < &pivot);
        self.pivots.insert(idx, pivot);
        self.children.insert(idx + 1, right);
    }

    pub fn require_split(&self, degree: usize) -> bool {
        self.pivots.len() > degree
    }

    pub fn can_trigger_split(&self, degree: usize) -> bool {
        self.pivots.len() + 1 > degree
    }

    pub fn require_merge(&self, degree: usize) -> bool {
        self.children.len() < router_min_children(degree)
    }

    pub fn can_trigger_merge(&self, degree: usize) -> bool {
        self.children.len() <= router_min_children(degree)
    }

    /// Whether this router can give up a child and stay legal.
    pub fn can_donate(&self, degree: usize) -> bool {
        self.children.len() > router_min_children(degree)
    }

    /// Splits off the upper half. The promoted pivot leaves this node; the
    /// sibling takes `pivots[mid + 1..]` and `children[mid + 1..]`.
    pub fn split(&mut self) -> (K, IndexNode<K>) {
        let mid = self.pivots.len() / 2;
        let sib_pivots = self.pivots.split_off(mid + 1);
        let sib_children = self.children.split_off(mid + 1);
        let promoted = self.pivots.pop().unwrap();
        (
            promoted,
            IndexNode {
                pivots: sib_pivots,
                children: sib_children,
            },
        )
    }

    /// Rewrites one child uid after the child acquired a new identity.
    pub fn update_child_uid(&mut self, old: FatUid, new: FatUid) -> Result<()> {
        match self.children.iter_mut().find(|c| **c == old) {
            Some(slot) => {
                *slot = new;
                Ok(())
            }
            None => Err(Error::Internal("stale child uid during rewrite")),
        }
    }

    pub(crate) fn set_child_at(&mut self, idx: usize, uid: FatUid) {
        self.children[idx] = uid;
    }

    pub(crate) fn pivots_mut(&mut self) -> &mut [K] {
        &mut self.pivots
    }

    pub(crate) fn remove_separator(&mut self, idx: usize) -> K {
        self.pivots.remove(idx)
    }

    pub(crate) fn remove_child(&mut self, idx: usize) -> FatUid {
        self.children.remove(idx)
    }

    pub(crate) fn pop_last(&mut self) -> (K, FatUid) {
        (self.pivots.pop().unwrap(), self.children.pop().unwrap())
    }

    pub(crate) fn pop_first(&mut self) -> (K, FatUid) {
        (self.pivots.remove(0), self.children.remove(0))
    }

    pub(crate) fn push_front(&mut self, pivot: K, child: FatUid) {
        self.pivots.insert(0, pivot);
        self.children.insert(0, child);
    }

    pub(crate) fn push_back(&mut self, pivot: K, child: FatUid) {
        self.pivots.push(pivot);
        self.children.push(child);
    }

    /// Absorbs the right-hand sibling, with `sep` (the former parent pivot)
    /// as the new pivot in the middle.
    pub(crate) fn absorb_right(&mut self, sep: K, other: &mut IndexNode<K>) {
        self.pivots.push(sep);
        self.pivots.append(&mut other.pivots);
        self.children.append(&mut other.children);
    }

    /// Rebalances an under-flowing leaf child through this node. Tries to
    /// borrow from the left sibling, then the right; otherwise merges
    /// left-first. Returns the uid of a node that was merged away, which
    /// the caller must drop from the cache.
    pub(crate) fn rebalance_leaf_child<V, S>(
        &mut self,
        cache: &NodeCache<K, V, S>,
        self_uid: FatUid,
        child_uid: FatUid,
        child: &mut LeafNode<K, V>,
        key: &K,
        degree: usize,
    ) -> Result<Option<FatUid>>
    where
        V: ValueType,
        S: Storage,
    {
        let idx = self.child_index(key);
        if self.children[idx] != child_uid {
            return Err(Error::Internal("uid mismatch during rebalance"));
        }

        let mut left = None;
        if idx > 0 {
            let uid = self.children[idx - 1];
            let handle = cache.get_with_parent(uid, Some(self_uid))?;
            left = Some((uid, handle.write()?));
        }
        let mut right = None;
        if idx < self.pivots.len() {
            let uid = self.children[idx + 1];
            let handle = cache.get_with_parent(uid, Some(self_uid))?;
            right = Some((uid, handle.write()?));
        }

        if let Some((_, guard)) = left.as_mut() {
            let sibling = guard.as_leaf_mut()?;
            if sibling.can_donate(degree) {
                self.pivots[idx - 1] = child.borrow_from_left(sibling);
                return Ok(None);
            }
        }
        if let Some((_, guard)) = right.as_mut() {
            let sibling = guard.as_leaf_mut()?;
            if sibling.can_donate(degree) {
                self.pivots[idx] = child.borrow_from_right(sibling);
                return Ok(None);
            }
        }

        if let Some((_, mut guard)) = left {
            let sibling = guard.as_leaf_mut()?;
            sibling.append(child);
            self.pivots.remove(idx - 1);
            self.children.remove(idx);
            return Ok(Some(child_uid));
        }
        if let Some((uid, mut guard)) = right {
            let sibling = guard.as_leaf_mut()?;
            child.append(sibling);
            self.pivots.remove(idx);
            self.children.remove(idx + 1);
            return Ok(Some(uid));
        }

        Err(Error::Internal("no sibling available for rebalance"))
    }

    /// Rebalances an under-flowing router child. Borrowing rotates an entry
    /// through the parent pivot; merging absorbs the separator pivot. Moved
    /// grandchildren get their parent back-pointer migrated.
    pub(crate) fn rebalance_index_child<V, S>(
        &mut self,
        cache: &NodeCache<K, V, S>,
        self_uid: FatUid,
        child_uid: FatUid,
        child: &mut IndexNode<K>,
        key: &K,
        degree: usize,
    ) -> Result<Option<FatUid>>
    where
        V: ValueType,
        S: Storage,
    {
        let idx = self.child_index(key);
        if self.children[idx] != child_uid {
            return Err(Error::Internal("uid mismatch during rebalance"));
        }

        let mut left = None;
        if idx > 0 {
            let uid = self.children[idx - 1];
            let handle = cache.get_with_parent(uid, Some(self_uid))?;
            left = Some((uid, handle.write()?));
        }
        let mut right = None;
        if idx < self.pivots.len() {
            let uid = self.children[idx + 1];
            let handle = cache.get_with_parent(uid, Some(self_uid))?;
            right = Some((uid, handle.write()?));
        }

        if let Some((_, guard)) = left.as_mut() {
            let sibling = guard.as_index_mut()?;
            if sibling.can_donate(degree) {
                let (moved_pivot, moved_child) = sibling.pop_last();
                let sep = std::mem::replace(&mut self.pivots[idx - 1], moved_pivot);
                child.push_front(sep, moved_child);
                cache.try_update_parent_uid(moved_child, child_uid);
                return Ok(None);
            }
        }
        if let Some((_, guard)) = right.as_mut() {
            let sibling = guard.as_index_mut()?;
            if sibling.can_donate(degree) {
                let (moved_pivot, moved_child) = sibling.pop_first();
                let sep = std::mem::replace(&mut self.pivots[idx], moved_pivot);
                child.push_back(sep, moved_child);
                cache.try_update_parent_uid(moved_child, child_uid);
                return Ok(None);
            }
        }

        if let Some((uid, mut guard)) = left {
            let sibling = guard.as_index_mut()?;
            let adopted = child.children.clone();
            let sep = self.pivots.remove(idx - 1);
            sibling.absorb_right(sep, child);
            for grandchild in adopted {
                cache.try_update_parent_uid(grandchild, uid);
            }
            self.children.remove(idx);
            return Ok(Some(child_uid));
        }
        if let Some((uid, mut guard)) = right {
            let sibling = guard.as_index_mut()?;
            let adopted = sibling.children.clone();
            let sep = self.pivots.remove(idx);
            child.absorb_right(sep, sibling);
            for grandchild in adopted {
                cache.try_update_parent_uid(grandchild, child_uid);
            }
            self.children.remove(idx + 1);
            return Ok(Some(uid));
        }

        Err(Error::Internal("no sibling available for rebalance"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u64) -> FatUid {
        FatUid::volatile(n)
    }

    fn router() -> IndexNode<u64> {
        IndexNode::from_parts(vec![10, 20, 30], vec![uid(0), uid(1), uid(2), uid(3)])
    }

    #[test]
    fn routing_sends_equal_keys_right() {
        let node = router();
        assert_eq!(node.child_index(&5), 0);
        assert_eq!(node.child_index(&10), 1);
        assert_eq!(node.child_index(&15), 1);
        assert_eq!(node.child_index(&30), 3);
        assert_eq!(node.child_index(&99), 3);
    }

    #[test]
    fn pivot_insertion() {
        let mut node = router();
        node.insert_pivot(25, uid(9));
        assert_eq!(node.pivots(), &[10, 20, 25, 30]);
        assert_eq!(node.children(), &[uid(0), uid(1), uid(2), uid(9), uid(3)]);
    }

    #[test]
    fn split_promotes_middle_pivot() {
        let mut node =
            IndexNode::from_parts(vec![10, 20, 30, 40], vec![uid(0), uid(1), uid(2), uid(3), uid(4)]);
        let (promoted, sibling) = node.split();
        assert_eq!(promoted, 30);
        assert_eq!(node.pivots(), &[10, 20]);
        assert_eq!(node.children(), &[uid(0), uid(1), uid(2)]);
        assert_eq!(sibling.pivots(), &[40]);
        assert_eq!(sibling.children(), &[uid(3), uid(4)]);
    }

    #[test]
    fn child_uid_rewrite() {
        let mut node = router();
        node.update_child_uid(uid(2), FatUid::file(64, 32)).unwrap();
        assert_eq!(node.child_at(2), FatUid::file(64, 32));
        assert!(node.update_child_uid(uid(2), uid(7)).is_err());
    }

    #[test]
    fn rebalance_prefers_left_merge() {
        use crate::{cache::NodeCache, config::CacheConfig, node::LeafNode, storage::NoBacking};

        let cache: NodeCache<u64, u64, NoBacking> =
            NodeCache::new(CacheConfig::default(), NoBacking::new());
        let mut left = LeafNode::new();
        left.insert(1, 10);
        left.insert(2, 20);
        let mut right = LeafNode::new();
        right.insert(5, 50);
        right.insert(6, 60);
        let (left_uid, _l) = cache.insert_new(crate::node::NodeVariant::Leaf(left), None);
        let (right_uid, _r) = cache.insert_new(crate::node::NodeVariant::Leaf(right), None);

        let mut child = LeafNode::new();
        child.insert(3, 30);
        let (child_uid, _c) =
            cache.insert_new(crate::node::NodeVariant::Leaf(LeafNode::new()), None);
        let mut parent =
            IndexNode::from_parts(vec![3, 5], vec![left_uid, child_uid, right_uid]);

        // Neither sibling can donate, both could merge: left wins.
        let gone = parent
            .rebalance_leaf_child(&cache, uid(99), child_uid, &mut child, &3, 3)
            .unwrap();
        assert_eq!(gone, Some(child_uid));
        assert_eq!(parent.pivots(), &[5]);
        assert_eq!(parent.children(), &[left_uid, right_uid]);
        let left_handle = cache.get(left_uid).unwrap();
        let guard = left_handle.read().unwrap();
        assert_eq!(guard.as_leaf().unwrap().keys(), &[1, 2, 3]);
    }

    #[test]
    fn rebalance_prefers_left_borrow() {
        use crate::{cache::NodeCache, config::CacheConfig, node::LeafNode, storage::NoBacking};

        let cache: NodeCache<u64, u64, NoBacking> =
            NodeCache::new(CacheConfig::default(), NoBacking::new());
        let mut left = LeafNode::new();
        for k in [1, 2, 3] {
            left.insert(k, k * 10);
        }
        let mut right = LeafNode::new();
        for k in [5, 6, 7] {
            right.insert(k, k * 10);
        }
        let (left_uid, _l) = cache.insert_new(crate::node::NodeVariant::Leaf(left), None);
        let (right_uid, _r) = cache.insert_new(crate::node::NodeVariant::Leaf(right), None);

        let mut child = LeafNode::new();
        child.insert(4, 40);
        let (child_uid, _c) =
            cache.insert_new(crate::node::NodeVariant::Leaf(LeafNode::new()), None);
        let mut parent =
            IndexNode::from_parts(vec![4, 5], vec![left_uid, child_uid, right_uid]);

        // Both siblings can donate: the left one is asked first.
        let gone = parent
            .rebalance_leaf_child(&cache, uid(99), child_uid, &mut child, &4, 3)
            .unwrap();
        assert_eq!(gone, None);
        assert_eq!(parent.pivots(), &[3, 5]);
        assert_eq!(child.keys(), &[3, 4]);
        let right_handle = cache.get(right_uid).unwrap();
        let guard = right_handle.read().unwrap();
        assert_eq!(guard.as_leaf().unwrap().keys(), &[5, 6, 7]);
    }

    #[test]
    fn absorb_right_keeps_shape() {
        let mut lhs = IndexNode::from_parts(vec![10], vec![uid(0), uid(1)]);
        let mut rhs = IndexNode::from_parts(vec![30], vec![uid(2), uid(3)]);
        lhs.absorb_right(20, &mut rhs);
        assert_eq!(lhs.pivots(), &[10, 20, 30]);
        assert_eq!(lhs.children_count(), lhs.pivot_count() + 1);
    }
}
