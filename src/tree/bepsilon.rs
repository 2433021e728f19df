//! The B-epsilon tree driver: writes park in router buffers and trickle down in
//! batches; reads compose the buffered operations over the leaf state.

use super::{check_subtree, subtree_depth};
use crate::{
    cache::NodeCache,
    config::StoreConfig,
    error::{Error, Result},
    node::{EpsilonIndexNode, LeafNode, NodeVariant, Op},
    pod::{KeyType, ValueType},
    storage::Storage,
    uid::FatUid,
};
use log::trace;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Write-optimised ordered key-value store. Every router carries a bounded
/// message buffer; an operation is acknowledged once it is buffered at the
/// root and only reaches a leaf through cascaded flushes.
pub struct BEpsilonStore<K, V, S> {
    degree: usize,
    buffer_size: usize,
    cache: NodeCache<K, V, S>,
    root: RwLock<Option<FatUid>>,
}

impl<K: KeyType, V: ValueType, S: Storage> BEpsilonStore<K, V, S> {
    pub fn new(config: StoreConfig, storage: S) -> Self {
        crate::maybe_init_env_logger();
        BEpsilonStore {
            degree: config.degree.max(2),
            buffer_size: config.buffer_size.max(1),
            cache: NodeCache::new(config.cache, storage),
            root: RwLock::new(None),
        }
    }

    /// Creates the empty root leaf. Operations before `init` report
    /// [`Error::TreeEmpty`].
    pub fn init(&self) -> Result<()> {
        let mut root = self.root.write();
        if root.is_some() {
            return Err(Error::Internal("store is already initialised"));
        }
        let (uid, _) = self
            .cache
            .insert_new(NodeVariant::Leaf(LeafNode::new()), None);
        *root = Some(uid);
        Ok(())
    }

    pub fn cache(&self) -> &NodeCache<K, V, S> {
        &self.cache
    }

    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.apply(key, Op::Insert(value))
    }

    /// Buffered update. The distinction from insert matters for merging:
    /// an update buffered after a delete is rejected instead of
    /// resurrecting the key, and an update of a key that never existed is
    /// unsupported (reported here on a bare-leaf tree, at read time once
    /// routers buffer the operation).
    pub fn update(&self, key: K, value: V) -> Result<()> {
        self.apply(key, Op::Update(value))
    }

    /// Buffered removal. Absence of the key is not reported here; it is
    /// observed at read time after the overlay.
    pub fn remove(&self, key: &K) -> Result<()> {
        self.apply(*key, Op::Delete)
    }

    pub fn search(&self, key: &K) -> Result<V> {
        let result = self.search_inner(key);
        let evict = self.cache.evict_excess();
        result.and_then(|value| evict.map(|_| value))
    }

    /// All live entries with key in `[lo, hi]`, in key order. Buffered
    /// operations take precedence over leaf rows; buffered deletes
    /// suppress them.
    pub fn range_query(&self, lo: &K, hi: &K) -> Result<Vec<(K, V)>> {
        let result = self.range_inner(lo, hi);
        let evict = self.cache.evict_excess();
        result.and_then(|rows| evict.map(|_| rows))
    }

    /// Sorts the pairs, then inserts them in order; stops at the first
    /// failure.
    pub fn bulk_insert<I>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut pairs: Vec<(K, V)> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in pairs {
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Number of levels including the leaf level.
    pub fn depth(&self) -> Result<usize> {
        let root_lock = self.root.read();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        subtree_depth(&self.cache, root_uid)
    }

    /// Persists every dirty node and returns the root's file uid.
    pub fn flush(&self) -> Result<FatUid> {
        let mut root_lock = self.root.write();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        let new_root = self.cache.flush_all(root_uid)?;
        *root_lock = Some(new_root);
        Ok(new_root)
    }

    /// Walks the whole tree and verifies the structural invariants,
    /// including buffer ordering and routing bounds.
    pub fn check_invariants(&self) -> Result<()> {
        let root_lock = self.root.read();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        check_subtree(&self.cache, root_uid, self.degree, true, None, None)?;
        Ok(())
    }

    fn apply(&self, key: K, op: Op<V>) -> Result<()> {
        let result = self.apply_inner(key, op);
        let evict = self.cache.evict_excess();
        result.and(evict)
    }

    fn apply_inner(&self, key: K, op: Op<V>) -> Result<()> {
        let mut root_lock = self.root.write();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        let handle = self.cache.get(root_uid)?;
        let mut guard = handle.write()?;

        enum RootAction<K> {
            Keep,
            Grow { promotions: Vec<(K, FatUid)> },
            Collapse { sole_child: FatUid },
        }

        let action = match &mut *guard {
            // Only a tree without routers applies operations directly.
            NodeVariant::Leaf(leaf) => {
                match op {
                    Op::Insert(value) => leaf.insert(key, value),
                    // The router path observes an update on an absent key at
                    // read time and reports it as unsupported; the bare-leaf
                    // tree observes it here and must agree on the verdict.
                    Op::Update(value) => match leaf.update(&key, value) {
                        Ok(()) => {}
                        Err(Error::KeyNotFound) => {
                            return Err(Error::Unsupported("update overlays an absent key"))
                        }
                        Err(err) => return Err(err),
                    },
                    Op::Delete => match leaf.remove(&key) {
                        Ok(_) | Err(Error::KeyNotFound) => {}
                        Err(err) => return Err(err),
                    },
                }
                if leaf.require_split(self.degree) {
                    let (pivot, sibling) = leaf.split();
                    let (right, _) = self.cache.insert_new(NodeVariant::Leaf(sibling), None);
                    RootAction::Grow {
                        promotions: vec![(pivot, right)],
                    }
                } else {
                    RootAction::Keep
                }
            }
            NodeVariant::Epsilon(node) => {
                node.apply_op(key, op)?;
                if node.needs_flush(self.buffer_size) {
                    self.flush_router(root_uid, node)?;
                }
                if node.require_split(self.degree) {
                    // A flush can leave the root far beyond the degree, so
                    // halving once is not enough; shed right halves until
                    // everything fits.
                    let mut promotions = Vec::new();
                    let mut pending = Vec::new();
                    while node.require_split(self.degree) {
                        let (pivot, right) = self.detach_right_half(node, None)?;
                        promotions.push((pivot, right.0));
                        pending.push(right);
                    }
                    while let Some((_, handle)) = pending.pop() {
                        let mut sib_guard = handle.write()?;
                        let sibling = sib_guard.as_epsilon_mut()?;
                        while sibling.require_split(self.degree) {
                            let (pivot, right) = self.detach_right_half(sibling, None)?;
                            promotions.push((pivot, right.0));
                            pending.push(right);
                        }
                    }
                    RootAction::Grow { promotions }
                } else if node.pivot_count() == 0 {
                    // Child merges during the flush left a single subtree.
                    if node.buffer_len() > 0 {
                        self.flush_router(root_uid, node)?;
                    }
                    RootAction::Collapse {
                        sole_child: node.child_at(0),
                    }
                } else {
                    RootAction::Keep
                }
            }
            NodeVariant::Index(_) => {
                return Err(Error::Internal("plain router in a b-epsilon tree"))
            }
        };

        drop(guard);
        match action {
            RootAction::Keep => {}
            RootAction::Grow { promotions } => {
                self.grow_root(&mut root_lock, root_uid, promotions)?
            }
            RootAction::Collapse { sole_child } => {
                *root_lock = Some(sole_child);
                self.cache.clear_parent(sole_child);
                self.cache.remove(root_uid)?;
                trace!("bepsilon: root collapsed into {sole_child}");
            }
        }
        Ok(())
    }

    /// Splits off the right half of an oversized router into a fresh cache
    /// entry, returning the promoted pivot and the new sibling.
    fn detach_right_half(
        &self,
        node: &mut EpsilonIndexNode<K, V>,
        parent: Option<FatUid>,
    ) -> Result<(K, (FatUid, crate::cache::NodeRef<K, V>))> {
        let (pivot, sibling) = node.split();
        let adopted = sibling.children().to_vec();
        let (sib_uid, sib_handle) = self
            .cache
            .insert_new(NodeVariant::Epsilon(sibling), parent);
        for grandchild in adopted {
            self.cache.try_update_parent_uid(grandchild, sib_uid);
        }
        Ok((pivot, (sib_uid, sib_handle)))
    }

    /// Installs a new root router above the old root and the split-off
    /// siblings. Each promotion is a (pivot, right subtree) pair; insertion
    /// order does not matter, the pivot positions do.
    fn grow_root(
        &self,
        root_lock: &mut parking_lot::RwLockWriteGuard<'_, Option<FatUid>>,
        old_root: FatUid,
        promotions: Vec<(K, FatUid)>,
    ) -> Result<()> {
        let mut promotions = promotions.into_iter();
        let (first_pivot, first_right) = promotions
            .next()
            .ok_or(Error::Internal("root split without a promoted pivot"))?;
        let mut root = EpsilonIndexNode::new(first_pivot, old_root, first_right);
        for (pivot, right) in promotions {
            root.insert_pivot(pivot, right);
        }
        let children = root.children().to_vec();
        let (new_root, _) = self.cache.insert_new(NodeVariant::Epsilon(root), None);
        for child in children {
            self.cache.try_update_parent_uid(child, new_root);
        }
        **root_lock = Some(new_root);
        trace!("bepsilon: root split, new root {new_root}");
        Ok(())
    }

    /// Pushes every buffered operation of `node` into the responsible
    /// child, in key order. A child router absorbs them into its own
    /// buffer and may cascade; a leaf materialises them, which may split
    /// or under-flow it. The buffer is detached up front and therefore
    /// cleared as a whole.
    fn flush_router(&self, uid: FatUid, node: &mut EpsilonIndexNode<K, V>) -> Result<()> {
        trace!("bepsilon: flushing {} ops from {uid}", node.buffer_len());
        let entries = node.take_buffer();
        for (key, op) in entries {
            let idx = node.child_index(&key);
            let child_uid = node.child_at(idx);
            let child_handle = self.cache.get_with_parent(child_uid, Some(uid))?;
            let mut child_guard = child_handle.write()?;

            let mut merged_away = None;
            match &mut *child_guard {
                NodeVariant::Leaf(leaf) => {
                    match op {
                        Op::Insert(value) => leaf.insert(key, value),
                        // A buffered update whose key never reached a leaf
                        // materialises as an insert; the strict verdict is
                        // the read path's job.
                        Op::Update(value) => leaf.insert(key, value),
                        Op::Delete => match leaf.remove(&key) {
                            Ok(_) | Err(Error::KeyNotFound) => {}
                            Err(err) => return Err(err),
                        },
                    }
                    if leaf.require_split(self.degree) {
                        let (pivot, sibling) = leaf.split();
                        let (sib_uid, _) =
                            self.cache.insert_new(NodeVariant::Leaf(sibling), Some(uid));
                        node.insert_pivot(pivot, sib_uid);
                    } else if leaf.require_merge(self.degree) && node.children_count() > 1 {
                        merged_away = node.rebalance_leaf_child(
                            &self.cache,
                            uid,
                            child_uid,
                            leaf,
                            &key,
                            self.degree,
                        )?;
                    }
                }
                NodeVariant::Epsilon(child) => {
                    child.apply_op(key, op)?;
                    if child.needs_flush(self.buffer_size) {
                        self.flush_router(child_uid, child)?;
                        if child.require_split(self.degree) {
                            // The cascade can leave the child far beyond the
                            // degree; keep shedding right halves until it
                            // and every shed half fit.
                            let mut pending = Vec::new();
                            while child.require_split(self.degree) {
                                let (pivot, right) =
                                    self.detach_right_half(child, Some(uid))?;
                                node.insert_pivot(pivot, right.0);
                                pending.push(right);
                            }
                            while let Some((_, handle)) = pending.pop() {
                                let mut sib_guard = handle.write()?;
                                let sibling = sib_guard.as_epsilon_mut()?;
                                while sibling.require_split(self.degree) {
                                    let (pivot, right) =
                                        self.detach_right_half(sibling, Some(uid))?;
                                    node.insert_pivot(pivot, right.0);
                                    pending.push(right);
                                }
                            }
                        } else if child.require_merge(self.degree) && node.children_count() > 1
                        {
                            merged_away = node.rebalance_epsilon_child(
                                &self.cache,
                                uid,
                                child_uid,
                                child,
                                &key,
                                self.degree,
                            )?;
                        }
                    }
                }
                NodeVariant::Index(_) => {
                    return Err(Error::Internal("plain router in a b-epsilon tree"))
                }
            }
            drop(child_guard);
            if let Some(gone) = merged_away {
                trace!("bepsilon: merged away {gone}");
                self.cache.remove(gone)?;
            }
        }
        Ok(())
    }

    fn search_inner(&self, key: &K) -> Result<V> {
        let root_lock = self.root.read();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        let mut current_uid = root_uid;
        let mut guard = self.cache.get(current_uid)?.read()?;
        drop(root_lock);

        // Buffered operations for the key, root-most first.
        let mut ops: Vec<Op<V>> = Vec::new();
        loop {
            let child = match &*guard {
                NodeVariant::Epsilon(node) => {
                    if let Some(op) = node.buffered_for(key) {
                        ops.push(*op);
                    }
                    node.child_at(node.child_index(key))
                }
                NodeVariant::Leaf(leaf) => {
                    let mut current = leaf.get(key).copied();
                    // Leaf-most op first; the root-most op is the newest
                    // and wins.
                    for op in ops.iter().rev() {
                        match op {
                            Op::Delete => current = None,
                            Op::Insert(value) => current = Some(*value),
                            Op::Update(value) => {
                                if current.is_none() {
                                    return Err(Error::Unsupported(
                                        "update overlays an absent key",
                                    ));
                                }
                                current = Some(*value);
                            }
                        }
                    }
                    return current.ok_or(Error::KeyNotFound);
                }
                NodeVariant::Index(_) => {
                    return Err(Error::Internal("plain router in a b-epsilon tree"))
                }
            };
            let child_guard = self.cache.get_with_parent(child, Some(current_uid))?.read()?;
            guard = child_guard;
            current_uid = child;
        }
    }

    fn range_inner(&self, lo: &K, hi: &K) -> Result<Vec<(K, V)>> {
        if hi < lo {
            return Ok(Vec::new());
        }
        let root_lock = self.root.read();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        let mut acc: BTreeMap<K, Option<V>> = BTreeMap::new();
        self.collect_range(root_uid, None, lo, hi, &mut acc)?;
        drop(root_lock);
        Ok(acc
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    fn collect_range(
        &self,
        uid: FatUid,
        parent: Option<FatUid>,
        lo: &K,
        hi: &K,
        acc: &mut BTreeMap<K, Option<V>>,
    ) -> Result<()> {
        let guard = self.cache.get_with_parent(uid, parent)?.read()?;
        match &*guard {
            NodeVariant::Epsilon(node) => {
                // First writer wins: an op recorded nearer the root is the
                // newest and shadows deeper entries and leaf rows.
                for &(key, op) in node.buffered_range(lo, hi) {
                    acc.entry(key).or_insert(match op {
                        Op::Insert(value) | Op::Update(value) => Some(value),
                        Op::Delete => None,
                    });
                }
                let first = node.child_index(lo);
                let last = node.child_index(hi);
                for idx in first..=last {
                    self.collect_range(node.child_at(idx), Some(uid), lo, hi, acc)?;
                }
            }
            NodeVariant::Leaf(leaf) => {
                for (key, value) in leaf.range(lo, hi) {
                    acc.entry(*key).or_insert(Some(*value));
                }
            }
            NodeVariant::Index(_) => {
                return Err(Error::Internal("plain router in a b-epsilon tree"))
            }
        }
        Ok(())
    }
}
