//! The B+ tree driver: lock-coupled traversal with pessimistic split and
//! merge prediction.

use super::{check_subtree, subtree_depth};
use crate::{
    cache::{NodeCache, NodeRef, NodeWriteGuard},
    config::StoreConfig,
    error::{Error, Result},
    node::{IndexNode, LeafNode, NodeVariant},
    pod::{KeyType, ValueType},
    storage::Storage,
    uid::FatUid,
};
use log::trace;
use parking_lot::RwLock;

/// Ordered key-value store with all entries in the leaves and pure routers
/// above them. Point and range reads descend with shared locks; mutations
/// descend with exclusive locks, holding only the ancestors a split or
/// merge could still reach.
pub struct BPlusStore<K, V, S> {
    degree: usize,
    cache: NodeCache<K, V, S>,
    root: RwLock<Option<FatUid>>,
}

type Locked<K, V> = (FatUid, NodeRef<K, V>, NodeWriteGuard<K, V>);

impl<K: KeyType, V: ValueType, S: Storage> BPlusStore<K, V, S> {
    pub fn new(config: StoreConfig, storage: S) -> Self {
        crate::maybe_init_env_logger();
        BPlusStore {
            degree: config.degree.max(2),
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
        let result = self.insert_inner(key, value);
        let evict = self.cache.evict_excess();
        result.and(evict)
    }

    pub fn search(&self, key: &K) -> Result<V> {
        let result = self.search_inner(key);
        let evict = self.cache.evict_excess();
        result.and_then(|value| evict.map(|_| value))
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        let result = self.remove_inner(key);
        let evict = self.cache.evict_excess();
        result.and(evict)
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

    /// Walks the whole tree and verifies the structural invariants.
    pub fn check_invariants(&self) -> Result<()> {
        let root_lock = self.root.read();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        check_subtree(&self.cache, root_uid, self.degree, true, None, None)?;
        Ok(())
    }

    fn insert_inner(&self, key: K, value: V) -> Result<()> {
        let root_lock = self.root.write();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        let mut root_guard = Some(root_lock);

        let mut stack: Vec<Locked<K, V>> = Vec::new();
        let mut current_uid = root_uid;
        let mut parent_uid = None;

        // Descend, holding ancestors only while a split could still
        // propagate into them.
        let (leaf_uid, leaf_handle, mut leaf_guard) = loop {
            let handle = self.cache.get_with_parent(current_uid, parent_uid)?;
            let guard = handle.write()?;
            let next = match &*guard {
                NodeVariant::Index(router) => {
                    if !router.can_trigger_split(self.degree) {
                        stack.clear();
                        root_guard = None;
                    }
                    Some(router.child_for(&key))
                }
                NodeVariant::Leaf(_) => None,
                NodeVariant::Epsilon(_) => {
                    return Err(Error::Internal("buffered router in a b+ tree"))
                }
            };
            match next {
                Some(child) => {
                    parent_uid = Some(current_uid);
                    stack.push((current_uid, handle, guard));
                    current_uid = child;
                }
                None => break (current_uid, handle, guard),
            }
        };

        leaf_guard.as_leaf_mut()?.insert(key, value);
        if !leaf_guard.as_leaf()?.require_split(self.degree) {
            return Ok(());
        }

        // Unwind: split bottom-up, promoting pivots into the held ancestors.
        let mut split_uid = leaf_uid;
        let mut split_handle = leaf_handle;
        let mut split_guard = leaf_guard;
        loop {
            let (pivot, right_uid) = match &mut *split_guard {
                NodeVariant::Leaf(leaf) => {
                    let (pivot, sibling) = leaf.split();
                    let (uid, _) = self
                        .cache
                        .insert_new(NodeVariant::Leaf(sibling), split_handle.parent_uid());
                    (pivot, uid)
                }
                NodeVariant::Index(router) => {
                    let (pivot, sibling) = router.split();
                    let adopted = sibling.children().to_vec();
                    let (uid, _) = self
                        .cache
                        .insert_new(NodeVariant::Index(sibling), split_handle.parent_uid());
                    for child in adopted {
                        self.cache.try_update_parent_uid(child, uid);
                    }
                    (pivot, uid)
                }
                NodeVariant::Epsilon(_) => {
                    return Err(Error::Internal("buffered router in a b+ tree"))
                }
            };
            trace!("bplus: split {split_uid}, new right sibling {right_uid}");

            match stack.pop() {
                Some((parent_uid, parent_handle, mut parent_guard)) => {
                    let parent = parent_guard.as_index_mut()?;
                    parent.insert_pivot(pivot, right_uid);
                    self.cache.try_update_parent_uid(right_uid, parent_uid);
                    if !parent.require_split(self.degree) {
                        break;
                    }
                    split_uid = parent_uid;
                    split_handle = parent_handle;
                    split_guard = parent_guard;
                }
                None => {
                    // The split reached the top; grow the tree by one level.
                    let mut root_lock = root_guard
                        .take()
                        .ok_or(Error::Internal("root lock released before a root split"))?;
                    let (new_root, _) = self.cache.insert_new(
                        NodeVariant::Index(IndexNode::new(pivot, split_uid, right_uid)),
                        None,
                    );
                    self.cache.try_update_parent_uid(split_uid, new_root);
                    self.cache.try_update_parent_uid(right_uid, new_root);
                    *root_lock = Some(new_root);
                    trace!("bplus: root split, new root {new_root}");
                    break;
                }
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

        loop {
            let child = match &*guard {
                NodeVariant::Index(router) => router.child_for(key),
                NodeVariant::Leaf(leaf) => {
                    return leaf.get(key).copied().ok_or(Error::KeyNotFound)
                }
                NodeVariant::Epsilon(_) => {
                    return Err(Error::Internal("buffered router in a b+ tree"))
                }
            };
            // Hand over hand: the child lock is taken before the parent
            // guard is released.
            let child_guard = self.cache.get_with_parent(child, Some(current_uid))?.read()?;
            guard = child_guard;
            current_uid = child;
        }
    }

    fn remove_inner(&self, key: &K) -> Result<()> {
        let root_lock = self.root.write();
        let root_uid = (*root_lock).ok_or(Error::TreeEmpty)?;
        let mut root_guard = Some(root_lock);

        let mut stack: Vec<Locked<K, V>> = Vec::new();
        let mut current_uid = root_uid;
        let mut parent_uid = None;

        let (leaf_uid, leaf_handle, mut leaf_guard) = loop {
            let handle = self.cache.get_with_parent(current_uid, parent_uid)?;
            let guard = handle.write()?;
            let next = match &*guard {
                NodeVariant::Index(router) => {
                    if !router.can_trigger_merge(self.degree) {
                        stack.clear();
                        root_guard = None;
                    }
                    Some(router.child_for(key))
                }
                NodeVariant::Leaf(_) => None,
                NodeVariant::Epsilon(_) => {
                    return Err(Error::Internal("buffered router in a b+ tree"))
                }
            };
            match next {
                Some(child) => {
                    parent_uid = Some(current_uid);
                    stack.push((current_uid, handle, guard));
                    current_uid = child;
                }
                None => break (current_uid, handle, guard),
            }
        };

        // Leaf-level absence surfaces immediately; held locks unwind on
        // the error path.
        leaf_guard.as_leaf_mut()?.remove(key)?;
        if !leaf_guard.as_leaf()?.require_merge(self.degree) || stack.is_empty() {
            return Ok(());
        }

        let mut child_uid = leaf_uid;
        let mut child_handle = leaf_handle;
        let mut child_guard = leaf_guard;
        let mut needs_rebalance = true;
        while needs_rebalance {
            match stack.pop() {
                Some((puid, parent_handle, mut parent_guard)) => {
                    let parent = parent_guard.as_index_mut()?;
                    let dropped = match &mut *child_guard {
                        NodeVariant::Leaf(leaf) => parent.rebalance_leaf_child(
                            &self.cache,
                            puid,
                            child_uid,
                            leaf,
                            key,
                            self.degree,
                        )?,
                        NodeVariant::Index(router) => parent.rebalance_index_child(
                            &self.cache,
                            puid,
                            child_uid,
                            router,
                            key,
                            self.degree,
                        )?,
                        NodeVariant::Epsilon(_) => {
                            return Err(Error::Internal("buffered router in a b+ tree"))
                        }
                    };
                    needs_rebalance = parent.require_merge(self.degree);
                    drop(child_guard);
                    drop(child_handle);
                    if let Some(gone) = dropped {
                        trace!("bplus: merged away {gone}");
                        self.cache.remove(gone)?;
                    }
                    child_uid = puid;
                    child_handle = parent_handle;
                    child_guard = parent_guard;
                }
                None => {
                    // The chain reached the root. A router root left with a
                    // single child shrinks the tree by one level.
                    let mut root_lock = root_guard
                        .take()
                        .ok_or(Error::Internal("root lock released before a root collapse"))?;
                    let sole_child = match &*child_guard {
                        NodeVariant::Index(router) if router.pivot_count() == 0 => {
                            Some(router.child_at(0))
                        }
                        _ => None,
                    };
                    if let Some(new_root) = sole_child {
                        *root_lock = Some(new_root);
                        self.cache.clear_parent(new_root);
                        drop(child_guard);
                        drop(child_handle);
                        self.cache.remove(child_uid)?;
                        trace!("bplus: root collapsed into {new_root}");
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}
