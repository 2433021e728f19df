//! The node cache: uid to handle map, LRU discipline, eviction and
//! rehydration.
//!
//! The cache owns node lifetimes and mediates identity. A node lives here
//! as a volatile object until eviction hands it to the backing storage; a
//! cache miss on a file uid rehydrates it. When persisting changes a node's
//! uid, the cache rewrites the cached parent's child entry before the old
//! uid becomes unreachable, so routers never point at vanished identities.

use crate::{
    config::CacheConfig,
    error::{Error, Result},
    node::{marshal, NodeVariant},
    pod::{KeyType, ValueType},
    storage::Storage,
    uid::FatUid,
};
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

mod handle;
mod lru;
mod worker;

pub use handle::{NodeHandle, NodeReadGuard, NodeRef, NodeWriteGuard};

use lru::LruList;
use worker::Msg;

/// Counters over the cache lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    /// Lookups answered from the map.
    pub hits: u64,
    /// Lookups that had to rehydrate from storage.
    pub misses: u64,
    /// Entries dropped by the evictor.
    pub evictions: u64,
    /// Nodes serialized and written to storage.
    pub writebacks: u64,
}

pub(crate) struct Shared<K, V, S> {
    map: RwLock<FxHashMap<FatUid, NodeRef<K, V>>>,
    pub(crate) lru: Mutex<LruList>,
    storage: S,
    capacity: usize,
    next_token: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

/// Cache of tree nodes addressed by [`FatUid`].
pub struct NodeCache<K, V, S> {
    shared: Arc<Shared<K, V, S>>,
    promote_tx: Option<Sender<Msg>>,
    stop_tx: Option<Sender<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<K: KeyType, V: ValueType, S: Storage> NodeCache<K, V, S> {
    pub fn new(config: CacheConfig, storage: S) -> Self {
        let shared = Arc::new(Shared {
            map: RwLock::new(FxHashMap::default()),
            lru: Mutex::new(LruList::new()),
            storage,
            capacity: config.capacity.max(1),
            next_token: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        });

        let mut cache = NodeCache {
            shared,
            promote_tx: None,
            stop_tx: None,
            workers: Vec::new(),
        };
        if config.concurrent {
            let (promote_tx, promote_rx) = unbounded();
            let (stop_tx, stop_rx) = bounded(0);
            let lru_shared = cache.shared.clone();
            let lru_stop = stop_rx.clone();
            cache.workers.push(thread::spawn(move || {
                worker::lru_main(promote_rx, lru_stop, lru_shared)
            }));
            let evict_shared = cache.shared.clone();
            cache.workers.push(thread::spawn(move || {
                worker::evict_main(stop_rx, evict_shared)
            }));
            cache.promote_tx = Some(promote_tx);
            cache.stop_tx = Some(stop_tx);
        }
        cache
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.shared.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            writebacks: self.shared.writebacks.load(Ordering::Relaxed),
        }
    }

    /// Builds a fresh node, admits it at the MRU position and returns its
    /// initial volatile uid together with a pinned handle.
    pub(crate) fn insert_new(
        &self,
        node: NodeVariant<K, V>,
        parent: Option<FatUid>,
    ) -> (FatUid, NodeRef<K, V>) {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let uid = FatUid::volatile(token);
        let handle = Arc::new(NodeHandle::new(node, parent, true));
        self.shared.map.write().insert(uid, handle.clone());
        self.shared.lru.lock().push_front(uid);
        trace!("cache: created {} node {uid}", handle_kind(&handle));
        (uid, handle)
    }

    /// Fetches a handle, rehydrating from storage on a file-uid miss. A
    /// volatile uid that is not cached is a structural error.
    pub(crate) fn get(&self, uid: FatUid) -> Result<NodeRef<K, V>> {
        self.get_with_parent(uid, None)
    }

    /// As [`NodeCache::get`], additionally refreshing the entry's parent
    /// back-pointer. Traversals pass the uid of the router they descended
    /// from, which keeps the pointer usable for eviction-time rewrites.
    pub(crate) fn get_with_parent(
        &self,
        uid: FatUid,
        parent: Option<FatUid>,
    ) -> Result<NodeRef<K, V>> {
        if let Some(handle) = self.shared.map.read().get(&uid).cloned() {
            if parent.is_some() {
                handle.set_parent(parent);
            }
            self.shared.hits.fetch_add(1, Ordering::Relaxed);
            self.promote(uid);
            return Ok(handle);
        }

        if uid.is_volatile() {
            return Err(Error::Internal("volatile uid missing from cache"));
        }

        let bytes = self.shared.storage.read(uid)?;
        let node = marshal::deserialize::<K, V>(&bytes)?;
        let handle = Arc::new(NodeHandle::new(node, parent, false));
        let entry = self
            .shared
            .map
            .write()
            .entry(uid)
            .or_insert_with(|| handle.clone())
            .clone();
        if Arc::ptr_eq(&entry, &handle) {
            self.shared.lru.lock().push_front(uid);
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            debug!("cache: rehydrated node {uid}");
        } else {
            // Lost the rehydration race; the winner's entry is current.
            if parent.is_some() {
                entry.set_parent(parent);
            }
            self.shared.hits.fetch_add(1, Ordering::Relaxed);
            self.promote(uid);
        }
        Ok(entry)
    }

    /// Drops an entry, freeing its storage region if it was persisted. Used
    /// when a node is merged away.
    pub(crate) fn remove(&self, uid: FatUid) -> Result<()> {
        let handle = self.shared.map.write().remove(&uid);
        self.shared.lru.lock().remove(&uid);
        if handle.is_some() {
            trace!("cache: removed node {uid}");
        }
        if uid.is_file() {
            self.shared.storage.remove(uid)?;
        }
        Ok(())
    }

    /// Migrates the parent back-pointer of a cached child. A child that is
    /// not cached needs no migration; its parent will be re-fetched with a
    /// current child list.
    pub(crate) fn try_update_parent_uid(&self, child: FatUid, new_parent: FatUid) {
        if let Some(handle) = self.shared.map.read().get(&child) {
            handle.set_parent(Some(new_parent));
        }
    }

    /// Detaches a cached node from its parent back-pointer, e.g. when it
    /// becomes the root.
    pub(crate) fn clear_parent(&self, uid: FatUid) {
        if let Some(handle) = self.shared.map.read().get(&uid) {
            handle.set_parent(None);
        }
    }

    /// Evicts cold entries until the capacity bound holds. Pinned, locked
    /// or not-yet-evictable entries are skipped and retried later.
    pub(crate) fn evict_excess(&self) -> Result<()> {
        self.shared.evict_excess()
    }

    /// Persists every dirty node reachable from `root`, bottom-up, resolving
    /// all volatile uids to file uids. Returns the root's final uid.
    pub(crate) fn flush_all(&self, root: FatUid) -> Result<FatUid> {
        if !self.shared.storage.supports_eviction() {
            return Ok(root);
        }
        let new_root = self.shared.persist_subtree(root)?;
        self.shared.storage.flush()?;
        Ok(new_root)
    }

    fn promote(&self, uid: FatUid) {
        match &self.promote_tx {
            Some(tx) => {
                let _ = tx.send(Msg::Touch(uid));
            }
            None => self.shared.lru.lock().touch(&uid),
        }
    }
}

impl<K, V, S> Drop for NodeCache<K, V, S> {
    fn drop(&mut self) {
        self.promote_tx.take();
        self.stop_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl<K: KeyType, V: ValueType, S: Storage> Shared<K, V, S> {
    pub(crate) fn evict_excess(&self) -> Result<()> {
        if !self.storage.supports_eviction() {
            return Ok(());
        }
        while self.map.read().len() > self.capacity {
            if !self.evict_one()? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Evicts the coldest evictable entry. Returns false if nothing could
    /// be evicted this round.
    fn evict_one(&self) -> Result<bool> {
        let mut map = self.map.write();
        let mut lru = self.lru.lock();
        #[cfg(feature = "cache-paranoia")]
        assert_eq!(lru.len(), map.len(), "lru list out of sync with the map");
        let candidates = lru.tail_to_head();

        for uid in candidates {
            let handle = match map.get(&uid) {
                Some(handle) if Arc::strong_count(handle) == 1 && handle.guard_count() == 1 => {
                    handle.clone()
                }
                _ => continue,
            };
            // A poisoned handle already failed a write; it is never retried
            // here, the error resurfaces on the next caller access.
            if handle.is_poisoned() {
                continue;
            }
            let guard = match handle.try_write_internal() {
                Some(guard) => guard,
                None => continue,
            };
            // A persisted router may only reference file uids, and a dirty
            // child still needs this node for its uid rewrite, so routers
            // drain strictly after their children.
            if let Some(children) = guard.router_children() {
                let blocked = children.iter().any(|child| {
                    child.is_volatile()
                        || map.get(child).map_or(false, |child_handle| {
                            child_handle.is_dirty()
                        })
                });
                if blocked {
                    continue;
                }
            }

            if !handle.is_dirty() && uid.is_file() {
                drop(guard);
                map.remove(&uid);
                lru.remove(&uid);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("cache: evicted clean node {uid}");
                return Ok(true);
            }

            // A dirty node acquires a new identity on write-back, which the
            // parent must learn about first. Without a cached parent the
            // rewrite cannot happen, so the entry stays for now; the root is
            // persisted through flush only.
            let parent_handle = match handle.parent_uid().and_then(|p| map.get(&p).cloned()) {
                Some(parent) => parent,
                None => continue,
            };
            let mut parent_guard = match parent_handle.try_write_internal() {
                Some(guard) => guard,
                None => continue,
            };

            let (_tag, bytes) = marshal::serialize(&*guard)?;
            let new_uid = match self.storage.write(&bytes) {
                Ok(new_uid) => new_uid,
                Err(err) => {
                    handle.poison();
                    return Err(err);
                }
            };
            let rewrite = match &mut *parent_guard {
                NodeVariant::Index(router) => router.update_child_uid(uid, new_uid),
                NodeVariant::Epsilon(node) => node.router_mut().update_child_uid(uid, new_uid),
                NodeVariant::Leaf(_) => Err(Error::Internal("leaf recorded as a parent")),
            };
            if let Err(err) = rewrite {
                let _ = self.storage.remove(new_uid);
                return Err(err);
            }
            parent_handle.mark_dirty();
            if uid.is_file() {
                self.storage.remove(uid)?;
            }
            // Cached children follow their parent's new identity.
            if let Some(children) = guard.router_children() {
                for child in children {
                    if let Some(child_handle) = map.get(child) {
                        child_handle.set_parent(Some(new_uid));
                    }
                }
            }
            #[cfg(feature = "cache-paranoia")]
            {
                assert!(new_uid.is_file());
                assert!(!map.contains_key(&new_uid));
            }
            drop(guard);
            map.remove(&uid);
            lru.remove(&uid);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.writebacks.fetch_add(1, Ordering::Relaxed);
            debug!("cache: evicted dirty node {uid} to {new_uid}");
            return Ok(true);
        }
        Ok(false)
    }

    /// Post-order write-back: children first, so every router is persisted
    /// with file uids only. Entries stay cached under their new uid.
    fn persist_subtree(&self, uid: FatUid) -> Result<FatUid> {
        let handle = match self.map.read().get(&uid).cloned() {
            Some(handle) => handle,
            None if uid.is_file() => return Ok(uid),
            None => return Err(Error::Internal("dangling volatile uid during flush")),
        };
        if handle.is_poisoned() {
            // The earlier write failure is final; flushing must not retry it.
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "handle poisoned by an earlier storage failure",
            )
            .into());
        }
        let mut guard = handle
            .try_write_internal()
            .ok_or(Error::Internal("node still locked during flush"))?;

        let mut children_changed = false;
        let child_uids: Vec<FatUid> = match guard.router_children() {
            Some(children) => children.to_vec(),
            None => Vec::new(),
        };
        for (idx, child) in child_uids.iter().enumerate() {
            let new_child = self.persist_subtree(*child)?;
            if new_child != *child {
                match &mut *guard {
                    NodeVariant::Index(router) => router.set_child_at(idx, new_child),
                    NodeVariant::Epsilon(node) => node.router_mut().set_child_at(idx, new_child),
                    NodeVariant::Leaf(_) => unreachable!(),
                }
                children_changed = true;
            }
        }

        if !handle.is_dirty() && !children_changed && uid.is_file() {
            return Ok(uid);
        }

        let (_tag, bytes) = marshal::serialize(&*guard)?;
        let new_uid = match self.storage.write(&bytes) {
            Ok(new_uid) => new_uid,
            Err(err) => {
                handle.poison();
                return Err(err);
            }
        };
        if uid.is_file() {
            self.storage.remove(uid)?;
        }
        self.writebacks.fetch_add(1, Ordering::Relaxed);

        let mut map = self.map.write();
        map.remove(&uid);
        map.insert(new_uid, handle.clone());
        for child in guard.router_children().unwrap_or(&[]) {
            if let Some(child_handle) = map.get(child) {
                child_handle.set_parent(Some(new_uid));
            }
        }
        drop(map);
        self.lru.lock().rename(&uid, new_uid);
        handle.clear_dirty();
        trace!("cache: flushed node {uid} to {new_uid}");
        Ok(new_uid)
    }
}

fn handle_kind<K, V>(handle: &NodeRef<K, V>) -> &'static str {
    handle
        .try_write_internal()
        .map(|guard| guard.kind())
        .unwrap_or("locked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LeafNode;
    use crate::storage::{FileBacking, NoBacking};

    fn leaf_node(entries: &[(u64, u64)]) -> NodeVariant<u64, u64> {
        let mut leaf = LeafNode::new();
        for &(k, v) in entries {
            leaf.insert(k, v);
        }
        NodeVariant::Leaf(leaf)
    }

    #[test]
    fn volatile_miss_is_fatal() {
        let cache: NodeCache<u64, u64, NoBacking> =
            NodeCache::new(CacheConfig::default(), NoBacking::new());
        assert!(matches!(
            cache.get(FatUid::volatile(42)),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn null_backing_never_evicts() {
        let cache: NodeCache<u64, u64, NoBacking> = NodeCache::new(
            CacheConfig {
                capacity: 1,
                concurrent: false,
            },
            NoBacking::new(),
        );
        for n in 0..10 {
            cache.insert_new(leaf_node(&[(n, n)]), None);
        }
        cache.evict_excess().unwrap();
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn eviction_rewrites_parent_child_uid() {
        use crate::node::IndexNode;

        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path().join("nodes.bin"), 64, 1 << 20).unwrap();
        let cache: NodeCache<u64, u64, FileBacking> = NodeCache::new(
            CacheConfig {
                capacity: 1,
                concurrent: false,
            },
            backing,
        );

        let (left_uid, _) = cache.insert_new(leaf_node(&[(1, 10), (2, 20)]), None);
        let (right_uid, _) = cache.insert_new(leaf_node(&[(5, 50), (6, 60)]), None);
        let (parent_uid, parent) =
            cache.insert_new(NodeVariant::Index(IndexNode::new(5, left_uid, right_uid)), None);
        cache.try_update_parent_uid(left_uid, parent_uid);
        cache.try_update_parent_uid(right_uid, parent_uid);

        cache.evict_excess().unwrap();
        assert!(cache.len() <= 1 + 1); // parent is unevictable, leaves drain

        let children: Vec<FatUid> = parent
            .read()
            .unwrap()
            .as_index()
            .unwrap()
            .children()
            .to_vec();
        // At least one leaf was written back and renamed in the parent.
        assert!(children.iter().any(FatUid::is_file));
        let stats = cache.stats();
        assert!(stats.writebacks > 0);

        // Rehydration returns the persisted contents.
        let file_child = *children.iter().find(|c| c.is_file()).unwrap();
        let handle = cache.get(file_child).unwrap();
        let guard = handle.read().unwrap();
        assert!(!guard.as_leaf().unwrap().is_empty());
    }
}
