//! Shared handles to cached nodes.
//!
//! The cache holds the only long-lived strong reference to each handle;
//! callers pin an entry for the duration of a traversal step by cloning the
//! `Arc`. The embedded lock hands out owned guards, so a traversal can keep
//! a stack of ancestor write locks alive without borrowing from itself.

use crate::{error::Result, node::NodeVariant, uid::FatUid};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RwLock};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub type NodeRef<K, V> = Arc<NodeHandle<K, V>>;
pub type NodeReadGuard<K, V> = ArcRwLockReadGuard<parking_lot::RawRwLock, NodeVariant<K, V>>;
pub type NodeWriteGuard<K, V> = ArcRwLockWriteGuard<parking_lot::RawRwLock, NodeVariant<K, V>>;

/// A cached node with its per-node lock, dirty flag and parent back-pointer.
pub struct NodeHandle<K, V> {
    node: Arc<RwLock<NodeVariant<K, V>>>,
    dirty: AtomicBool,
    poisoned: AtomicBool,
    parent: Mutex<Option<FatUid>>,
}

impl<K, V> NodeHandle<K, V> {
    pub(crate) fn new(node: NodeVariant<K, V>, parent: Option<FatUid>, dirty: bool) -> Self {
        NodeHandle {
            node: Arc::new(RwLock::new(node)),
            dirty: AtomicBool::new(dirty),
            poisoned: AtomicBool::new(false),
            parent: Mutex::new(parent),
        }
    }

    /// Shared access to the node contents.
    pub fn read(&self) -> Result<NodeReadGuard<K, V>> {
        self.ensure_usable()?;
        Ok(self.node.read_arc())
    }

    /// Exclusive access to the node contents. Marks the node dirty; every
    /// write-locked node is assumed modified.
    pub fn write(&self) -> Result<NodeWriteGuard<K, V>> {
        self.ensure_usable()?;
        self.dirty.store(true, Ordering::Release);
        Ok(self.node.write_arc())
    }

    /// Exclusive access without dirtying, for serialization paths.
    pub(crate) fn try_write_internal(&self) -> Option<NodeWriteGuard<K, V>> {
        self.node.try_write_arc()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "handle poisoned by an earlier storage failure",
            )
            .into());
        }
        Ok(())
    }

    /// Marks the handle unusable after a storage failure.
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    /// Whether an earlier storage failure marked this handle unusable. A
    /// failed write must not be retried; serialization paths check this
    /// before touching storage again.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn parent_uid(&self) -> Option<FatUid> {
        *self.parent.lock()
    }

    pub(crate) fn set_parent(&self, parent: Option<FatUid>) {
        *self.parent.lock() = parent;
    }

    /// Number of strong references to the inner lock; more than one means a
    /// guard is outstanding somewhere.
    pub(crate) fn guard_count(&self) -> usize {
        Arc::strong_count(&self.node)
    }
}
