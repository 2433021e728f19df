//! An embeddable, in-process ordered key-value index engine.
//!
//! Two tree variants share one node-cache substrate:
//!
//! - [`BPlusStore`]: all entries live in leaves, routers above them are
//!   pure. Tuned for point and range reads with lock-coupled concurrent
//!   mutation.
//! - [`BEpsilonStore`]: routers additionally carry a bounded buffer of
//!   deferred operations, amortising I/O against batch flushes. Tuned for
//!   write-heavy workloads.
//!
//! Both sit on a [`cache::NodeCache`] that owns node lifetimes, evicts cold
//! nodes to a backing [`storage::Storage`] and hands out reference-counted
//! handles. Nodes are addressed by a [`FatUid`] naming either a live
//! in-memory object or a file region; a node's uid may change when it is
//! persisted, and the cache keeps parent routers consistent across that.
//!
//! ```no_run
//! use betula::{BPlusStore, NoBacking, StoreConfig};
//!
//! let store: BPlusStore<u64, u64, NoBacking> =
//!     BPlusStore::new(StoreConfig::default(), NoBacking::new());
//! store.init()?;
//! store.insert(7, 70)?;
//! assert_eq!(store.search(&7)?, 70);
//! # Ok::<(), betula::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod node;
pub mod pod;
pub mod storage;
pub mod tree;
pub mod uid;

pub use crate::{
    cache::CacheStats,
    config::{BackingConfig, CacheConfig, StoreConfig},
    error::{Error, Result},
    node::Op,
    pod::{KeyType, PodType, ValueType},
    storage::{Backing, FileBacking, NoBacking, Storage},
    tree::{BEpsilonStore, BPlusStore},
    uid::FatUid,
};

#[cfg(feature = "init_env_logger")]
pub(crate) fn maybe_init_env_logger() {
    let _ = env_logger::try_init();
}

#[cfg(not(feature = "init_env_logger"))]
pub(crate) fn maybe_init_env_logger() {}
