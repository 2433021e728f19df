//! Tree stores on top of the node cache.

use crate::{
    cache::NodeCache,
    error::{Error, Result},
    node::{leaf_min, router_min_children, IndexNode, NodeVariant},
    pod::{KeyType, ValueType},
    storage::Storage,
    uid::FatUid,
};

mod bepsilon;
mod bplus;

pub use bepsilon::BEpsilonStore;
pub use bplus::BPlusStore;

fn ensure(cond: bool, msg: &'static str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::Internal(msg))
    }
}

/// Number of levels from the given node down to its leaves.
pub(crate) fn subtree_depth<K, V, S>(cache: &NodeCache<K, V, S>, uid: FatUid) -> Result<usize>
where
    K: KeyType,
    V: ValueType,
    S: Storage,
{
    let mut depth = 1;
    let mut guard = cache.get(uid)?.read()?;
    loop {
        let child = match &*guard {
            NodeVariant::Leaf(_) => return Ok(depth),
            NodeVariant::Index(router) => router.child_at(0),
            NodeVariant::Epsilon(node) => node.child_at(0),
        };
        guard = cache.get(child)?.read()?;
        depth += 1;
    }
}

/// Verifies the structural invariants of the subtree under `uid`: strict
/// key order, router shape, occupancy bounds, routing bounds and equal leaf
/// depth. Returns the subtree depth.
pub(crate) fn check_subtree<K, V, S>(
    cache: &NodeCache<K, V, S>,
    uid: FatUid,
    degree: usize,
    is_root: bool,
    lower: Option<K>,
    upper: Option<K>,
) -> Result<usize>
where
    K: KeyType,
    V: ValueType,
    S: Storage,
{
    let guard = cache.get(uid)?.read()?;
    match &*guard {
        NodeVariant::Leaf(leaf) => {
            let keys = leaf.keys();
            ensure(
                keys.windows(2).all(|w| w[0] < w[1]),
                "leaf keys not strictly increasing",
            )?;
            ensure(leaf.len() <= degree, "leaf holds more keys than the degree")?;
            if !is_root {
                ensure(leaf.len() >= leaf_min(degree), "leaf below minimum occupancy")?;
            }
            if let Some(lo) = lower {
                ensure(
                    keys.first().map_or(true, |k| *k >= lo),
                    "leaf key below its routing bound",
                )?;
            }
            if let Some(hi) = upper {
                ensure(
                    keys.last().map_or(true, |k| *k < hi),
                    "leaf key above its routing bound",
                )?;
            }
            Ok(1)
        }
        NodeVariant::Index(router) => {
            check_router(cache, router, degree, is_root, lower, upper)
        }
        NodeVariant::Epsilon(node) => {
            let buffer = node.buffer();
            ensure(
                buffer.windows(2).all(|w| w[0].0 < w[1].0),
                "buffer keys not sorted or not unique",
            )?;
            for (key, _) in buffer {
                if let Some(lo) = lower {
                    ensure(*key >= lo, "buffered key below its routing bound")?;
                }
                if let Some(hi) = upper {
                    ensure(*key < hi, "buffered key above its routing bound")?;
                }
            }
            check_router(cache, node.router(), degree, is_root, lower, upper)
        }
    }
}

fn check_router<K, V, S>(
    cache: &NodeCache<K, V, S>,
    router: &IndexNode<K>,
    degree: usize,
    is_root: bool,
    lower: Option<K>,
    upper: Option<K>,
) -> Result<usize>
where
    K: KeyType,
    V: ValueType,
    S: Storage,
{
    let pivots = router.pivots();
    ensure(
        router.children_count() == pivots.len() + 1,
        "router child count does not match pivots",
    )?;
    ensure(
        pivots.windows(2).all(|w| w[0] < w[1]),
        "router pivots not strictly increasing",
    )?;
    ensure(pivots.len() <= degree, "router holds more pivots than the degree")?;
    if is_root {
        ensure(!pivots.is_empty(), "root router with a single child")?;
    } else {
        ensure(
            router.children_count() >= router_min_children(degree),
            "router below minimum fanout",
        )?;
    }
    if let (Some(lo), Some(first)) = (lower, pivots.first()) {
        ensure(*first >= lo, "router pivot below its routing bound")?;
    }
    if let (Some(hi), Some(last)) = (upper, pivots.last()) {
        ensure(*last < hi, "router pivot above its routing bound")?;
    }

    let mut depth = None;
    for idx in 0..router.children_count() {
        let lo = if idx == 0 { lower } else { Some(pivots[idx - 1]) };
        let hi = if idx == pivots.len() { upper } else { Some(pivots[idx]) };
        let child_depth =
            check_subtree(cache, router.child_at(idx), degree, false, lo, hi)?;
        match depth {
            None => depth = Some(child_depth),
            Some(expected) => ensure(expected == child_depth, "leaves at unequal depth")?,
        }
    }
    Ok(depth.unwrap_or(0) + 1)
}
