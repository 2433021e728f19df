//! Tree node variants and their on-disk codec.

use crate::{
    error::{Error, Result},
    uid::FatUid,
};

mod epsilon;
mod index;
mod leaf;
pub(crate) mod marshal;

pub use epsilon::{EpsilonIndexNode, Op};
pub use index::IndexNode;
pub use leaf::LeafNode;

/// Minimum number of entries a non-root leaf must keep.
pub(crate) fn leaf_min(degree: usize) -> usize {
    (degree + 1) / 2
}

/// Minimum number of children a non-root router must keep.
///
/// One below the leaf bound, so that merging an under-flowing router with a
/// minimally filled sibling plus the separator pivot never exceeds `degree`.
pub(crate) fn router_min_children(degree: usize) -> usize {
    degree / 2 + 1
}

/// Sealed sum of the node kinds a cache entry can hold.
///
/// Each tree store instantiates with a fixed pair: the B+ store uses
/// `Leaf`/`Index`, the B-epsilon store uses `Leaf`/`Epsilon`.
pub enum NodeVariant<K, V> {
    Leaf(LeafNode<K, V>),
    Index(IndexNode<K>),
    Epsilon(EpsilonIndexNode<K, V>),
}

impl<K: crate::pod::KeyType, V: crate::pod::ValueType> NodeVariant<K, V> {
    /// Child uids if this node is a router.
    pub fn router_children(&self) -> Option<&[FatUid]> {
        match self {
            NodeVariant::Leaf(_) => None,
            NodeVariant::Index(node) => Some(node.children()),
            NodeVariant::Epsilon(node) => Some(node.children()),
        }
    }
}

impl<K, V> NodeVariant<K, V> {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeVariant::Leaf(_) => "leaf",
            NodeVariant::Index(_) => "index",
            NodeVariant::Epsilon(_) => "epsilon-index",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeVariant::Leaf(_))
    }

    pub fn as_leaf(&self) -> Result<&LeafNode<K, V>> {
        match self {
            NodeVariant::Leaf(node) => Ok(node),
            _ => Err(Error::Internal("expected a leaf node")),
        }
    }

    pub fn as_leaf_mut(&mut self) -> Result<&mut LeafNode<K, V>> {
        match self {
            NodeVariant::Leaf(node) => Ok(node),
            _ => Err(Error::Internal("expected a leaf node")),
        }
    }

    pub fn as_index(&self) -> Result<&IndexNode<K>> {
        match self {
            NodeVariant::Index(node) => Ok(node),
            _ => Err(Error::Internal("expected a router node")),
        }
    }

    pub fn as_index_mut(&mut self) -> Result<&mut IndexNode<K>> {
        match self {
            NodeVariant::Index(node) => Ok(node),
            _ => Err(Error::Internal("expected a router node")),
        }
    }

    pub fn as_epsilon(&self) -> Result<&EpsilonIndexNode<K, V>> {
        match self {
            NodeVariant::Epsilon(node) => Ok(node),
            _ => Err(Error::Internal("expected a buffered router node")),
        }
    }

    pub fn as_epsilon_mut(&mut self) -> Result<&mut EpsilonIndexNode<K, V>> {
        match self {
            NodeVariant::Epsilon(node) => Ok(node),
            _ => Err(Error::Internal("expected a buffered router node")),
        }
    }
}
