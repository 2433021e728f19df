//! Type-tag dispatch and the on-disk node codec.
//!
//! Records are little-endian and packed, with a leading type tag:
//!
//! ```text
//! leaf:    [u8 tag] [u16 n] [n x K] [n x V]
//! router:  [u8 tag] [u64 n_keys] [u64 n_children]
//!          [n_keys x K] [n_children x (u32 offset, u32 len)]
//! buffered router: ...router... [u32 n_buf]
//!          n_buf x { K, u8 op, V if op is insert/update }
//! ```
//!
//! Child uids are persisted as file regions only; serializing a router that
//! still references a volatile child is a structural error.

use super::{EpsilonIndexNode, IndexNode, LeafNode, NodeVariant, Op};
use crate::{
    error::{Error, Result},
    pod::{KeyType, PodType, ValueType},
    uid::FatUid,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

pub(crate) const TAG_LEAF: u8 = 1;
pub(crate) const TAG_INDEX: u8 = 2;
pub(crate) const TAG_EPSILON: u8 = 3;

const OP_INSERT: u8 = 1;
const OP_UPDATE: u8 = 2;
const OP_DELETE: u8 = 3;

pub(crate) fn serialize<K: KeyType, V: ValueType>(
    node: &NodeVariant<K, V>,
) -> Result<(u8, Vec<u8>)> {
    match node {
        NodeVariant::Leaf(leaf) => {
            let mut buf =
                Vec::with_capacity(3 + leaf.len() * (K::PACKED_LEN + V::PACKED_LEN));
            buf.write_u8(TAG_LEAF)?;
            buf.write_u16::<LittleEndian>(leaf.len() as u16)?;
            for key in leaf.keys() {
                key.pack(&mut buf)?;
            }
            for value in leaf.values() {
                value.pack(&mut buf)?;
            }
            Ok((TAG_LEAF, buf))
        }
        NodeVariant::Index(router) => {
            let mut buf = Vec::new();
            buf.write_u8(TAG_INDEX)?;
            write_router(&mut buf, router)?;
            Ok((TAG_INDEX, buf))
        }
        NodeVariant::Epsilon(node) => {
            let mut buf = Vec::new();
            buf.write_u8(TAG_EPSILON)?;
            write_router(&mut buf, node.router())?;
            buf.write_u32::<LittleEndian>(node.buffer_len() as u32)?;
            for (key, op) in node.buffer() {
                key.pack(&mut buf)?;
                match op {
                    Op::Insert(value) => {
                        buf.write_u8(OP_INSERT)?;
                        value.pack(&mut buf)?;
                    }
                    Op::Update(value) => {
                        buf.write_u8(OP_UPDATE)?;
                        value.pack(&mut buf)?;
                    }
                    Op::Delete => buf.write_u8(OP_DELETE)?,
                }
            }
            Ok((TAG_EPSILON, buf))
        }
    }
}

pub(crate) fn deserialize<K: KeyType, V: ValueType>(bytes: &[u8]) -> Result<NodeVariant<K, V>> {
    let mut rdr = bytes;
    match rdr.read_u8()? {
        TAG_LEAF => {
            let n = rdr.read_u16::<LittleEndian>()? as usize;
            let keys = read_pods::<K>(&mut rdr, n)?;
            let values = read_pods::<V>(&mut rdr, n)?;
            Ok(NodeVariant::Leaf(LeafNode::from_parts(keys, values)))
        }
        TAG_INDEX => Ok(NodeVariant::Index(read_router(&mut rdr)?)),
        TAG_EPSILON => {
            let router = read_router(&mut rdr)?;
            let n_buf = rdr.read_u32::<LittleEndian>()? as usize;
            let mut buffer = Vec::with_capacity(n_buf);
            for _ in 0..n_buf {
                let key = read_pod::<K>(&mut rdr)?;
                let op = match rdr.read_u8()? {
                    OP_INSERT => Op::Insert(read_pod::<V>(&mut rdr)?),
                    OP_UPDATE => Op::Update(read_pod::<V>(&mut rdr)?),
                    OP_DELETE => Op::Delete,
                    _ => return Err(Error::Internal("unknown buffered op tag")),
                };
                buffer.push((key, op));
            }
            Ok(NodeVariant::Epsilon(EpsilonIndexNode::from_parts(
                router, buffer,
            )))
        }
        _ => Err(Error::Internal("unknown node type tag")),
    }
}

fn write_router<K: KeyType, W: std::io::Write>(mut w: W, router: &IndexNode<K>) -> Result<()> {
    w.write_u64::<LittleEndian>(router.pivot_count() as u64)?;
    w.write_u64::<LittleEndian>(router.children_count() as u64)?;
    for pivot in router.pivots() {
        pivot.pack(&mut w)?;
    }
    for child in router.children() {
        match *child {
            FatUid::File { offset, len } => {
                w.write_u32::<LittleEndian>(offset)?;
                w.write_u32::<LittleEndian>(len)?;
            }
            FatUid::Volatile(_) => {
                return Err(Error::Internal("volatile child uid in serialized router"))
            }
        }
    }
    Ok(())
}

fn read_router<K: KeyType>(rdr: &mut &[u8]) -> Result<IndexNode<K>> {
    let n_keys = rdr.read_u64::<LittleEndian>()? as usize;
    let n_children = rdr.read_u64::<LittleEndian>()? as usize;
    if n_children != n_keys + 1 {
        return Err(Error::Internal("router child count does not match pivots"));
    }
    let pivots = read_pods::<K>(rdr, n_keys)?;
    let mut children = Vec::with_capacity(n_children);
    for _ in 0..n_children {
        let offset = rdr.read_u32::<LittleEndian>()?;
        let len = rdr.read_u32::<LittleEndian>()?;
        children.push(FatUid::file(offset, len));
    }
    Ok(IndexNode::from_parts(pivots, children))
}

fn read_pod<T: PodType>(rdr: &mut &[u8]) -> Result<T> {
    let mut tmp = vec![0u8; T::PACKED_LEN];
    rdr.read_exact(&mut tmp)?;
    Ok(T::unpack(&tmp))
}

fn read_pods<T: PodType>(rdr: &mut &[u8], n: usize) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_pod::<T>(rdr)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Node = NodeVariant<u64, u64>;

    fn reserialize(node: &Node) -> (Vec<u8>, Node) {
        let (_, bytes) = serialize(node).unwrap();
        let decoded = deserialize::<u64, u64>(&bytes).unwrap();
        (bytes, decoded)
    }

    #[test]
    fn leaf_roundtrip_is_byte_identical() {
        let mut leaf = LeafNode::new();
        for k in [3_u64, 1, 4, 1, 5] {
            leaf.insert(k, k * 10);
        }
        let node = Node::Leaf(leaf);
        let (bytes, decoded) = reserialize(&node);
        let (_, again) = serialize(&decoded).unwrap();
        assert_eq!(bytes, again);
        assert_eq!(decoded.as_leaf().unwrap().keys(), node.as_leaf().unwrap().keys());
    }

    #[test]
    fn router_roundtrip_is_byte_identical() {
        let node = Node::Index(IndexNode::from_parts(
            vec![10, 20],
            vec![FatUid::file(0, 64), FatUid::file(64, 64), FatUid::file(128, 32)],
        ));
        let (bytes, decoded) = reserialize(&node);
        let (_, again) = serialize(&decoded).unwrap();
        assert_eq!(bytes, again);
        assert_eq!(bytes[0], TAG_INDEX);
    }

    #[test]
    fn buffered_router_roundtrip() {
        let router = IndexNode::from_parts(
            vec![10],
            vec![FatUid::file(0, 64), FatUid::file(64, 64)],
        );
        let node = Node::Epsilon(EpsilonIndexNode::from_parts(
            router,
            vec![(2, Op::Insert(20)), (7, Op::Delete), (12, Op::Update(120))],
        ));
        let (bytes, decoded) = reserialize(&node);
        let (_, again) = serialize(&decoded).unwrap();
        assert_eq!(bytes, again);
        assert_eq!(decoded.as_epsilon().unwrap().buffer(), node.as_epsilon().unwrap().buffer());
    }

    #[test]
    fn volatile_child_is_rejected() {
        let node = Node::Index(IndexNode::from_parts(
            vec![10],
            vec![FatUid::file(0, 64), FatUid::volatile(7)],
        ));
        assert!(matches!(serialize(&node), Err(Error::Internal(_))));
    }
}
