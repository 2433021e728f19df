//! Fixed-width plain-old-data contract for keys and values.
//!
//! Every key and value that passes through the marshaller must have a
//! constant packed width so that node records can be decoded without a
//! per-entry length prefix. Types without a `PodType` impl are rejected at
//! compile time; callers with richer types supply their own impl.

use std::{
    fmt::Debug,
    io::{self, Write},
};

/// Marker plus codec for fixed-width plain old data.
///
/// The packed form is little-endian and exactly [`PodType::PACKED_LEN`]
/// bytes long.
pub trait PodType: Copy + Eq + Debug + Send + Sync + 'static {
    /// Packed width in bytes.
    const PACKED_LEN: usize;

    /// Writes the packed little-endian form.
    fn pack<W: Write>(&self, w: W) -> io::Result<()>;

    /// Reads back a value from exactly [`PodType::PACKED_LEN`] bytes.
    fn unpack(data: &[u8]) -> Self;
}

/// Key contract for the tree stores.
pub trait KeyType: PodType + Ord + std::hash::Hash {}
impl<T: PodType + Ord + std::hash::Hash> KeyType for T {}

/// Value contract for the tree stores.
pub trait ValueType: PodType {}
impl<T: PodType> ValueType for T {}

macro_rules! impl_pod_for_int {
    ($($t:ty),*) => {
        $(
            impl PodType for $t {
                const PACKED_LEN: usize = std::mem::size_of::<$t>();

                fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
                    w.write_all(&self.to_le_bytes())
                }

                fn unpack(data: &[u8]) -> Self {
                    <$t>::from_le_bytes(data[..Self::PACKED_LEN].try_into().unwrap())
                }
            }
        )*
    };
}

impl_pod_for_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl<const N: usize> PodType for [u8; N] {
    const PACKED_LEN: usize = N;

    fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(self)
    }

    fn unpack(data: &[u8]) -> Self {
        data[..N].try_into().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: PodType>(val: T) {
        let mut buf = Vec::new();
        val.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), T::PACKED_LEN);
        assert_eq!(T::unpack(&buf), val);
    }

    #[test]
    fn integers() {
        roundtrip(0xAB_u8);
        roundtrip(0xBEEF_u16);
        roundtrip(0xDEAD_BEEF_u32);
        roundtrip(u64::MAX - 7);
        roundtrip(-42_i64);
    }

    #[test]
    fn byte_arrays() {
        roundtrip([1_u8, 2, 3, 4, 5, 6, 7, 8]);
    }
}
