//! Fat node identifiers.
//!
//! A [`FatUid`] names a node either by an in-memory token (`Volatile`) or by
//! its location in the backing file (`File`). A node's uid is not stable
//! over its lifetime: persisting or rewriting a node moves it from
//! `Volatile` to `File`, or from one `File` region to another. The cache is
//! the only component allowed to perform that migration.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Write};

/// Tagged node address: a live in-memory token or a file region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FatUid {
    /// A cache-minted token for a node that has never been persisted.
    Volatile(u64),
    /// A region of the backing file.
    File {
        /// Byte offset of the record.
        offset: u32,
        /// Record length in bytes.
        len: u32,
    },
}

impl FatUid {
    /// Packed width: discriminator byte plus an 8-byte payload.
    pub const PACKED_LEN: usize = 1 + 8;

    const TAG_VOLATILE: u8 = 1;
    const TAG_FILE: u8 = 2;

    pub fn volatile(token: u64) -> Self {
        FatUid::Volatile(token)
    }

    pub fn file(offset: u32, len: u32) -> Self {
        FatUid::File { offset, len }
    }

    pub fn is_volatile(&self) -> bool {
        matches!(self, FatUid::Volatile(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FatUid::File { .. })
    }

    /// Writes the packed form. Only `File` uids may end up inside a
    /// persisted child list, but the codec is total so that debugging dumps
    /// can serialize anything.
    pub fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        match *self {
            FatUid::Volatile(token) => {
                w.write_u8(Self::TAG_VOLATILE)?;
                w.write_u64::<LittleEndian>(token)
            }
            FatUid::File { offset, len } => {
                w.write_u8(Self::TAG_FILE)?;
                w.write_u32::<LittleEndian>(offset)?;
                w.write_u32::<LittleEndian>(len)
            }
        }
    }

    pub fn unpack(data: &[u8]) -> io::Result<Self> {
        let mut data = data;
        match data.read_u8()? {
            Self::TAG_VOLATILE => Ok(FatUid::Volatile(data.read_u64::<LittleEndian>()?)),
            Self::TAG_FILE => Ok(FatUid::File {
                offset: data.read_u32::<LittleEndian>()?,
                len: data.read_u32::<LittleEndian>()?,
            }),
            tag => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown uid tag {tag}"),
            )),
        }
    }
}

impl std::fmt::Display for FatUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatUid::Volatile(token) => write!(f, "<V:{token}>"),
            FatUid::File { offset, len } => write!(f, "<F:{offset}+{len}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(uid: &FatUid) -> u64 {
        let mut h = DefaultHasher::new();
        uid.hash(&mut h);
        h.finish()
    }

    #[test]
    fn volatile_and_file_never_equal() {
        let v = FatUid::volatile(128);
        let f = FatUid::file(128, 0);
        assert_ne!(v, f);
        assert_ne!(hash_of(&v), hash_of(&f));
    }

    #[test]
    fn pack_roundtrip() {
        for uid in [FatUid::volatile(u64::MAX), FatUid::file(4096, 117)] {
            let mut buf = Vec::new();
            uid.pack(&mut buf).unwrap();
            assert_eq!(buf.len(), FatUid::PACKED_LEN);
            assert_eq!(FatUid::unpack(&buf).unwrap(), uid);
        }
    }
}
