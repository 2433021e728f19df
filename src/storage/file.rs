//! File-backed node storage: append with free-slot reuse.

use crate::{
    error::{Error, Result},
    uid::FatUid,
};
use log::trace;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

/// A raw file of sequential node records.
///
/// There is no header or catalogue; the root uid is process state held by
/// the store instance. Freed regions are remembered in an in-memory free
/// list keyed by their rounded slot size and reused for writes of the same
/// slot size.
pub struct FileBacking {
    inner: Mutex<Inner>,
    block_size: u32,
    file_size: u32,
}

struct Inner {
    file: File,
    /// Offset of the first never-written byte.
    end: u32,
    /// slot size -> offsets of free slots of that size.
    free: BTreeMap<u32, Vec<u32>>,
}

impl FileBacking {
    /// Opens (truncating) the backing file.
    pub fn new<P: AsRef<Path>>(path: P, block_size: u32, file_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(FileBacking {
            inner: Mutex::new(Inner {
                file,
                end: 0,
                free: BTreeMap::new(),
            }),
            block_size: block_size.max(1),
            file_size,
        })
    }

    fn slot_len(&self, data_len: u32) -> u32 {
        let bs = self.block_size;
        data_len.div_euclid(bs) * bs + if data_len % bs == 0 { 0 } else { bs }
    }
}

impl super::Storage for FileBacking {
    fn write(&self, bytes: &[u8]) -> Result<FatUid> {
        let data_len = bytes.len() as u32;
        let slot = self.slot_len(data_len);
        let mut inner = self.inner.lock();

        let offset = match inner.free.get_mut(&slot).and_then(Vec::pop) {
            Some(offset) => {
                if inner.free.get(&slot).map_or(false, Vec::is_empty) {
                    inner.free.remove(&slot);
                }
                offset
            }
            None => {
                let offset = inner.end;
                if offset.checked_add(slot).map_or(true, |new_end| new_end > self.file_size) {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::OutOfMemory,
                        "backing file is full",
                    )));
                }
                inner.end = offset + slot;
                offset
            }
        };

        inner.file.seek(SeekFrom::Start(offset as u64))?;
        inner.file.write_all(bytes)?;
        trace!("storage: wrote {data_len} bytes at {offset}");
        Ok(FatUid::file(offset, data_len))
    }

    fn read(&self, uid: FatUid) -> Result<Vec<u8>> {
        let (offset, len) = match uid {
            FatUid::File { offset, len } => (offset, len),
            FatUid::Volatile(_) => return Err(Error::Internal("file read with volatile uid")),
        };
        let mut inner = self.inner.lock();
        let mut buf = vec![0; len as usize];
        inner.file.seek(SeekFrom::Start(offset as u64))?;
        inner.file.read_exact(&mut buf)?;
        trace!("storage: read {len} bytes at {offset}");
        Ok(buf)
    }

    fn remove(&self, uid: FatUid) -> Result<()> {
        let (offset, len) = match uid {
            FatUid::File { offset, len } => (offset, len),
            FatUid::Volatile(_) => return Err(Error::Internal("file remove with volatile uid")),
        };
        let slot = self.slot_len(len);
        self.inner.lock().free.entry(slot).or_default().push(offset);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn backing() -> (tempfile::TempDir, FileBacking) {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path().join("nodes.bin"), 64, 1 << 20).unwrap();
        (dir, backing)
    }

    #[test]
    fn write_read_roundtrip() {
        let (_dir, backing) = backing();
        let uid = backing.write(b"hello nodes").unwrap();
        assert!(uid.is_file());
        assert_eq!(backing.read(uid).unwrap(), b"hello nodes");
    }

    #[test]
    fn freed_slots_are_reused() {
        let (_dir, backing) = backing();
        let a = backing.write(&[1; 100]).unwrap();
        let _b = backing.write(&[2; 100]).unwrap();
        backing.remove(a).unwrap();
        let c = backing.write(&[3; 90]).unwrap();
        // 90 and 100 both round up to two 64-byte blocks, so the freed slot
        // is taken over.
        match (a, c) {
            (FatUid::File { offset: oa, .. }, FatUid::File { offset: oc, .. }) => {
                assert_eq!(oa, oc);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn full_file_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileBacking::new(dir.path().join("tiny.bin"), 64, 128).unwrap();
        backing.write(&[0; 64]).unwrap();
        backing.write(&[0; 64]).unwrap();
        assert!(matches!(backing.write(&[0; 1]), Err(Error::Io(_))));
    }
}
