//! Backing byte storage for evicted nodes.
//!
//! The cache speaks a narrow contract: a serialized node goes in, a
//! [`FatUid::File`] comes back; bytes can be fetched or freed by uid. Two
//! implementations exist: [`FileBacking`] appends records to a raw file and
//! reuses freed regions, [`NoBacking`] refuses persistence so the cache
//! never evicts.

use crate::{config::BackingConfig, error::Result, uid::FatUid};

mod file;
mod none;

pub use file::FileBacking;
pub use none::NoBacking;

/// Config-selected backing medium.
pub enum Backing {
    None(NoBacking),
    File(FileBacking),
}

impl Backing {
    pub fn from_config(config: &BackingConfig) -> Result<Self> {
        Ok(match config {
            BackingConfig::None => Backing::None(NoBacking::new()),
            BackingConfig::File {
                path,
                block_size,
                file_size,
            } => Backing::File(FileBacking::new(path, *block_size, *file_size)?),
        })
    }
}

impl Storage for Backing {
    fn supports_eviction(&self) -> bool {
        match self {
            Backing::None(inner) => inner.supports_eviction(),
            Backing::File(inner) => inner.supports_eviction(),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<FatUid> {
        match self {
            Backing::None(inner) => inner.write(bytes),
            Backing::File(inner) => inner.write(bytes),
        }
    }

    fn read(&self, uid: FatUid) -> Result<Vec<u8>> {
        match self {
            Backing::None(inner) => inner.read(uid),
            Backing::File(inner) => inner.read(uid),
        }
    }

    fn remove(&self, uid: FatUid) -> Result<()> {
        match self {
            Backing::None(inner) => inner.remove(uid),
            Backing::File(inner) => inner.remove(uid),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            Backing::None(inner) => inner.flush(),
            Backing::File(inner) => inner.flush(),
        }
    }
}

/// Capability set the cache requires from a backing medium.
///
/// Implementations serialise access internally; the cache calls them from
/// multiple threads without additional locking.
pub trait Storage: Send + Sync + 'static {
    /// Whether nodes can be handed over for eviction at all.
    fn supports_eviction(&self) -> bool {
        true
    }

    /// Persists a serialized node record and returns its file uid.
    fn write(&self, bytes: &[u8]) -> Result<FatUid>;

    /// Fetches the record behind a [`FatUid::File`].
    fn read(&self, uid: FatUid) -> Result<Vec<u8>>;

    /// Marks the region behind a [`FatUid::File`] free for reuse.
    fn remove(&self, uid: FatUid) -> Result<()>;

    /// Flushes pending writes to the medium. Called on shutdown.
    fn flush(&self) -> Result<()>;
}
