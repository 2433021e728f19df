//! Null backing: the cache holds everything, eviction is disabled.

use crate::{
    error::{Error, Result},
    uid::FatUid,
};

/// Backing medium that refuses persistence.
///
/// With this backing the cache grows without bound; useful for purely
/// in-memory trees and for tests that must not touch the filesystem.
#[derive(Debug, Default)]
pub struct NoBacking;

impl NoBacking {
    pub fn new() -> Self {
        NoBacking
    }
}

impl super::Storage for NoBacking {
    fn supports_eviction(&self) -> bool {
        false
    }

    fn write(&self, _bytes: &[u8]) -> Result<FatUid> {
        Err(Error::Unsupported("null storage cannot persist nodes"))
    }

    fn read(&self, _uid: FatUid) -> Result<Vec<u8>> {
        Err(Error::Internal("read from null storage"))
    }

    fn remove(&self, _uid: FatUid) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
