//! Free-space queries for the destination filesystem.

use std::path::Path;

use nix::sys::statvfs::statvfs;

use crate::error::{Error, Result};

/// Reports free space available to unprivileged writers.
pub trait SpaceProbe {
    /// Bytes available on the filesystem holding `path`.
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// [`SpaceProbe`] backed by `statvfs(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let stat = statvfs(path).map_err(|errno| Error::io(std::io::Error::from(errno), path))?;
        #[allow(clippy::unnecessary_cast)]
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(available)
    }
}

/// Fail with [`Error::InsufficientSpace`] unless `path` has `required` bytes free.
pub fn ensure_free_space(probe: &dyn SpaceProbe, path: &Path, required: u64) -> Result<u64> {
    let available = probe.available_bytes(path)?;
    if available < required {
        return Err(Error::insufficient_space(path, required, available));
    }
    Ok(available)
}
