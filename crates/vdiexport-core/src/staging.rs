//! Staged outputs.
//!
//! Everything the export writes (both images and the digest file) goes to
//! `<path>.partial` first and is published under its real name only when
//! complete, without ever replacing an existing file.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Suffix of in-progress outputs.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// An output file under construction.
///
/// The partial file is reserved with an exclusive create, so a concurrent
/// run targeting the same product fails here instead of clobbering this one.
/// Dropping an uncommitted output removes the partial file.
#[derive(Debug)]
pub(crate) struct StagedOutput {
    partial: PathBuf,
    destination: PathBuf,
    committed: bool,
}

impl StagedOutput {
    pub(crate) fn reserve(destination: &Path) -> Result<Self> {
        let mut partial = destination.as_os_str().to_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::output_collision(&partial),
                _ => Error::io(e, &partial),
            })?;

        Ok(Self {
            partial,
            destination: destination.to_path_buf(),
            committed: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.partial
    }

    /// Publish the partial file under its real name without overwriting.
    pub(crate) fn commit(mut self) -> Result<()> {
        match fs::hard_link(&self.partial, &self.destination) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&self.partial) {
                    warn!(path = %self.partial.display(), error = %e, "failed to remove staging link");
                }
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::output_collision(&self.destination));
            }
            Err(e) => {
                // Filesystems without hard links: check, then rename.
                debug!(error = %e, "hard link unavailable, falling back to rename");
                if self.destination.exists() {
                    return Err(Error::output_collision(&self.destination));
                }
                fs::rename(&self.partial, &self.destination)
                    .map_err(|e| Error::io(e, &self.destination))?;
            }
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if !self.committed {
            match fs::remove_file(&self.partial) {
                Ok(()) => debug!(path = %self.partial.display(), "removed partial output"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.partial.display(), error = %e, "failed to remove partial output"),
            }
        }
    }
}
