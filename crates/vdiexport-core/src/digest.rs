//! Artifact digests.
//!
//! The digest file sits next to the artifact and uses the `md5sum` layout
//! (`<hex>  <file name>`), so it can be checked with `md5sum -c`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::staging::StagedOutput;

/// Suffix appended to the artifact path to name its digest file.
pub const DIGEST_SUFFIX: &str = ".md5";

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Digest file path for `artifact`.
pub fn digest_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(DIGEST_SUFFIX);
    PathBuf::from(name)
}

/// Lowercase hex MD5 of the file at `path`, read in 1 MiB chunks.
pub fn md5_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).map_err(|e| Error::io(e, path))?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Write `<digest>  <file name>\n` next to `artifact`; returns the digest path.
///
/// The line is staged and published without replacing an existing digest
/// file, so an interrupted write never leaves a truncated one behind.
pub fn write_digest_file(artifact: &Path, digest: &str) -> Result<PathBuf> {
    let file_name = artifact
        .file_name()
        .ok_or_else(|| Error::config(format!("{} has no file name", artifact.display())))?;
    let path = digest_path(artifact);
    let line = format!("{}  {}\n", digest, file_name.to_string_lossy());

    let staged = StagedOutput::reserve(&path)?;
    std::fs::write(staged.path(), line).map_err(|e| Error::io(e, staged.path()))?;
    staged.commit()?;
    Ok(path)
}

/// Read the digest recorded for `artifact`.
pub fn read_digest_file(artifact: &Path) -> Result<String> {
    let path = digest_path(artifact);
    let content = std::fs::read_to_string(&path).map_err(|e| Error::io(e, &path))?;
    content
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| Error::conversion_failed(format!("digest file {} is empty", path.display())))
}

/// Re-hash `artifact` and compare with its digest file.
pub fn verify_artifact(artifact: &Path) -> Result<String> {
    let recorded = read_digest_file(artifact)?;
    let actual = md5_file(artifact)?;
    if !recorded.eq_ignore_ascii_case(&actual) {
        return Err(Error::conversion_failed(format!(
            "digest mismatch for {}: recorded {}, computed {}",
            artifact.display(),
            recorded,
            actual
        )));
    }
    Ok(actual)
}
