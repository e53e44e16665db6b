//! Export pipeline: convert the stopped VM's root disk into the final image.
//!
//! The pipeline runs in a fixed order:
//! 1. Preflight: locate the converter, refuse existing outputs, check the
//!    tool runs and that the destination has room for two copies of the disk
//! 2. Convert the source disk to the intermediate format (qcow2)
//! 3. Convert the intermediate image to the final format (vdi)
//! 4. Digest the final image and write the digest file next to it
//! 5. Remove the intermediate image
//!
//! Every output, the digest file included, is written to a `.partial` file
//! that only gets its real name once it is complete. A failed or interrupted
//! conversion leaves nothing under the final name.
//!
//! # Example
//!
//! ```no_run
//! use vdiexport_core::export::{ExportOptions, ExportPipeline, ExportTarget};
//! use vdiexport_core::converter::QemuImgProvider;
//! use vdiexport_core::config::{ApiConfig, ExportConfig, DEFAULT_API_HOST};
//! use vdiexport_core::poll::CancelToken;
//! use vdiexport_core::space::StatvfsProbe;
//! use std::path::Path;
//!
//! let config = ExportConfig::new(ApiConfig::new(DEFAULT_API_HOST, "admin", "password"), "/work");
//! let cancel = CancelToken::new();
//! let tools = QemuImgProvider::from_config(&config, cancel.clone());
//! let pipeline = ExportPipeline::new(&tools, &StatvfsProbe, cancel);
//! let target = ExportTarget::new("prod", Path::new("/work")).unwrap();
//!
//! let artifact = pipeline
//!     .run(Path::new("/data/vm-1.img"), &target, &ExportOptions::default(), None)
//!     .unwrap();
//! println!("{} {}", artifact.path.display(), artifact.digest);
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::converter::{ConvertRequest, DiskConverter, ToolProvider};
use crate::digest::{self, md5_file, verify_artifact, write_digest_file};
use crate::error::{Error, Result};
use crate::poll::CancelToken;
use crate::space::{ensure_free_space, SpaceProbe};
use crate::staging::StagedOutput;

pub use crate::staging::PARTIAL_SUFFIX;

/// Format of the staging image.
pub const INTERMEDIATE_FORMAT: &str = "qcow2";

/// Format of the delivered image.
pub const FINAL_FORMAT: &str = "vdi";

/// Product name used when neither the operator nor the VM provides one.
pub const DEFAULT_PRODUCT_NAME: &str = "vm_image";

/// Options for the export pipeline.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Lower bound for the free-space precondition.
    pub min_free_bytes: u64,
    /// Re-hash the artifact after writing its digest file.
    pub verify_digest: bool,
}

impl ExportOptions {
    pub fn new(min_free_bytes: u64, verify_digest: bool) -> Self {
        Self {
            min_free_bytes,
            verify_digest,
        }
    }
}

/// Phase of the export pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    /// Checking tool, outputs and free space.
    Preflight,
    /// Writing the intermediate image.
    Intermediate,
    /// Writing the final image.
    Final,
    /// Computing and persisting the digest.
    Digest,
    /// Removing the intermediate image.
    Cleanup,
}

impl std::fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportPhase::Preflight => write!(f, "Preflight"),
            ExportPhase::Intermediate => write!(f, "Converting to {}", INTERMEDIATE_FORMAT),
            ExportPhase::Final => write!(f, "Converting to {}", FINAL_FORMAT),
            ExportPhase::Digest => write!(f, "Computing digest"),
            ExportPhase::Cleanup => write!(f, "Cleaning up"),
        }
    }
}

/// Callback invoked when the pipeline enters a new phase.
pub type PhaseCallback<'a> = &'a dyn Fn(ExportPhase);

/// Output locations for one export, derived once from the product name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub product_name: String,
    pub working_directory: PathBuf,
    pub intermediate_path: PathBuf,
    pub final_path: PathBuf,
    pub digest_path: PathBuf,
}

impl ExportTarget {
    /// Derive the output paths for `product_name` under `working_directory`.
    ///
    /// The name is sanitized to a safe file name first.
    pub fn new(product_name: &str, working_directory: &Path) -> Result<Self> {
        let product_name = sanitize_filename(product_name.trim());
        if product_name.is_empty() || product_name.chars().all(|c| c == '.') {
            return Err(Error::config("product name is empty"));
        }
        let final_path = working_directory.join(format!("{}.{}", product_name, FINAL_FORMAT));
        Ok(Self {
            intermediate_path: working_directory
                .join(format!("{}.{}", product_name, INTERMEDIATE_FORMAT)),
            digest_path: digest::digest_path(&final_path),
            final_path,
            working_directory: working_directory.to_path_buf(),
            product_name,
        })
    }

    /// Every path this export will create.
    pub fn outputs(&self) -> [&Path; 3] {
        [
            self.intermediate_path.as_path(),
            self.final_path.as_path(),
            self.digest_path.as_path(),
        ]
    }
}

/// The finished export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Lowercase hex MD5 of the artifact.
    pub digest: String,
    pub size_bytes: u64,
    pub digest_path: PathBuf,
}

/// The export stage, wired to its collaborators.
pub struct ExportPipeline<'a> {
    tools: &'a dyn ToolProvider,
    space: &'a dyn SpaceProbe,
    cancel: CancelToken,
}

impl<'a> ExportPipeline<'a> {
    pub fn new(tools: &'a dyn ToolProvider, space: &'a dyn SpaceProbe, cancel: CancelToken) -> Self {
        Self {
            tools,
            space,
            cancel,
        }
    }

    /// Export `disk_path` to `target`.
    ///
    /// The converter is located first, so a missing tool fails before any
    /// other work. Existing outputs are refused before the converter is run
    /// at all. Conversions are never retried.
    pub fn run(
        &self,
        disk_path: &Path,
        target: &ExportTarget,
        options: &ExportOptions,
        on_phase: Option<PhaseCallback<'_>>,
    ) -> Result<Artifact> {
        let report = |phase: ExportPhase| {
            debug!(%phase, "export phase");
            if let Some(callback) = on_phase {
                callback(phase);
            }
        };

        // Phase 1: preflight
        report(ExportPhase::Preflight);
        self.cancel.check()?;
        let converter = self.tools.converter()?;
        check_collisions(target)?;
        converter.probe()?;

        let source = converter.info(disk_path)?;
        let required = source
            .virtual_size
            .saturating_mul(2)
            .max(options.min_free_bytes);
        let available = ensure_free_space(self.space, &target.working_directory, required)?;
        info!(
            source = %disk_path.display(),
            virtual_size = source.virtual_size,
            actual_size = source.actual_size,
            required,
            available,
            "export preflight passed"
        );

        let intermediate = StagedOutput::reserve(&target.intermediate_path)?;
        let final_output = StagedOutput::reserve(&target.final_path)?;

        // Phase 2: source -> intermediate
        report(ExportPhase::Intermediate);
        self.convert(
            converter.as_ref(),
            disk_path,
            source.format.as_deref(),
            INTERMEDIATE_FORMAT,
            intermediate,
        )?;
        let intermediate_size = file_size(&target.intermediate_path)?;
        info!(
            path = %target.intermediate_path.display(),
            size = intermediate_size,
            "intermediate image written"
        );

        // Phase 3: intermediate -> final
        report(ExportPhase::Final);
        let result = ensure_free_space(
            self.space,
            &target.working_directory,
            intermediate_size.max(options.min_free_bytes),
        )
        .and_then(|_| {
            self.convert(
                converter.as_ref(),
                &target.intermediate_path,
                Some(INTERMEDIATE_FORMAT),
                FINAL_FORMAT,
                final_output,
            )
        });
        if let Err(e) = result {
            warn!(
                path = %target.intermediate_path.display(),
                "final conversion failed, intermediate image left in place"
            );
            return Err(e);
        }
        let size_bytes = file_size(&target.final_path)?;
        info!(path = %target.final_path.display(), size = size_bytes, "final image written");

        // Phase 4: digest
        report(ExportPhase::Digest);
        self.cancel.check()?;
        let digest = md5_file(&target.final_path)?;
        let digest_path = write_digest_file(&target.final_path, &digest)?;
        info!(path = %digest_path.display(), %digest, "digest saved");
        if options.verify_digest {
            verify_artifact(&target.final_path)?;
            info!("digest verified");
        }

        // Phase 5: cleanup
        report(ExportPhase::Cleanup);
        match fs::remove_file(&target.intermediate_path) {
            Ok(()) => info!(path = %target.intermediate_path.display(), "removed intermediate image"),
            Err(e) => warn!(
                path = %target.intermediate_path.display(),
                error = %e,
                "failed to remove intermediate image"
            ),
        }

        Ok(Artifact {
            path: target.final_path.clone(),
            digest,
            size_bytes,
            digest_path,
        })
    }

    fn convert(
        &self,
        converter: &dyn DiskConverter,
        source: &Path,
        source_format: Option<&str>,
        target_format: &str,
        output: StagedOutput,
    ) -> Result<()> {
        self.cancel.check()?;
        converter.convert(&ConvertRequest {
            source,
            source_format,
            target_format,
            destination: output.path(),
        })?;
        self.cancel.check()?;
        output.commit()
    }
}

/// Fail if any output of `target` already exists.
pub fn check_collisions(target: &ExportTarget) -> Result<()> {
    for path in target.outputs() {
        if path.symlink_metadata().is_ok() {
            return Err(Error::output_collision(path));
        }
    }
    Ok(())
}

fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| Error::io(e, path))
}

/// Sanitize a filename to `[A-Za-z0-9_.-]`, replacing anything else with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
