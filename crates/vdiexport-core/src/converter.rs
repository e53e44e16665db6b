//! Disk conversion tool.
//!
//! The converter is a black box invoked through [`DiskConverter`]. The
//! concrete implementation drives `qemu-img`; [`ToolProvider`] defers
//! locating it until the export stage actually needs it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{default_library_path, ExportConfig, ToolConfig};
use crate::error::{Error, Result};
use crate::poll::CancelToken;
use crate::process::{self, LaunchSpec, ProcessOutput};

/// Converter binary name looked up on `PATH`.
pub const QEMU_IMG: &str = "qemu-img";

/// Library search variable extended for the converter.
const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Image metadata reported by the converter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageInfo {
    /// Logical (guest-visible) size in bytes.
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    /// Bytes allocated on the host filesystem.
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    /// Detected image format.
    #[serde(default)]
    pub format: Option<String>,
}

/// One conversion job.
#[derive(Debug, Clone, Copy)]
pub struct ConvertRequest<'a> {
    pub source: &'a Path,
    /// Source format; `None` lets the converter probe it.
    pub source_format: Option<&'a str>,
    pub target_format: &'a str,
    pub destination: &'a Path,
}

/// Operations consumed from the conversion tool.
pub trait DiskConverter {
    /// Check the tool actually runs (its shared libraries resolve, etc.).
    fn probe(&self) -> Result<()>;

    /// Read image metadata.
    fn info(&self, image: &Path) -> Result<ImageInfo>;

    /// Convert an image. Any abnormal exit is [`Error::ConversionFailed`].
    fn convert(&self, request: &ConvertRequest<'_>) -> Result<()>;
}

/// Resolves the converter on demand.
pub trait ToolProvider {
    /// Locate the converter, failing with [`Error::ToolNotFound`].
    fn converter(&self) -> Result<Box<dyn DiskConverter>>;
}

/// `qemu-img` driven through [`LaunchSpec`]s.
///
/// Every invocation is bounded: `--help` and `info` by the probe timeout,
/// `convert` by the convert timeout. A timed-out conversion is reported as
/// [`Error::ConversionFailed`] so the caller discards its partial output.
#[derive(Debug, Clone)]
pub struct QemuImg {
    path: PathBuf,
    library_path: Option<OsString>,
    inherited_library_path: Option<OsString>,
    working_dir: Option<PathBuf>,
    probe_timeout: Duration,
    convert_timeout: Duration,
    cancel: CancelToken,
}

impl QemuImg {
    pub fn new(path: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        let defaults = ToolConfig::default();
        Self {
            path: path.into(),
            library_path: None,
            inherited_library_path: None,
            working_dir: None,
            probe_timeout: defaults.probe_timeout,
            convert_timeout: defaults.convert_timeout,
            cancel,
        }
    }

    pub fn with_timeouts(mut self, probe: Duration, convert: Duration) -> Self {
        self.probe_timeout = probe;
        self.convert_timeout = convert;
        self
    }

    /// Run every invocation from `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Prepend `library_path` to the library search path of every invocation,
    /// ahead of `inherited` (the parent's value).
    pub fn with_library_path(mut self, library_path: OsString, inherited: Option<OsString>) -> Self {
        self.library_path = Some(library_path);
        self.inherited_library_path = inherited;
        self
    }

    /// Base invocation with the library overlay applied.
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.path);
        if let Some(dir) = &self.working_dir {
            spec = spec.current_dir(dir);
        }
        match &self.library_path {
            Some(lib) => spec.prepend_path_var(
                LIBRARY_PATH_VAR,
                lib,
                self.inherited_library_path.as_deref(),
            ),
            None => spec,
        }
    }

    /// Arguments for a conversion.
    pub fn convert_args(request: &ConvertRequest<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["convert".into()];
        if let Some(format) = request.source_format {
            args.push("-f".into());
            args.push(format.into());
        }
        args.push("-O".into());
        args.push(request.target_format.into());
        args.push(request.source.into());
        args.push(request.destination.into());
        args
    }

    /// Pass a successful exit through; otherwise build the error with
    /// `on_failure`. A child killed by the operator's interrupt exits
    /// abnormally before the token is observed, so a raised token wins.
    fn check_exit(
        &self,
        output: ProcessOutput,
        on_failure: impl FnOnce(String) -> Error,
    ) -> Result<ProcessOutput> {
        if output.success() {
            return Ok(output);
        }
        self.cancel.check()?;
        Err(on_failure(output.describe_failure()))
    }
}

impl DiskConverter for QemuImg {
    fn probe(&self) -> Result<()> {
        let spec = self.launch_spec().arg("--help");
        let output = process::run(&spec, Some(self.probe_timeout), &self.cancel).map_err(|e| match e {
            Error::Cancelled => e,
            other => Error::tool_not_found(format!("{} cannot run: {}", self.path.display(), other)),
        })?;
        self.check_exit(output, |failure| {
            Error::tool_not_found(format!("{} --help failed: {}", self.path.display(), failure))
        })?;
        Ok(())
    }

    fn info(&self, image: &Path) -> Result<ImageInfo> {
        let spec = self.launch_spec().args(["info", "--output", "json"]).arg(image);
        let output = process::run(&spec, Some(self.probe_timeout), &self.cancel)?;
        let output = self.check_exit(output, |failure| {
            Error::conversion_failed(format!("cannot inspect {}: {}", image.display(), failure))
        })?;
        parse_image_info(&output.stdout)
    }

    fn convert(&self, request: &ConvertRequest<'_>) -> Result<()> {
        let spec = self.launch_spec().args(Self::convert_args(request));
        info!(
            source = %request.source.display(),
            destination = %request.destination.display(),
            format = request.target_format,
            "converting image"
        );
        let output = process::run(&spec, Some(self.convert_timeout), &self.cancel).map_err(|e| match e {
            Error::Cancelled => e,
            other => Error::conversion_failed(format!("{}: {}", spec, other)),
        })?;
        self.check_exit(output, |failure| Error::conversion_failed(format!("{}: {}", spec, failure)))?;
        Ok(())
    }
}

/// Parse `qemu-img info --output json`.
pub fn parse_image_info(json: &str) -> Result<ImageInfo> {
    serde_json::from_str(json)
        .map_err(|e| Error::conversion_failed(format!("unreadable image info: {}", e)))
}

/// Locate the converter binary.
///
/// An explicit path is authoritative: if it is missing or not executable the
/// lookup fails rather than falling back. Otherwise the bundled copy is used
/// when present, then `qemu-img` on `PATH`.
pub fn resolve_tool(explicit: Option<&Path>, bundled: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return if is_executable(path) {
            Ok(path.to_path_buf())
        } else {
            Err(Error::tool_not_found(format!(
                "{} does not exist or is not executable",
                path.display()
            )))
        };
    }

    if is_executable(bundled) {
        return Ok(bundled.to_path_buf());
    }

    which::which(QEMU_IMG).map_err(|_| {
        Error::tool_not_found(format!(
            "{} not found at {} or on PATH",
            QEMU_IMG,
            bundled.display()
        ))
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// [`ToolProvider`] that resolves `qemu-img` from an [`ExportConfig`].
#[derive(Debug, Clone)]
pub struct QemuImgProvider {
    explicit: Option<PathBuf>,
    bundled: PathBuf,
    library_path: OsString,
    inherited_library_path: Option<OsString>,
    workdir: PathBuf,
    probe_timeout: Duration,
    convert_timeout: Duration,
    cancel: CancelToken,
}

impl QemuImgProvider {
    /// Capture everything needed to build the converter later, including the
    /// parent's library search path as it is at startup.
    pub fn from_config(config: &ExportConfig, cancel: CancelToken) -> Self {
        Self {
            explicit: config.tool.qemu_img.clone(),
            bundled: config.bundled_qemu_img(),
            library_path: config
                .tool
                .library_path
                .clone()
                .unwrap_or_else(|| default_library_path(&config.workdir)),
            inherited_library_path: std::env::var_os(LIBRARY_PATH_VAR),
            workdir: config.workdir.clone(),
            probe_timeout: config.tool.probe_timeout,
            convert_timeout: config.tool.convert_timeout,
            cancel,
        }
    }
}

impl ToolProvider for QemuImgProvider {
    fn converter(&self) -> Result<Box<dyn DiskConverter>> {
        let path = resolve_tool(self.explicit.as_deref(), &self.bundled)?;
        debug!(path = %path.display(), "using converter");
        Ok(Box::new(
            QemuImg::new(path, self.cancel.clone())
                .with_library_path(self.library_path.clone(), self.inherited_library_path.clone())
                .with_working_dir(&self.workdir)
                .with_timeouts(self.probe_timeout, self.convert_timeout),
        ))
    }
}
