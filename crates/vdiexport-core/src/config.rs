//! Run configuration.
//!
//! An [`ExportConfig`] is assembled once at startup (by the CLI, from flags
//! and environment fallbacks) and passed by reference to every stage. Nothing
//! in the core reads configuration from the environment mid-run.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::poll::{PollPolicy, RetryPolicy};
use crate::session::Credentials;

/// Default management API endpoint.
pub const DEFAULT_API_HOST: &str = "http://localhost:8080";

/// Default management API account.
pub const DEFAULT_ACCOUNT: &str = "admin";

/// Default in-guest user for trim and shutdown.
pub const DEFAULT_SSH_USER: &str = "root";

/// Minimum free space required before exporting (50 GiB).
pub const DEFAULT_MIN_FREE_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Upper bound for one disk conversion (4 hours).
pub const DEFAULT_CONVERT_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Library directories made visible to a bundled converter.
pub const DEFAULT_LIB_DIRS: [&str; 2] = ["lib", "/opt/qemu-lib"];

/// Management API connection settings.
#[derive(Clone)]
pub struct ApiConfig {
    /// Base URL, without a trailing slash.
    pub host: String,
    /// Account name used to log in.
    pub account: String,
    /// Plaintext password; digested before it leaves the process.
    pub password: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl ApiConfig {
    /// Create API settings. Trailing slashes on `host` are dropped.
    pub fn new(host: &str, account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            account: account.into(),
            password: password.into(),
            request_timeout: Duration::from_secs(15),
        }
    }

    /// Credentials for the login call.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.account.clone(), self.password.clone())
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("host", &self.host)
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Remote shell settings for in-guest commands.
#[derive(Clone)]
pub struct SshConfig {
    /// Login user inside the guest.
    pub user: String,
    /// Password; `None` means key-based authentication.
    pub password: Option<String>,
    /// SSH port.
    pub port: u16,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Upper bound for a single remote command.
    pub command_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_string(),
            password: None,
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

/// Where to find the conversion tool and its runtime libraries.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Explicit converter path (flag or environment override).
    pub qemu_img: Option<PathBuf>,
    /// Directories prepended to the converter's library search path.
    pub library_path: Option<OsString>,
    /// Upper bound for the sanity probe and image inspection.
    pub probe_timeout: Duration,
    /// Upper bound for one conversion.
    pub convert_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            qemu_img: None,
            library_path: None,
            probe_timeout: Duration::from_secs(60),
            convert_timeout: DEFAULT_CONVERT_TIMEOUT,
        }
    }
}

/// What to do when the guest trim exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrimFailurePolicy {
    /// Fail the whole export.
    #[default]
    Abort,
    /// Log a warning and export an untrimmed (larger) disk.
    Continue,
}

/// How to resolve a VM query that matches more than one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Use the first record in API order and warn about the others.
    #[default]
    FirstMatch,
    /// Refuse to pick.
    Reject,
}

/// Bounds for confirming the VM has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Pause between two state checks.
    pub interval: Duration,
    /// Time allowed for the guest to power off, and again after a forced stop.
    pub grace_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            grace_timeout: Duration::from_secs(120),
        }
    }
}

/// Complete configuration for one export run.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Management API settings.
    pub api: ApiConfig,
    /// Remote shell settings.
    pub ssh: SshConfig,
    /// Conversion tool settings.
    pub tool: ToolConfig,
    /// Directory receiving the intermediate and final images.
    pub workdir: PathBuf,
    /// Floor for the free-space precondition.
    pub min_free_bytes: u64,
    /// Start-and-wait bounds.
    pub bringup: PollPolicy,
    /// Retry budget for the in-guest trim.
    pub trim: RetryPolicy,
    /// Behaviour when the trim budget is exhausted.
    pub trim_failure: TrimFailurePolicy,
    /// Stop-and-confirm bounds.
    pub shutdown: ShutdownPolicy,
    /// Tie-break for ambiguous VM queries.
    pub match_policy: MatchPolicy,
    /// Re-hash the artifact after writing its digest file.
    pub verify_digest: bool,
}

impl ExportConfig {
    /// Configuration with default policies for the given API and workdir.
    pub fn new(api: ApiConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            ssh: SshConfig::default(),
            tool: ToolConfig::default(),
            workdir: workdir.into(),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            bringup: PollPolicy::default(),
            trim: RetryPolicy::default(),
            trim_failure: TrimFailurePolicy::default(),
            shutdown: ShutdownPolicy::default(),
            match_policy: MatchPolicy::default(),
            verify_digest: false,
        }
    }

    /// The bundled converter location, `<workdir>/bin/qemu-img`.
    pub fn bundled_qemu_img(&self) -> PathBuf {
        self.workdir.join("bin").join("qemu-img")
    }
}

/// Default library search prefix for a converter bundled under `workdir`.
pub fn default_library_path(workdir: &Path) -> OsString {
    let mut value = OsString::new();
    for (i, dir) in DEFAULT_LIB_DIRS.iter().enumerate() {
        if i > 0 {
            value.push(":");
        }
        value.push(workdir.join(dir));
    }
    value
}
