//! vdiexport Core Library
//!
//! This crate exports the root disk of a VM managed by a ZStack management
//! node into a portable VDI image with an MD5 digest next to it.
//!
//! # Overview
//!
//! An export runs six stages in order: login, locate, bringup, trim,
//! shutdown and export. The main entry point is [`Workflow`], which wires the
//! stages to their collaborators:
//!
//! - a [`ManagementApi`] (the real one is [`ZStackClient`])
//! - a [`RemoteShell`] for in-guest commands (the real one is [`SshShell`])
//! - a [`ToolProvider`] for the disk converter (the real one is [`QemuImgProvider`])
//! - a [`SpaceProbe`] for free space (the real one is [`StatvfsProbe`])
//! - a [`Clock`] driving every wait (the real one is [`SystemClock`])
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Run configuration
//! - [`api`] - Management API model and trait
//! - [`zstack`] - HTTP client for the ZStack API
//! - [`session`] - Credentials and login
//! - [`locator`] - Resolve a VM query to a single VM
//! - [`poll`] - Clock, cancellation, bounded polling and retry policies
//! - [`process`] - Child process launching
//! - [`remote`] - In-guest commands over SSH
//! - [`bringup`] - Start the VM and wait until it runs
//! - [`quiesce`] - Trim the guest filesystem
//! - [`shutdown`] - Stop the VM and confirm it
//! - [`converter`] - Disk conversion tool
//! - [`space`] - Free-space checks
//! - [`digest`] - Artifact digests
//! - [`export`] - Two-stage disk export
//! - [`workflow`] - Stage orchestration
//!
//! # Quick Start
//!
//! ```no_run
//! use vdiexport_core::{
//!     ApiConfig, CancelToken, ExportConfig, ExportRequest, QemuImgProvider, SshShell,
//!     StatvfsProbe, SystemClock, VmQuery, Workflow, ZStackClient,
//! };
//!
//! let config = ExportConfig::new(ApiConfig::new("http://localhost:8080", "admin", "password"), "/data/export");
//! let cancel = CancelToken::new();
//! let api = ZStackClient::new(&config.api).unwrap();
//! let shell = SshShell::new(config.ssh.clone(), cancel.clone());
//! let tools = QemuImgProvider::from_config(&config, cancel.clone());
//!
//! let clock = SystemClock::with_cancel(cancel.clone());
//!
//! let workflow = Workflow::new(&config, &api, &shell, &tools, &StatvfsProbe, &clock, cancel);
//! let report = workflow
//!     .run(&ExportRequest::new(VmQuery::parse("10.0.0.5"), Some("prod".into())))
//!     .unwrap();
//! println!("{} {}", report.artifact.digest, report.artifact.path.display());
//! ```

pub mod api;
pub mod bringup;
pub mod config;
pub mod converter;
pub mod digest;
pub mod error;
pub mod export;
pub mod locator;
pub mod poll;
pub mod process;
pub mod quiesce;
pub mod remote;
pub mod session;
pub mod shutdown;
pub mod space;
mod staging;
pub mod workflow;
pub mod zstack;

pub use error::{Error, Result};

pub use api::{ManagementApi, PowerState, StopMode, VmQuery, VmRecord};
pub use config::{
    ApiConfig, ExportConfig, MatchPolicy, ShutdownPolicy, SshConfig, ToolConfig,
    TrimFailurePolicy, DEFAULT_MIN_FREE_BYTES,
};
pub use converter::{DiskConverter, QemuImgProvider, ToolProvider};
pub use export::{Artifact, ExportOptions, ExportPhase, ExportPipeline, ExportTarget};
pub use locator::VmDescriptor;
pub use poll::{CancelToken, Clock, PollPolicy, RetryPolicy, SystemClock};
pub use quiesce::TrimOutcome;
pub use remote::{RemoteShell, SshShell};
pub use session::{Credentials, Session};
pub use shutdown::ShutdownOutcome;
pub use space::{SpaceProbe, StatvfsProbe};
pub use workflow::{
    ExportReport, ExportRequest, Stage, StageCallback, StageError, StageEvent, Workflow,
};
pub use zstack::ZStackClient;
