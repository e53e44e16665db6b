//! Export workflow orchestrator.
//!
//! Runs the stages strictly in order; each stage's success is the
//! precondition of the next:
//!
//! 1. Login to the management API
//! 2. Locate the VM and its root disk
//! 3. Bring the VM up so the guest can run commands
//! 4. Trim the guest filesystem
//! 5. Shut the VM down and confirm it stopped
//! 6. Export the root disk
//!
//! A failure aborts the run with a [`StageError`] naming the stage. Earlier
//! stages are not rolled back.

use std::fmt;
use std::time::Duration;

use tracing::{error, info};

use crate::api::{ManagementApi, VmQuery};
use crate::bringup::ensure_running;
use crate::config::ExportConfig;
use crate::converter::ToolProvider;
use crate::error::{Error, Result};
use crate::export::{
    check_collisions, Artifact, ExportOptions, ExportPhase, ExportPipeline, ExportTarget,
    PhaseCallback, DEFAULT_PRODUCT_NAME,
};
use crate::locator::{locate, VmDescriptor};
use crate::poll::{CancelToken, Clock};
use crate::quiesce::{trim, TrimOutcome};
use crate::remote::RemoteShell;
use crate::session::login;
use crate::shutdown::{shutdown, ShutdownOutcome};
use crate::space::SpaceProbe;

/// A step of the export workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Login,
    Locate,
    Bringup,
    Trim,
    Shutdown,
    Export,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Login,
        Stage::Locate,
        Stage::Bringup,
        Stage::Trim,
        Stage::Shutdown,
        Stage::Export,
    ];

    /// 1-based position in the workflow.
    pub fn ordinal(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0) + 1
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Login => write!(f, "login"),
            Stage::Locate => write!(f, "locate"),
            Stage::Bringup => write!(f, "bringup"),
            Stage::Trim => write!(f, "trim"),
            Stage::Shutdown => write!(f, "shutdown"),
            Stage::Export => write!(f, "export"),
        }
    }
}

/// A fatal error tagged with the stage it occurred in.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

/// Progress notification for observers such as a progress display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Started(Stage),
    Finished { stage: Stage, elapsed: Duration },
    Failed(Stage),
    /// Sub-step of the export stage.
    Export(ExportPhase),
}

/// Type alias for the stage observer.
pub type StageCallback = Box<dyn Fn(StageEvent) + Send>;

/// What to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub query: VmQuery,
    /// Output base name; defaults to the VM's display name.
    pub product: Option<String>,
}

impl ExportRequest {
    pub fn new(query: VmQuery, product: Option<String>) -> Self {
        Self { query, product }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub vm: VmDescriptor,
    pub target: ExportTarget,
    pub trim: TrimOutcome,
    pub shutdown: ShutdownOutcome,
    pub artifact: Artifact,
}

/// The workflow, wired to its collaborators.
pub struct Workflow<'a> {
    config: &'a ExportConfig,
    api: &'a dyn ManagementApi,
    shell: &'a dyn RemoteShell,
    tools: &'a dyn ToolProvider,
    space: &'a dyn SpaceProbe,
    clock: &'a dyn Clock,
    cancel: CancelToken,
    observer: Option<StageCallback>,
}

impl<'a> Workflow<'a> {
    pub fn new(
        config: &'a ExportConfig,
        api: &'a dyn ManagementApi,
        shell: &'a dyn RemoteShell,
        tools: &'a dyn ToolProvider,
        space: &'a dyn SpaceProbe,
        clock: &'a dyn Clock,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            api,
            shell,
            tools,
            space,
            clock,
            cancel,
            observer: None,
        }
    }

    /// Register a callback receiving [`StageEvent`]s.
    pub fn with_observer(mut self, observer: StageCallback) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run every stage for `request`.
    pub fn run(&self, request: &ExportRequest) -> std::result::Result<ExportReport, StageError> {
        let config = self.config;

        let session = self.stage(Stage::Login, || login(self.api, &config.api.credentials()))?;

        let (vm, target) = self.stage(Stage::Locate, || {
            let vm = locate(self.api, &session, &request.query, config.match_policy)?;
            if !vm.root_disk_path.exists() {
                return Err(Error::not_found(format!(
                    "root disk {} of VM {} is not visible on this host",
                    vm.root_disk_path.display(),
                    vm.id
                )));
            }
            let product = request
                .product
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .or_else(|| Some(vm.display_name.as_str()).filter(|n| !n.trim().is_empty()))
                .unwrap_or(DEFAULT_PRODUCT_NAME);
            let target = ExportTarget::new(product, &config.workdir)?;
            check_collisions(&target)?;
            info!(
                product = %target.product_name,
                output = %target.final_path.display(),
                "export target resolved"
            );
            Ok((vm, target))
        })?;

        let vm = self.stage(Stage::Bringup, || {
            ensure_running(self.api, &session, &vm, &config.bringup, self.clock, &self.cancel)
        })?;

        let trim_outcome = self.stage(Stage::Trim, || {
            trim(
                self.shell,
                &vm,
                &config.trim,
                config.trim_failure,
                self.clock,
                &self.cancel,
            )
        })?;

        let shutdown_outcome = self.stage(Stage::Shutdown, || {
            shutdown(
                self.api,
                &session,
                self.shell,
                &vm,
                &config.shutdown,
                self.clock,
                &self.cancel,
            )
        })?;

        let artifact = self.stage(Stage::Export, || {
            let pipeline = ExportPipeline::new(self.tools, self.space, self.cancel.clone());
            let options = ExportOptions::new(config.min_free_bytes, config.verify_digest);
            let on_phase: PhaseCallback<'_> = &|phase| self.notify(StageEvent::Export(phase));
            pipeline.run(&vm.root_disk_path, &target, &options, Some(on_phase))
        })?;

        info!(
            artifact = %artifact.path.display(),
            digest = %artifact.digest,
            size = artifact.size_bytes,
            "export completed"
        );

        Ok(ExportReport {
            vm,
            target,
            trim: trim_outcome,
            shutdown: shutdown_outcome,
            artifact,
        })
    }

    fn stage<T, F>(&self, stage: Stage, f: F) -> std::result::Result<T, StageError>
    where
        F: FnOnce() -> Result<T>,
    {
        let started = self.clock.now();
        info!(
            %stage,
            step = stage.ordinal(),
            of = Stage::ALL.len(),
            "stage started"
        );
        self.notify(StageEvent::Started(stage));

        let result = self.cancel.check().and_then(|_| f());
        match result {
            Ok(value) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                info!(%stage, ?elapsed, "stage completed");
                self.notify(StageEvent::Finished { stage, elapsed });
                Ok(value)
            }
            Err(source) => {
                error!(%stage, error = %source, "stage failed");
                self.notify(StageEvent::Failed(stage));
                Err(StageError { stage, source })
            }
        }
    }

    fn notify(&self, event: StageEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }
}
