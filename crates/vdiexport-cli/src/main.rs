//! vdiexport CLI - Export a managed VM's root disk to VDI.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vdiexport_core::config::{DEFAULT_ACCOUNT, DEFAULT_API_HOST, DEFAULT_SSH_USER};
use vdiexport_core::{
    ApiConfig, CancelToken, Error, ExportConfig, ExportReport, ExportRequest, MatchPolicy,
    QemuImgProvider, RetryPolicy, ShutdownOutcome, SshShell, Stage, StageError, StageEvent,
    StatvfsProbe, SystemClock, TrimFailurePolicy, TrimOutcome, VmQuery, Workflow, ZStackClient,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// Exit status used when the run is interrupted with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

/// Trim, shut down and export a ZStack VM's root disk as a VDI image.
#[derive(Parser, Debug)]
#[command(name = "vdiexport")]
#[command(version, about, long_about = None)]
struct Cli {
    /// VM to export: its UUID or the IP address of one of its NICs.
    vm: String,

    /// Base name for the output files. Defaults to the VM name.
    product: Option<String>,

    /// Management API base URL.
    #[arg(long, env = "ZSTACK_HOST", default_value = DEFAULT_API_HOST)]
    host: String,

    /// Management API account.
    #[arg(long, env = "ZSTACK_ACCOUNT", default_value = DEFAULT_ACCOUNT)]
    account: String,

    /// Management API password.
    #[arg(long, env = "ZSTACK_PASSWORD", hide_env_values = true)]
    password: String,

    /// User for in-guest commands.
    #[arg(long, env = "VDIEXPORT_SSH_USER", default_value = DEFAULT_SSH_USER)]
    ssh_user: String,

    /// Password for in-guest commands. Key-based authentication when omitted.
    #[arg(long, env = "VDIEXPORT_SSH_PASS", hide_env_values = true)]
    ssh_pass: Option<String>,

    /// SSH port inside the guest.
    #[arg(long, default_value = "22")]
    ssh_port: u16,

    /// Directory receiving the images. Also holds a bundled bin/qemu-img.
    #[arg(short, long, env = "VDIEXPORT_WORKDIR", default_value = ".")]
    workdir: PathBuf,

    /// Path to qemu-img. Defaults to <workdir>/bin/qemu-img, then PATH.
    #[arg(long, env = "VDIEXPORT_QEMU_IMG")]
    qemu_img: Option<PathBuf>,

    /// Library directories prepended to LD_LIBRARY_PATH for qemu-img.
    #[arg(long, env = "VDIEXPORT_LIB_PATH")]
    lib_path: Option<OsString>,

    /// Minutes allowed for each qemu-img conversion before it is killed.
    #[arg(long, env = "VDIEXPORT_CONVERT_TIMEOUT", default_value = "240")]
    convert_timeout: u64,

    /// Minimum free space in the working directory, in GiB.
    #[arg(long, default_value = "50")]
    min_free_gb: u64,

    /// Total attempts for the in-guest trim.
    #[arg(long, default_value = "3")]
    trim_attempts: u32,

    /// Seconds to wait between trim attempts.
    #[arg(long, default_value = "30")]
    trim_backoff: u64,

    /// Export an untrimmed disk when the guest cannot be trimmed.
    #[arg(long)]
    continue_on_trim_failure: bool,

    /// Fail when the VM query matches more than one VM.
    #[arg(long)]
    strict_match: bool,

    /// Re-hash the VDI after writing its digest file.
    #[arg(long)]
    verify: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress progress output and warnings below error.
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            if is_cancelled(&err) {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Build the run configuration from parsed arguments.
fn build_config(cli: &Cli, workdir: PathBuf) -> ExportConfig {
    let mut config = ExportConfig::new(
        ApiConfig::new(&cli.host, cli.account.clone(), cli.password.clone()),
        workdir,
    );
    config.ssh.user = cli.ssh_user.clone();
    config.ssh.password = cli.ssh_pass.clone().filter(|p| !p.is_empty());
    config.ssh.port = cli.ssh_port;
    config.tool.qemu_img = cli.qemu_img.clone();
    config.tool.library_path = cli.lib_path.clone();
    config.tool.convert_timeout = Duration::from_secs(cli.convert_timeout.saturating_mul(60));
    config.min_free_bytes = cli.min_free_gb.saturating_mul(GIB);
    config.trim = RetryPolicy::new(cli.trim_attempts, Duration::from_secs(cli.trim_backoff));
    config.trim_failure = if cli.continue_on_trim_failure {
        TrimFailurePolicy::Continue
    } else {
        TrimFailurePolicy::Abort
    };
    config.match_policy = if cli.strict_match {
        MatchPolicy::Reject
    } else {
        MatchPolicy::FirstMatch
    };
    config.verify_digest = cli.verify;
    config
}

fn run(cli: &Cli) -> Result<()> {
    let workdir = std::fs::canonicalize(&cli.workdir).with_context(|| {
        format!("working directory {} is not accessible", cli.workdir.display())
    })?;
    let config = build_config(cli, workdir);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("failed to install Ctrl-C handler")?;
    }

    let shell = SshShell::new(config.ssh.clone(), cancel.clone());
    shell.check_available()?;
    let api = ZStackClient::new(&config.api)?;
    let tools = QemuImgProvider::from_config(&config, cancel.clone());
    let clock = SystemClock::with_cancel(cancel.clone());

    info!(
        workdir = %config.workdir.display(),
        host = %config.api.host,
        vm = %cli.vm,
        "starting export"
    );

    let request = ExportRequest::new(VmQuery::parse(&cli.vm), cli.product.clone());

    let spinner = if cli.quiet { None } else { Some(new_spinner()?) };

    let mut workflow = Workflow::new(
        &config,
        &api,
        &shell,
        &tools,
        &StatvfsProbe,
        &clock,
        cancel,
    );
    if let Some(pb) = &spinner {
        let pb = pb.clone();
        workflow = workflow.with_observer(Box::new(move |event| update_spinner(&pb, &event)));
    }

    let result = workflow.run(&request);

    if let Some(pb) = &spinner {
        match &result {
            Ok(_) => pb.finish_with_message("Complete!"),
            Err(err) => pb.abandon_with_message(format!("{} stage failed", err.stage)),
        }
    }

    let report = result?;
    if !cli.quiet {
        print_summary(&report);
    }

    Ok(())
}

fn new_spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn update_spinner(pb: &ProgressBar, event: &StageEvent) {
    let total = Stage::ALL.len();
    match event {
        StageEvent::Started(stage) => {
            pb.set_message(format!("[{}/{}] {}", stage.ordinal(), total, stage));
        }
        StageEvent::Finished { stage, elapsed } => {
            pb.println(format!("  {} done in {:.1?}", stage, elapsed));
        }
        StageEvent::Failed(stage) => {
            pb.set_message(format!("[{}/{}] {} failed", stage.ordinal(), total, stage));
        }
        StageEvent::Export(phase) => {
            pb.set_message(format!("[{}/{}] export: {}", Stage::Export.ordinal(), total, phase));
        }
    }
}

fn print_summary(report: &ExportReport) {
    println!();
    println!("Export Summary");
    println!("--------------");
    println!("VM:        {} ({})", report.vm.display_name, report.vm.id);
    println!("Root disk: {}", report.vm.root_disk_path.display());
    println!(
        "Trim:      {}",
        match &report.trim {
            TrimOutcome::Trimmed { attempts } => format!("done after {} attempt(s)", attempts),
            TrimOutcome::Skipped { reason, .. } => format!("skipped ({})", reason),
        }
    );
    println!(
        "Shutdown:  {}",
        match report.shutdown {
            ShutdownOutcome::AlreadyStopped => "already stopped",
            ShutdownOutcome::Graceful => "graceful",
            ShutdownOutcome::Forced => "forced",
        }
    );
    println!();
    println!("Output:    {}", report.artifact.path.display());
    println!("Size:      {}", format_bytes(report.artifact.size_bytes));
    println!("MD5:       {}", report.artifact.digest);
    println!("Digest:    {}", display_name(&report.artifact.digest_path));
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StageError>(),
        Some(StageError {
            source: Error::Cancelled,
            ..
        })
    )
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
