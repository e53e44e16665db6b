//! Shutdown controller.
//!
//! The disk must not be read while the VM process still holds it open, so
//! this stage only succeeds once the management API reports the VM stopped.

use tracing::{debug, info, warn};

use crate::api::{ManagementApi, StopMode};
use crate::config::ShutdownPolicy;
use crate::error::{Error, Result};
use crate::locator::{observe, refresh, VmDescriptor};
use crate::poll::{poll_until, CancelToken, Clock, PollOutcome, PollPolicy};
use crate::remote::RemoteShell;
use crate::session::Session;

/// Command run inside the guest to power it off.
pub const SHUTDOWN_COMMAND: &str = "init 0";

/// How the VM ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// It was already stopped when the stage began.
    AlreadyStopped,
    /// The guest powered itself off.
    Graceful,
    /// The management API had to force it off.
    Forced,
}

/// Power off `vm` and confirm through the API that it stopped.
///
/// The in-guest power-off usually tears down the SSH channel before the
/// command can report success, so its result is only logged. If the VM is
/// not stopped within `policy.grace_timeout`, a forced stop is requested and
/// awaited for the same duration; if that also fails to stop it, the stage
/// fails with [`Error::Shutdown`].
pub fn shutdown(
    api: &dyn ManagementApi,
    session: &Session,
    shell: &dyn RemoteShell,
    vm: &VmDescriptor,
    policy: &ShutdownPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<ShutdownOutcome> {
    if refresh(api, session, vm)?.power_state.is_stopped() {
        info!(vm = %vm.id, "VM already stopped");
        return Ok(ShutdownOutcome::AlreadyStopped);
    }

    match vm.address {
        Some(host) => {
            info!(vm = %vm.id, %host, "powering off guest");
            match shell.run(host, SHUTDOWN_COMMAND) {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    debug!(vm = %vm.id, exit_code = ?output.exit_code, "power-off channel closed")
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(vm = %vm.id, error = %e, "power-off command did not complete"),
            }
        }
        None => {
            warn!(vm = %vm.id, "no guest address, requesting graceful stop through the API");
            api.stop_vm(session, &vm.id, StopMode::Graceful)?;
        }
    }

    let wait = PollPolicy::new(policy.interval, policy.grace_timeout, std::time::Duration::ZERO);
    if wait_stopped(api, session, vm, &wait, clock, cancel)? {
        info!(vm = %vm.id, "VM stopped");
        return Ok(ShutdownOutcome::Graceful);
    }

    warn!(vm = %vm.id, timeout = ?policy.grace_timeout, "guest did not power off, forcing stop");
    api.stop_vm(session, &vm.id, StopMode::Forced)
        .map_err(|e| match e {
            Error::Auth { .. } | Error::Cancelled => e,
            other => Error::shutdown(format!("forced stop of VM {} failed: {}", vm.id, other)),
        })?;

    if wait_stopped(api, session, vm, &wait, clock, cancel)? {
        info!(vm = %vm.id, "VM stopped after forced stop");
        return Ok(ShutdownOutcome::Forced);
    }

    Err(Error::shutdown(format!(
        "VM {} still not stopped {:?} after a forced stop",
        vm.id, policy.grace_timeout
    )))
}

fn wait_stopped(
    api: &dyn ManagementApi,
    session: &Session,
    vm: &VmDescriptor,
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<bool> {
    let outcome = poll_until(clock, cancel, policy, || {
        let current = observe(api, session, vm)?;
        Ok(current.filter(|c| c.power_state.is_stopped()).map(|_| ()))
    })?;
    Ok(matches!(outcome, PollOutcome::Ready(())))
}
