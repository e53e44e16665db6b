//! State bringup: make sure the VM is running so in-guest commands can run.

use tracing::{info, warn};

use crate::api::ManagementApi;
use crate::error::{Error, Result};
use crate::locator::{observe, VmDescriptor};
use crate::poll::{poll_until, CancelToken, Clock, PollOutcome, PollPolicy};
use crate::session::Session;

/// Start `vm` if needed and wait until the API reports it running.
///
/// A VM that is already running is returned as is, with no start action and
/// no settle delay. Otherwise exactly one start action is issued; the state
/// is then polled every `policy.interval` until `policy.timeout`. Once the VM
/// is seen running the call waits `policy.settle` more, since guest services
/// come up after the hypervisor reports the VM as running.
///
/// A failed or empty state poll counts as "not running yet". A VM that never
/// reaches the running state fails with [`Error::Timeout`]. The start is not
/// retried.
pub fn ensure_running(
    api: &dyn ManagementApi,
    session: &Session,
    vm: &VmDescriptor,
    policy: &PollPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<VmDescriptor> {
    if vm.power_state.is_running() {
        info!(vm = %vm.id, "VM already running");
        return Ok(vm.clone());
    }

    info!(vm = %vm.id, state = %vm.power_state, "starting VM");
    api.start_vm(session, &vm.id)?;

    let outcome = poll_until(clock, cancel, policy, || {
        Ok(observe(api, session, vm)?.filter(|current| current.power_state.is_running()))
    })?;

    match outcome {
        PollOutcome::Ready(running) => {
            if !policy.settle.is_zero() {
                info!(vm = %vm.id, settle = ?policy.settle, "VM running, waiting for guest to settle");
                clock.sleep(policy.settle);
                cancel.check()?;
            }
            Ok(running)
        }
        PollOutcome::Expired { polls } => {
            warn!(vm = %vm.id, polls, "VM did not reach Running state");
            Err(Error::timeout(format!(
                "VM {} did not reach Running state within {:?}",
                vm.id, policy.timeout
            )))
        }
    }
}
