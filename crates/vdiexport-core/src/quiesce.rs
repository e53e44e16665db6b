//! Guest quiescer: trim the guest filesystem so the exported image stays
//! sparse.

use tracing::{info, warn};

use crate::config::TrimFailurePolicy;
use crate::error::{Error, Result};
use crate::locator::VmDescriptor;
use crate::poll::{CancelToken, Clock, RetryPolicy};
use crate::remote::{run_with_retry, RemoteShell};

/// Command run inside the guest.
pub const TRIM_COMMAND: &str = "fstrim /";

/// What the trim stage achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimOutcome {
    /// The trim succeeded after `attempts` tries.
    Trimmed { attempts: u32 },
    /// The trim budget ran out and the policy allowed carrying on.
    Skipped { attempts: u32, reason: String },
}

/// Run the filesystem trim in `vm`, retrying per `policy`.
///
/// When every attempt fails, `on_failure` decides between failing with
/// [`Error::GuestUnreachable`] and continuing with an untrimmed disk.
pub fn trim(
    shell: &dyn RemoteShell,
    vm: &VmDescriptor,
    policy: &RetryPolicy,
    on_failure: TrimFailurePolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<TrimOutcome> {
    let result = vm.require_address(TRIM_COMMAND).and_then(|host| {
        info!(vm = %vm.id, %host, "trimming guest filesystem");
        run_with_retry(shell, host, TRIM_COMMAND, policy, clock, cancel)
    });

    match result {
        Ok(attempts) => {
            info!(vm = %vm.id, attempts, "guest filesystem trimmed");
            Ok(TrimOutcome::Trimmed { attempts })
        }
        Err(Error::GuestUnreachable {
            attempts, message, ..
        }) if on_failure == TrimFailurePolicy::Continue => {
            warn!(
                vm = %vm.id,
                attempts,
                error = %message,
                "trim failed, continuing with an untrimmed disk"
            );
            Ok(TrimOutcome::Skipped {
                attempts,
                reason: message,
            })
        }
        Err(e) => Err(e),
    }
}
