//! VM locator: resolve a query to a [`VmDescriptor`].

use std::net::IpAddr;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::api::{ManagementApi, PowerState, VmQuery, VmRecord};
use crate::config::MatchPolicy;
use crate::error::{Error, Result};
use crate::session::Session;

/// Snapshot of a VM as needed by the export stages.
///
/// Immutable; callers re-fetch rather than update it when the power state
/// must be confirmed again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDescriptor {
    pub id: String,
    pub display_name: String,
    pub power_state: PowerState,
    pub root_disk_path: PathBuf,
    /// Address used to reach the guest over SSH.
    pub address: Option<IpAddr>,
}

impl VmDescriptor {
    /// Build a descriptor from an inventory record.
    ///
    /// `address` takes precedence over the record's NICs, so a VM located by
    /// address is reached at that same address.
    pub fn from_record(record: &VmRecord, address: Option<IpAddr>) -> Result<Self> {
        let root = record.root_install_path().ok_or_else(|| {
            Error::not_found(format!("VM {} has no Root volume with an install path", record.uuid))
        })?;
        Ok(Self {
            id: record.uuid.clone(),
            display_name: record.name.clone(),
            power_state: record.power_state(),
            root_disk_path: PathBuf::from(root),
            address: address.or_else(|| record.first_address()),
        })
    }

    /// Same VM with a fresher power state.
    pub fn with_power_state(&self, power_state: PowerState) -> Self {
        Self {
            power_state,
            ..self.clone()
        }
    }

    /// Guest address, or a guest-unreachable error naming `command`.
    pub fn require_address(&self, command: &str) -> Result<IpAddr> {
        self.address.ok_or_else(|| {
            Error::guest_unreachable(command, 0, format!("VM {} has no known network address", self.id))
        })
    }
}

/// Resolve `query` to a single VM.
pub fn locate(
    api: &dyn ManagementApi,
    session: &Session,
    query: &VmQuery,
    policy: MatchPolicy,
) -> Result<VmDescriptor> {
    let records = api.list_vms(session, query)?;

    let record = match records.as_slice() {
        [] => return Err(Error::not_found(format!("no VM matches {}", query))),
        [only] => only,
        [first, ..] => {
            let ids: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
            match policy {
                MatchPolicy::FirstMatch => {
                    warn!(
                        query = %query,
                        candidates = ?ids,
                        chosen = %first.uuid,
                        "query matched several VMs, using the first one"
                    );
                    first
                }
                MatchPolicy::Reject => {
                    return Err(Error::not_found(format!(
                        "{} matches {} VMs ({}); refusing to guess",
                        query,
                        ids.len(),
                        ids.join(", ")
                    )))
                }
            }
        }
    };

    let address = match query {
        VmQuery::Address(addr) => Some(*addr),
        VmQuery::Id(_) => None,
    };
    let vm = VmDescriptor::from_record(record, address)?;
    info!(
        vm = %vm.id,
        name = %vm.display_name,
        state = %vm.power_state,
        root = %vm.root_disk_path.display(),
        "located VM"
    );
    Ok(vm)
}

/// Re-read the VM's power state from the API.
pub fn refresh(api: &dyn ManagementApi, session: &Session, vm: &VmDescriptor) -> Result<VmDescriptor> {
    let record = api
        .get_vm(session, &vm.id)?
        .ok_or_else(|| Error::not_found(format!("VM {} disappeared from the inventory", vm.id)))?;
    Ok(vm.with_power_state(record.power_state()))
}

/// [`refresh`] for use inside a poll loop.
///
/// A transport failure or a VM briefly missing from the inventory yields
/// `Ok(None)` so the caller keeps polling until its own deadline. Auth
/// failures and cancellation stay fatal.
pub fn observe(
    api: &dyn ManagementApi,
    session: &Session,
    vm: &VmDescriptor,
) -> Result<Option<VmDescriptor>> {
    match refresh(api, session, vm) {
        Ok(current) => Ok(Some(current)),
        Err(e @ (Error::Api { .. } | Error::NotFound { .. })) => {
            warn!(vm = %vm.id, error = %e, "state poll failed, will retry");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
