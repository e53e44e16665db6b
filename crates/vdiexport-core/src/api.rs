//! Management API model and client trait.
//!
//! The workflow only talks to the virtualization host through
//! [`ManagementApi`]; [`crate::zstack::ZStackClient`] is the HTTP
//! implementation.

use std::fmt;
use std::net::IpAddr;

use serde::Deserialize;

use crate::error::Result;
use crate::session::{Credentials, Session};

/// How a VM is identified on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmQuery {
    /// Direct VM identifier (UUID).
    Id(String),
    /// Network address of one of the VM's NICs.
    Address(IpAddr),
}

impl VmQuery {
    /// Interpret `input` as an IP address if it parses as one, else as an id.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input.parse::<IpAddr>() {
            Ok(addr) => Self::Address(addr),
            Err(_) => Self::Id(input.to_string()),
        }
    }

    /// The API filter expression for this query.
    pub fn filter(&self) -> String {
        match self {
            Self::Id(id) => format!("uuid={}", id),
            Self::Address(addr) => format!("vmNics.ip={}", addr),
        }
    }
}

impl fmt::Display for VmQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {}", id),
            Self::Address(addr) => write!(f, "address {}", addr),
        }
    }
}

/// Power state as reported by the management API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Other(String),
}

impl PowerState {
    /// Parse an API state string, case-insensitively.
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            _ => Self::Other(state.trim().to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Other(s) if s.is_empty() => write!(f, "Unknown"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// How the management API should stop a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// ACPI-style graceful stop.
    Graceful,
    /// Immediate power-off of the VM process.
    Forced,
}

impl StopMode {
    /// The API's name for this stop type.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Self::Graceful => "grace",
            Self::Forced => "cold",
        }
    }
}

/// A volume attached to a VM.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    #[serde(rename = "type", default)]
    pub volume_type: String,
    #[serde(default)]
    pub install_path: Option<String>,
}

/// A network interface attached to a VM.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NicRecord {
    #[serde(default)]
    pub ip: Option<String>,
}

/// A VM inventory record, as returned by the listing endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub all_volumes: Vec<VolumeRecord>,
    #[serde(default)]
    pub vm_nics: Vec<NicRecord>,
}

impl VmRecord {
    pub fn power_state(&self) -> PowerState {
        PowerState::parse(&self.state)
    }

    /// Install path of the volume flagged as the root volume.
    pub fn root_install_path(&self) -> Option<&str> {
        self.all_volumes
            .iter()
            .find(|v| v.volume_type == "Root")
            .and_then(|v| v.install_path.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// First NIC address, if any.
    pub fn first_address(&self) -> Option<IpAddr> {
        self.vm_nics
            .iter()
            .filter_map(|n| n.ip.as_deref())
            .find_map(|ip| ip.parse().ok())
    }
}

/// Operations consumed from the virtualization management API.
pub trait ManagementApi {
    /// Authenticate and obtain a session.
    fn login(&self, credentials: &Credentials) -> Result<Session>;

    /// List VMs matching `query`, in API order.
    fn list_vms(&self, session: &Session, query: &VmQuery) -> Result<Vec<VmRecord>>;

    /// Fetch a single VM by id, `None` if it no longer exists.
    fn get_vm(&self, session: &Session, vm_id: &str) -> Result<Option<VmRecord>>;

    /// Ask the host to start a VM.
    fn start_vm(&self, session: &Session, vm_id: &str) -> Result<()>;

    /// Ask the host to stop a VM.
    fn stop_vm(&self, session: &Session, vm_id: &str, mode: StopMode) -> Result<()>;
}
