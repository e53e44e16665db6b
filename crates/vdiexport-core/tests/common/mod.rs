//! In-memory collaborators shared by the integration tests.
//!
//! [`FakeApi`] and [`FakeShell`] share one [`Sim`], so an in-guest
//! power-off is visible through the API the way it would be on a real host.
//! All time is virtual: [`FakeClock::sleep`] only advances an offset.

#![allow(dead_code)]

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vdiexport_core::api::{NicRecord, VolumeRecord};
use vdiexport_core::converter::{ConvertRequest, ImageInfo};
use vdiexport_core::remote::RemoteOutput;
use vdiexport_core::{
    CancelToken, Clock, Credentials, DiskConverter, Error, ManagementApi, Result, Session,
    SpaceProbe, StopMode, ToolProvider, VmQuery, VmRecord,
};

pub const SESSION_TOKEN: &str = "3c1f9b2e7d5a4e8f";
pub const GIB: u64 = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Manual clock; `sleep` advances virtual time instantly.
#[derive(Clone)]
pub struct FakeClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
    cancel_at: Arc<Mutex<Option<(Duration, CancelToken)>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            cancel_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    /// Raise `token` once virtual time reaches `at`, as a Ctrl-C would.
    pub fn cancel_at(&self, at: Duration, token: CancelToken) {
        *self.cancel_at.lock().unwrap() = Some((at, token));
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        let now = {
            let mut offset = self.offset.lock().unwrap();
            *offset += duration;
            *offset
        };
        self.sleeps.lock().unwrap().push(duration);
        if let Some((at, token)) = self.cancel_at.lock().unwrap().as_ref() {
            if now >= *at {
                token.cancel();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated host
// ---------------------------------------------------------------------------

/// Everything the fakes observed, with virtual timestamps where useful.
#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub logins: u32,
    pub lists: Vec<String>,
    /// Virtual time of every single-VM fetch.
    pub gets: Vec<Duration>,
    /// Virtual time of every start action.
    pub starts: Vec<Duration>,
    pub stops: Vec<StopMode>,
    pub shell: Vec<String>,
}

/// Power state of the target VM and how it reacts to requests.
#[derive(Debug)]
pub struct Sim {
    pub state: String,
    started_at: Option<Duration>,
    /// Time from start action to Running; `None` never boots.
    pub boot_time: Option<Duration>,
    /// The guest powers off when told to over SSH.
    pub obeys_poweroff: bool,
    /// The host stops the VM on a forced stop.
    pub honours_forced_stop: bool,
    /// Number of trim attempts that fail before one succeeds.
    pub trim_failures: u32,
    /// Indices of single-VM fetches that fail with a transport error.
    pub failing_gets: Vec<usize>,
    /// Indices of single-VM fetches where the VM is missing.
    pub vanishing_gets: Vec<usize>,
    pub calls: Calls,
}

impl Sim {
    pub fn new(state: &str) -> Self {
        Self {
            state: state.to_string(),
            started_at: None,
            boot_time: Some(Duration::from_secs(7)),
            obeys_poweroff: true,
            honours_forced_stop: true,
            trim_failures: 0,
            failing_gets: Vec::new(),
            vanishing_gets: Vec::new(),
            calls: Calls::default(),
        }
    }

    fn advance(&mut self, now: Duration) {
        if self.state == "Starting" {
            if let (Some(started), Some(boot)) = (self.started_at, self.boot_time) {
                if now >= started + boot {
                    self.state = "Running".to_string();
                }
            }
        }
    }
}

pub type SharedSim = Arc<Mutex<Sim>>;

pub fn shared_sim(state: &str) -> SharedSim {
    Arc::new(Mutex::new(Sim::new(state)))
}

/// Inventory record with one Root volume and one NIC.
pub fn vm_record(uuid: &str, name: &str, root: &Path, ip: &str) -> VmRecord {
    VmRecord {
        uuid: uuid.to_string(),
        name: name.to_string(),
        state: String::new(),
        all_volumes: vec![
            VolumeRecord {
                volume_type: "Data".to_string(),
                install_path: Some("/data/extra.qcow2".to_string()),
            },
            VolumeRecord {
                volume_type: "Root".to_string(),
                install_path: Some(root.display().to_string()),
            },
        ],
        vm_nics: vec![NicRecord {
            ip: Some(ip.to_string()),
        }],
    }
}

// ---------------------------------------------------------------------------
// Management API
// ---------------------------------------------------------------------------

pub struct FakeApi {
    clock: FakeClock,
    sim: SharedSim,
    records: Vec<VmRecord>,
    password: String,
}

impl FakeApi {
    /// API serving `records`; the first record is the simulated VM.
    pub fn new(clock: &FakeClock, sim: &SharedSim, records: Vec<VmRecord>) -> Self {
        Self {
            clock: clock.clone(),
            sim: Arc::clone(sim),
            records,
            password: "password".to_string(),
        }
    }

    pub fn calls(&self) -> Calls {
        self.sim.lock().unwrap().calls.clone()
    }

    fn with_state(&self, record: &VmRecord, sim: &Sim) -> VmRecord {
        let mut record = record.clone();
        record.state = match self.records.first() {
            Some(first) if first.uuid == record.uuid => sim.state.clone(),
            _ => "Running".to_string(),
        };
        record
    }
}

impl ManagementApi for FakeApi {
    fn login(&self, credentials: &Credentials) -> Result<Session> {
        self.sim.lock().unwrap().calls.logins += 1;
        let expected = Credentials::new(credentials.account(), self.password.clone());
        if credentials.password_digest() != expected.password_digest() {
            return Err(Error::auth("login rejected: wrong account or password"));
        }
        Session::new(SESSION_TOKEN)
    }

    fn list_vms(&self, session: &Session, query: &VmQuery) -> Result<Vec<VmRecord>> {
        assert_eq!(session.token(), SESSION_TOKEN);
        let mut sim = self.sim.lock().unwrap();
        sim.calls.lists.push(query.filter());
        sim.advance(self.clock.elapsed());
        Ok(self
            .records
            .iter()
            .filter(|r| match query {
                VmQuery::Id(id) => &r.uuid == id,
                VmQuery::Address(addr) => r.first_address() == Some(*addr),
            })
            .map(|r| self.with_state(r, &sim))
            .collect())
    }

    fn get_vm(&self, session: &Session, vm_id: &str) -> Result<Option<VmRecord>> {
        assert_eq!(session.token(), SESSION_TOKEN);
        let now = self.clock.elapsed();
        let mut sim = self.sim.lock().unwrap();
        let index = sim.calls.gets.len();
        sim.calls.gets.push(now);
        sim.advance(now);
        if sim.failing_gets.contains(&index) {
            return Err(Error::api("get VM returned 503 Service Unavailable"));
        }
        if sim.vanishing_gets.contains(&index) {
            return Ok(None);
        }
        Ok(self
            .records
            .iter()
            .find(|r| r.uuid == vm_id)
            .map(|r| self.with_state(r, &sim)))
    }

    fn start_vm(&self, session: &Session, _vm_id: &str) -> Result<()> {
        assert_eq!(session.token(), SESSION_TOKEN);
        let now = self.clock.elapsed();
        let mut sim = self.sim.lock().unwrap();
        sim.calls.starts.push(now);
        sim.state = "Starting".to_string();
        sim.started_at = Some(now);
        Ok(())
    }

    fn stop_vm(&self, session: &Session, _vm_id: &str, mode: StopMode) -> Result<()> {
        assert_eq!(session.token(), SESSION_TOKEN);
        let mut sim = self.sim.lock().unwrap();
        sim.calls.stops.push(mode);
        let stops = match mode {
            StopMode::Graceful => sim.obeys_poweroff,
            StopMode::Forced => sim.honours_forced_stop,
        };
        if stops {
            sim.state = "Stopped".to_string();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote shell
// ---------------------------------------------------------------------------

pub struct FakeShell {
    sim: SharedSim,
}

impl FakeShell {
    pub fn new(sim: &SharedSim) -> Self {
        Self {
            sim: Arc::clone(sim),
        }
    }
}

impl vdiexport_core::RemoteShell for FakeShell {
    fn run(&self, _host: IpAddr, command: &str) -> Result<RemoteOutput> {
        let mut sim = self.sim.lock().unwrap();
        sim.calls.shell.push(command.to_string());

        let refused = RemoteOutput {
            exit_code: Some(255),
            stdout: String::new(),
            stderr: "ssh: connect to host port 22: Connection refused".to_string(),
        };
        let ok = RemoteOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };

        match command {
            "fstrim /" if sim.trim_failures > 0 => {
                sim.trim_failures -= 1;
                Ok(refused)
            }
            "fstrim /" => Ok(ok),
            "init 0" => {
                if sim.obeys_poweroff {
                    sim.state = "Stopped".to_string();
                }
                // The channel drops as the guest goes down.
                Ok(refused)
            }
            other => panic!("unexpected remote command: {}", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// What the fake converter was asked to do.
#[derive(Debug, Default, Clone)]
pub struct ConverterLog {
    pub resolutions: u32,
    pub probes: u32,
    pub infos: u32,
    /// `(source, target format, destination)` per conversion.
    pub conversions: Vec<(PathBuf, String, PathBuf)>,
}

pub struct FakeToolProvider {
    log: Arc<Mutex<ConverterLog>>,
    missing: bool,
    fail_format: Option<String>,
    virtual_size: u64,
}

impl FakeToolProvider {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(ConverterLog::default())),
            missing: false,
            fail_format: None,
            virtual_size: 20 * GIB,
        }
    }

    /// No converter can be found.
    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Self::new()
        }
    }

    /// Conversions to `format` write some bytes, then fail.
    pub fn failing_on(format: &str) -> Self {
        Self {
            fail_format: Some(format.to_string()),
            ..Self::new()
        }
    }

    pub fn with_virtual_size(mut self, bytes: u64) -> Self {
        self.virtual_size = bytes;
        self
    }

    pub fn log(&self) -> ConverterLog {
        self.log.lock().unwrap().clone()
    }
}

impl ToolProvider for FakeToolProvider {
    fn converter(&self) -> Result<Box<dyn DiskConverter>> {
        self.log.lock().unwrap().resolutions += 1;
        if self.missing {
            return Err(Error::tool_not_found("qemu-img not found at /work/bin/qemu-img or on PATH"));
        }
        Ok(Box::new(FakeConverter {
            log: Arc::clone(&self.log),
            fail_format: self.fail_format.clone(),
            virtual_size: self.virtual_size,
        }))
    }
}

struct FakeConverter {
    log: Arc<Mutex<ConverterLog>>,
    fail_format: Option<String>,
    virtual_size: u64,
}

impl DiskConverter for FakeConverter {
    fn probe(&self) -> Result<()> {
        self.log.lock().unwrap().probes += 1;
        Ok(())
    }

    fn info(&self, image: &Path) -> Result<ImageInfo> {
        self.log.lock().unwrap().infos += 1;
        let actual_size = fs::metadata(image).map_err(|e| Error::io(e, image))?.len();
        Ok(ImageInfo {
            virtual_size: self.virtual_size,
            actual_size,
            format: Some("qcow2".to_string()),
        })
    }

    /// Output is `<format>:` followed by the source bytes, so it is
    /// deterministic in the input.
    fn convert(&self, request: &ConvertRequest<'_>) -> Result<()> {
        self.log.lock().unwrap().conversions.push((
            request.source.to_path_buf(),
            request.target_format.to_string(),
            request.destination.to_path_buf(),
        ));

        let source = fs::read(request.source).map_err(|e| Error::io(e, request.source))?;
        let output = converted_bytes(request.target_format, &source);

        if self.fail_format.as_deref() == Some(request.target_format) {
            fs::write(request.destination, &output[..output.len() / 2])
                .map_err(|e| Error::io(e, request.destination))?;
            return Err(Error::conversion_failed(format!(
                "qemu-img convert -O {} exited with status 1",
                request.target_format
            )));
        }

        fs::write(request.destination, output).map_err(|e| Error::io(e, request.destination))
    }
}

/// Bytes the fake converter produces for `source` in `format`.
pub fn converted_bytes(format: &str, source: &[u8]) -> Vec<u8> {
    let mut output = format!("{}:", format).into_bytes();
    output.extend_from_slice(source);
    output
}

// ---------------------------------------------------------------------------
// Free space
// ---------------------------------------------------------------------------

pub struct FakeSpace {
    available: u64,
    queries: Mutex<Vec<PathBuf>>,
}

impl FakeSpace {
    pub fn new(available: u64) -> Self {
        Self {
            available,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

impl SpaceProbe for FakeSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        self.queries.lock().unwrap().push(path.to_path_buf());
        Ok(self.available)
    }
}

/// Every file name in `dir`, sorted.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
