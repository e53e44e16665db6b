//! External process launching.
//!
//! A [`LaunchSpec`] describes one invocation: program, arguments, an
//! environment overlay applied on top of the inherited environment, and an
//! optional working directory. It is built fresh for every call, so nothing
//! mutates the process-wide environment.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::poll::CancelToken;

/// How often a running child is checked for exit, timeout or cancellation.
const WAIT_TICK: Duration = Duration::from_millis(100);

/// Description of a single external command invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    /// Overlay keys whose values must not appear in logs.
    secret_env: Vec<OsString>,
}

impl LaunchSpec {
    /// Start describing an invocation of `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            secret_env: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for this invocation only.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let key = key.as_ref().to_os_string();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.as_ref().to_os_string()));
        self
    }

    /// Like [`LaunchSpec::env`], but the value is redacted when displayed.
    pub fn secret_env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.secret_env.push(key.as_ref().to_os_string());
        self.env(key, value)
    }

    /// Prepend `prefix` to a search-path style variable (`A:B:C`).
    ///
    /// `existing` is the value inherited from the parent environment, passed
    /// in by the caller so the overlay stays a pure function of its inputs.
    pub fn prepend_path_var(
        self,
        key: impl AsRef<OsStr>,
        prefix: impl AsRef<OsStr>,
        existing: Option<&OsStr>,
    ) -> Self {
        let mut value = prefix.as_ref().to_os_string();
        if let Some(existing) = existing.filter(|e| !e.is_empty()) {
            value.push(":");
            value.push(existing);
        }
        self.env(key, value)
    }

    /// Run the command in `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// The program to execute.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The argument list.
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Working directory, if one was set.
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Look up a variable in the overlay.
    pub fn get_env(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        let key = key.as_ref();
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    /// Build the [`Command`] this spec describes.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| {
                if self.secret_env.contains(k) {
                    format!("{}=<redacted>", k.to_string_lossy())
                } else {
                    format!("{}={}", k.to_string_lossy(), v.to_string_lossy())
                }
            })
            .collect();
        f.debug_struct("LaunchSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env)
            .field("current_dir", &self.current_dir)
            .finish()
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Captured standard output, lossily decoded.
    pub stdout: String,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl ProcessOutput {
    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// One-line summary for error messages.
    pub fn describe_failure(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        let detail = if !stderr.is_empty() { stderr } else { stdout };
        if detail.is_empty() {
            format!("{}", self.status)
        } else {
            format!("{}: {}", self.status, detail)
        }
    }
}

/// Run `spec` to completion, capturing its output.
///
/// The child is killed if `timeout` elapses (yielding [`Error::Timeout`]) or
/// if `cancel` is raised (yielding [`Error::Cancelled`]).
pub fn run(spec: &LaunchSpec, timeout: Option<Duration>, cancel: &CancelToken) -> Result<ProcessOutput> {
    cancel.check()?;
    debug!(command = %spec, "launching process");

    let mut child = spec
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io(e, spec.program()))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let deadline = timeout.map(|t| Instant::now() + t);

    let status = loop {
        match child.try_wait().map_err(|e| Error::io(e, spec.program()))? {
            Some(status) => break status,
            None => {
                if cancel.is_cancelled() {
                    reap(&mut child);
                    return Err(Error::Cancelled);
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    reap(&mut child);
                    return Err(Error::timeout(format!(
                        "'{}' did not finish within {:?}",
                        spec,
                        timeout.unwrap_or_default()
                    )));
                }
                thread::sleep(WAIT_TICK);
            }
        }
    };

    Ok(ProcessOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
