//! Remote command execution inside the guest.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::error::{Error, Result};
use crate::poll::{CancelToken, Clock, RetryPolicy};
use crate::process::{self, LaunchSpec};

/// Result of a command that ran to completion in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Exit code; `None` if the remote side was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn describe(&self) -> String {
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match self.exit_code {
            Some(code) => format!("exit code {}: {}", code, detail),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// A channel for running shell commands inside a guest.
pub trait RemoteShell {
    /// Run `command` on `host`.
    ///
    /// `Err` means the command could not be run at all (spawn failure,
    /// timeout, cancellation). A command that ran and failed is `Ok` with a
    /// nonzero exit code.
    fn run(&self, host: IpAddr, command: &str) -> Result<RemoteOutput>;
}

/// [`RemoteShell`] backed by the OpenSSH client.
///
/// With a password configured the client is wrapped in `sshpass -e`, and
/// the password travels in the child's environment rather than its argv.
#[derive(Debug, Clone)]
pub struct SshShell {
    config: SshConfig,
    cancel: CancelToken,
}

impl SshShell {
    pub fn new(config: SshConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    /// Verify the client binaries this shell needs are on `PATH`.
    pub fn check_available(&self) -> Result<()> {
        let mut required = vec!["ssh"];
        if self.config.password.is_some() {
            required.push("sshpass");
        }
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|bin| which::which(bin).is_err())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::config(format!(
                "missing required command(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// The invocation that runs `command` on `host`.
    pub fn launch_spec(&self, host: IpAddr, command: &str) -> LaunchSpec {
        let spec = match &self.config.password {
            Some(password) => LaunchSpec::new("sshpass")
                .args(["-e", "ssh"])
                .secret_env("SSHPASS", password),
            None => LaunchSpec::new("ssh").args(["-o", "BatchMode=yes"]),
        };
        spec.args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg(format!("{}@{}", self.config.user, host))
            .arg(command)
    }
}

impl RemoteShell for SshShell {
    fn run(&self, host: IpAddr, command: &str) -> Result<RemoteOutput> {
        let spec = self.launch_spec(host, command);
        let output = process::run(&spec, Some(self.config.command_timeout), &self.cancel)?;
        Ok(RemoteOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Run `command` until it succeeds or `policy` is exhausted.
///
/// Returns the number of attempts made. Exhaustion yields
/// [`Error::GuestUnreachable`] carrying the last failure. Cancellation is
/// never retried.
pub fn run_with_retry(
    shell: &dyn RemoteShell,
    host: IpAddr,
    command: &str,
    policy: &RetryPolicy,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<u32> {
    let mut attempt = 0u32;
    loop {
        cancel.check()?;
        attempt += 1;

        let failure = match shell.run(host, command) {
            Ok(output) if output.success() => {
                debug!(%host, command, attempt, "remote command succeeded");
                return Ok(attempt);
            }
            Ok(output) => output.describe(),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => e.to_string(),
        };

        if attempt >= policy.max_attempts {
            return Err(Error::guest_unreachable(command, attempt, failure));
        }

        warn!(
            %host,
            command,
            attempt,
            max_attempts = policy.max_attempts,
            backoff = ?policy.backoff,
            error = %failure,
            "remote command failed, retrying"
        );
        clock.sleep(policy.backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::time::Duration;

    fn args(spec: &LaunchSpec) -> Vec<String> {
        spec.get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_launch_spec_with_password() {
        let shell = SshShell::new(
            SshConfig {
                password: Some("letsg0".to_string()),
                ..SshConfig::default()
            },
            CancelToken::new(),
        );
        let spec = shell.launch_spec("10.0.0.7".parse().unwrap(), "fstrim /");

        assert_eq!(spec.program(), std::path::Path::new("sshpass"));
        assert_eq!(spec.get_env("SSHPASS"), Some(OsStr::new("letsg0")));
        let args = args(&spec);
        assert_eq!(&args[..2], &["-e", "ssh"]);
        assert!(!args.iter().any(|a| a.contains("letsg0")));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(&args[args.len() - 2..], &["root@10.0.0.7", "fstrim /"]);
    }

    #[test]
    fn test_launch_spec_key_auth() {
        let shell = SshShell::new(
            SshConfig {
                user: "admin".to_string(),
                port: 2222,
                connect_timeout: Duration::from_secs(5),
                ..SshConfig::default()
            },
            CancelToken::new(),
        );
        let spec = shell.launch_spec("10.0.0.7".parse().unwrap(), "init 0");

        assert_eq!(spec.program(), std::path::Path::new("ssh"));
        assert_eq!(spec.get_env("SSHPASS"), None);
        let args = args(&spec);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"admin@10.0.0.7".to_string()));
    }

    #[test]
    fn test_remote_output_describe() {
        let output = RemoteOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "fstrim: /: the discard operation is not supported\n".to_string(),
        };
        assert!(!output.success());
        assert!(output.describe().starts_with("exit code 1: fstrim"));
    }
}
