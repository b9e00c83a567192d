use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::cmd::Invocation;
use crate::error::{DeployError, Result};
use crate::shell::{Cmd, Script};

/// The machine under provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<PathBuf>,
}

impl RemoteTarget {
    #[must_use]
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 22,
            user: "root".to_string(),
            identity: None,
        }
    }

    /// Parse `user@host` or a bare `host` (user defaults to `root`).
    pub fn parse(spec: &str) -> Result<Self> {
        let (user, host) = match spec.rsplit_once('@') {
            Some((user, host)) => (user, host),
            None => ("root", spec),
        };
        if user.is_empty() || host.is_empty() {
            return Err(DeployError::Validation {
                field: "host",
                reason: format!("expected user@host, got '{spec}'"),
            });
        }
        Ok(Self::new(host).user(user))
    }

    #[must_use]
    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn identity(mut self, key: &Path) -> Self {
        self.identity = Some(key.to_path_buf());
        self
    }

    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.user == "root"
    }

    /// Wrap a mutating script in `sudo -n` unless we log in as root.
    #[must_use]
    pub fn elevate(&self, script: Script) -> Script {
        let sudo = !self.is_root();
        script.sudo(sudo)
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}", self.destination())
        } else {
            write!(f, "{}:{}", self.destination(), self.port)
        }
    }
}

/// Per-command execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Never prompt for passwords or host keys.
    pub batch_mode: bool,
    pub allocate_pty: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            batch_mode: true,
            allocate_pty: false,
        }
    }
}

impl ExecOptions {
    /// Read-only discovery commands.
    #[must_use]
    pub fn probe() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Package installation and service setup.
    #[must_use]
    pub fn install() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            ..Self::default()
        }
    }

    /// Image builds.
    #[must_use]
    pub fn build() -> Self {
        Self {
            timeout: Duration::from_secs(1800),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on a remote host.
///
/// [`execute`](Self::execute) only fails on transport problems
/// ([`DeployError::Connect`], [`DeployError::Timeout`]); a non-zero
/// exit is returned in [`ExecOutput`] so the caller decides whether it
/// means "absent" or "fatal".
pub trait RemoteExecutor {
    fn target(&self) -> &RemoteTarget;

    fn execute(&self, script: &Script, opts: &ExecOptions) -> Result<ExecOutput>;

    /// Write `content` to `remote_path` as root, replacing it.
    fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()>;

    /// Copy a local file to `remote_path` as the login user.
    fn copy_file(&self, local: &Path, remote_path: &str) -> Result<()>;

    /// Run a mutating script, elevated if needed. Non-zero exit is an
    /// error.
    fn run(&self, script: Script, opts: &ExecOptions) -> Result<String> {
        let script = self.target().elevate(script);
        let output = self.execute(&script, opts)?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(DeployError::RemoteCommand {
                step: None,
                command: script.render(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Run a read-only script. Non-zero exit yields `None`.
    fn query(&self, script: Script) -> Result<Option<String>> {
        let output = self.execute(&script, &ExecOptions::probe())?;
        Ok(output
            .success()
            .then(|| output.stdout.trim().to_string()))
    }

    /// Run a read-only script and report whether it exited zero.
    fn check(&self, script: Script) -> Result<bool> {
        Ok(self.execute(&script, &ExecOptions::probe())?.success())
    }
}

/// [`RemoteExecutor`] over the system `ssh` and `scp` binaries.
pub struct SshSession {
    target: RemoteTarget,
    connect_timeout: u32,
}

impl SshSession {
    #[must_use]
    pub const fn new(target: RemoteTarget) -> Self {
        Self {
            target,
            connect_timeout: 10,
        }
    }

    #[must_use]
    pub const fn connect_timeout(mut self, seconds: u32) -> Self {
        self.connect_timeout = seconds;
        self
    }

    /// Arguments passed to `ssh` for one remote command.
    #[must_use]
    pub fn ssh_args(&self, script: &Script, opts: &ExecOptions) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.target.port.to_string()];
        args.extend(self.common_options(opts.batch_mode));
        args.push(if opts.allocate_pty { "-tt" } else { "-T" }.to_string());
        args.push("--".to_string());
        args.push(self.target.destination());
        args.push(script.render());
        args
    }

    fn common_options(&self, batch_mode: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if batch_mode {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if let Some(key) = &self.target.identity {
            args.push("-i".to_string());
            args.push(key.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args
    }

    fn scp_destination(&self, remote_path: &str) -> String {
        if self.target.host.contains(':') {
            format!("{}@[{}]:{remote_path}", self.target.user, self.target.host)
        } else {
            format!("{}:{remote_path}", self.target.destination())
        }
    }

    fn connect_error(&self, stderr: &str) -> DeployError {
        DeployError::Connect {
            host: self.target.to_string(),
            detail: stderr.trim().to_string(),
        }
    }
}

impl RemoteExecutor for SshSession {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn execute(&self, script: &Script, opts: &ExecOptions) -> Result<ExecOutput> {
        debug!(host = %self.target, command = %script, "remote exec");
        let output = Invocation::new("ssh")
            .args(self.ssh_args(script, opts))
            .timeout(opts.timeout)
            .capture()?;

        // ssh reserves 255 for its own failures.
        match output.code() {
            Some(255) => Err(self.connect_error(&output.stderr)),
            code => Ok(ExecOutput {
                exit_code: code.unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()> {
        let script = self
            .target
            .elevate(Cmd::new("tee").arg(remote_path).discard_stdout().into());
        let opts = ExecOptions::default();
        debug!(host = %self.target, path = remote_path, bytes = content.len(), "remote write");
        let output = Invocation::new("ssh")
            .args(self.ssh_args(&script, &opts))
            .stdin(content)
            .timeout(opts.timeout)
            .capture()?;

        match output.code() {
            Some(0) => Ok(()),
            Some(255) => Err(self.connect_error(&output.stderr)),
            code => Err(DeployError::RemoteCommand {
                step: None,
                command: script.render(),
                exit_code: code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    fn copy_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        let mut args = vec!["-P".to_string(), self.target.port.to_string()];
        args.extend(self.common_options(true));
        args.push("-q".to_string());
        args.push(local.display().to_string());
        args.push(self.scp_destination(remote_path));

        debug!(host = %self.target, local = %local.display(), remote = remote_path, "scp");
        let output = Invocation::new("scp")
            .args(args)
            .timeout(ExecOptions::build().timeout)
            .capture()?;

        if output.success() {
            Ok(())
        } else {
            Err(self.connect_error(&output.stderr))
        }
    }
}
