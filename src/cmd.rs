//! Local process execution.
//!
//! Every process runs with a bounded lifetime: [`Invocation::capture`]
//! drives the child on a single-threaded tokio runtime, kills it when
//! the timeout expires, and reports [`DeployError::Timeout`]. Children
//! get a process group of their own, so the operator's Ctrl-C reaches
//! the deployment but not the `ssh` or `git` it is waiting on.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{DeployError, Result};

/// Default ceiling for local commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or `None` when the process was killed by a signal.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Builder for one local process.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    secret_args: Vec<usize>,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl Invocation {
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            secret_args: Vec::new(),
            dir: None,
            env: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an argument that is replaced by `***` in logs and errors.
    #[must_use]
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn stdin(mut self, data: &[u8]) -> Self {
        self.stdin = Some(data.to_vec());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line as it may be logged.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for (index, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&index) {
                parts.push("***".to_string());
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }

    /// Run to completion and capture output, whatever the exit status.
    pub fn capture(&self) -> Result<CommandOutput> {
        debug!(command = %self.display(), "exec");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.capture_async())
    }

    /// Run and fail with [`DeployError::CommandFailed`] on a non-zero
    /// exit. Returns trimmed stdout.
    pub fn run(&self) -> Result<String> {
        let output = self.capture()?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(DeployError::CommandFailed {
                command: self.display(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    async fn capture_async(&self) -> Result<CommandOutput> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| spawn_error(&self.program, e))?;
        let pipe = child.stdin.take();

        let feed = async {
            if let (Some(mut pipe), Some(data)) = (pipe, self.stdin.as_deref()) {
                pipe.write_all(data).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        };
        let work = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.or_else(ignore_broken_pipe)?;
            output
        };

        let output = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| DeployError::Timeout {
                command: self.display(),
                timeout: self.timeout,
            })??;

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// The child may exit before reading all of its input.
fn ignore_broken_pipe(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::BrokenPipe {
        Ok(())
    } else {
        Err(e)
    }
}

fn spawn_error(program: &str, e: io::Error) -> DeployError {
    if e.kind() == io::ErrorKind::NotFound {
        DeployError::CommandNotFound(program.to_string())
    } else {
        DeployError::Io(e)
    }
}

/// Run a command and capture its output. Fails if the command
/// returns a non-zero exit code.
pub fn run(program: &str, args: &[&str]) -> Result<String> {
    Invocation::new(program).args(args.iter().copied()).run()
}
