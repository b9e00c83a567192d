use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::plan::Step;

pub type Result<T> = std::result::Result<T, DeployError>;

/// How bad a failure is. Ordered: a later variant is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Bad input or a missing prerequisite. Nothing on the host changed.
    Input,
    /// Transport or remote command failure.
    Failure,
    /// The host may be in an intermediate state.
    Critical,
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("cannot connect to {host}: {detail}")]
    Connect { host: String, detail: String },

    #[error("command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error(
        "{}remote command exited with status {}: {}",
        step_prefix(.step),
        .exit_code,
        .command
    )]
    RemoteCommand {
        step: Option<Step>,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("required capability {capability} is unavailable: {detail}")]
    CapabilityMissing { capability: String, detail: String },

    #[error(
        "no build manifest found in {} (looked for: {})",
        .dir.display(),
        .searched.join(", ")
    )]
    BuildFilesMissing { dir: PathBuf, searched: Vec<String> },

    #[error("invalid build manifest {}: {}", .path.display(), .reason)]
    InvalidManifest { path: PathBuf, reason: String },

    #[error(
        "branch '{}' not found on remote (available: {})",
        .branch,
        join_or_none(.available)
    )]
    BranchNotFound {
        branch: String,
        available: Vec<String>,
    },

    #[error("health check failed for {app}: {reason}")]
    HealthCheckFailed { app: String, reason: String },

    #[error("rollback failed, manual intervention required: {0}")]
    Rollback(String),

    #[error("no snapshot recorded at {0}")]
    NoSnapshot(String),

    #[error("deploy lock held by {holder} (pid {pid}) since {since}")]
    LockHeld {
        holder: String,
        pid: u32,
        since: DateTime<Utc>,
    },

    #[error("deployment aborted by operator")]
    Aborted,

    #[error("command failed ({status}): {command}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[allow(clippy::ref_option)]
fn step_prefix(step: &Option<Step>) -> String {
    step.map(|s| format!("{s}: ")).unwrap_or_default()
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

impl DeployError {
    /// Attach the step that issued a failing remote command.
    #[must_use]
    pub fn in_step(self, step: Step) -> Self {
        match self {
            Self::RemoteCommand {
                step: None,
                command,
                exit_code,
                stderr,
            } => Self::RemoteCommand {
                step: Some(step),
                command,
                exit_code,
                stderr,
            },
            other => other,
        }
    }

    /// Transport failures may succeed on a later attempt. Everything
    /// else is deterministic and retrying it only repeats the failure.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Validation { .. }
            | Self::BuildFilesMissing { .. }
            | Self::InvalidManifest { .. }
            | Self::BranchNotFound { .. }
            | Self::CommandNotFound(_)
            | Self::FileNotFound(_)
            | Self::LockHeld { .. }
            | Self::NoSnapshot(_) => Severity::Input,
            Self::Rollback(_) => Severity::Critical,
            _ => Severity::Failure,
        }
    }

    /// Exit status of the failing remote command, if any.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::RemoteCommand { exit_code, .. } => Some(*exit_code),
            Self::CommandFailed { status, .. } => status.code(),
            _ => None,
        }
    }

    /// One-line remediation hint shown next to the error.
    #[must_use]
    pub const fn hint(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "fix the flag or config value named above",
            Self::Connect { .. } => {
                "check the host address, SSH port, user and key; \
                 the key must be usable without a passphrase prompt"
            }
            Self::Timeout { .. } => "the host is slow or unreachable; retry or raise the timeout",
            Self::RemoteCommand { .. } => {
                "rerun with --verbose to see the command output; \
                 completed steps are skipped or reconverged on rerun"
            }
            Self::CapabilityMissing { .. } => {
                "install the capability manually or rerun with --install-docker"
            }
            Self::BuildFilesMissing { .. } => {
                "add a Dockerfile or compose file to the repository, \
                 or point --compose-file at one"
            }
            Self::InvalidManifest { .. } => "validate the file with `docker compose config`",
            Self::BranchNotFound { .. } => "pass --branch with one of the listed branches",
            Self::HealthCheckFailed { .. } => {
                "inspect the container logs with `docker logs <app-name>` on the host"
            }
            Self::Rollback(_) => {
                "the host may be half-deployed: inspect the containers and the \
                 nginx config by hand, then rerun the deployment"
            }
            Self::NoSnapshot(_) => "there is nothing to roll back to on this host",
            Self::LockHeld { .. } => {
                "wait for the other deployment to finish, or pass --force-unlock \
                 if it is known to be dead"
            }
            Self::Aborted => "rerun the deployment when ready",
            Self::CommandNotFound(_) => "install the missing tool locally",
            _ => "rerun with --verbose for details",
        }
    }
}
