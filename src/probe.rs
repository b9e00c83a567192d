//! Read-only discovery of remote capabilities.
//!
//! Probing never changes the host. Each call asks the host afresh;
//! results are not cached because provisioning may have changed them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::shell::{Cmd, Script};
use crate::ssh::RemoteExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    ContainerRuntime,
    Compose,
    ReverseProxy,
}

impl Capability {
    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::ContainerRuntime | Self::Compose => "docker",
            Self::ReverseProxy => "nginx",
        }
    }

    /// The systemd unit that keeps this capability running, if any.
    #[must_use]
    pub const fn service_unit(self) -> Option<&'static str> {
        match self {
            Self::ContainerRuntime => Some("docker.service"),
            Self::Compose => None,
            Self::ReverseProxy => Some("nginx.service"),
        }
    }

    /// Whether a deployment can proceed without it.
    #[must_use]
    pub const fn is_mandatory(self) -> bool {
        !matches!(self, Self::ReverseProxy)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ContainerRuntime => "container runtime (docker)",
            Self::Compose => "compose",
            Self::ReverseProxy => "reverse proxy (nginx)",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityStatus {
    /// Binary not installed.
    Absent,
    /// Installed and running.
    Present,
    /// Installed, but its service is missing or not running.
    Broken,
}

impl fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::Broken => "broken",
        })
    }
}

/// Which compose front-end the host has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComposeFlavor {
    /// `docker compose` (v2 plugin).
    Plugin,
    /// `docker-compose` (standalone).
    Standalone,
}

impl ComposeFlavor {
    /// Start of a compose command line for this flavor.
    #[must_use]
    pub fn command(self) -> Cmd {
        match self {
            Self::Plugin => Cmd::new("docker").arg("compose"),
            Self::Standalone => Cmd::new("docker-compose"),
        }
    }
}

/// Looked up through sudo when needed: daemons such as nginx live in
/// `/usr/sbin`, which is not on an ordinary user's PATH.
fn has_binary(remote: &dyn RemoteExecutor, binary: &str) -> Result<bool> {
    let lookup = Script::new(Cmd::new("command").args(["-v", binary]).quiet());
    remote.check(remote.target().elevate(lookup))
}

fn unit_active(remote: &dyn RemoteExecutor, unit: &str) -> Result<bool> {
    remote.check(Script::new(
        Cmd::new("systemctl").args(["is-active", "--quiet", unit]),
    ))
}

fn docker_responds(remote: &dyn RemoteExecutor) -> Result<bool> {
    let info = Cmd::new("docker").arg("info").quiet();
    remote.check(remote.target().elevate(Script::new(info)))
}

/// Detect the compose front-end, preferring the plugin.
pub fn detect_compose(remote: &dyn RemoteExecutor) -> Result<Option<ComposeFlavor>> {
    for flavor in [ComposeFlavor::Plugin, ComposeFlavor::Standalone] {
        let version = flavor.command().arg("version").quiet();
        if remote.check(Script::new(version))? {
            return Ok(Some(flavor));
        }
    }
    Ok(None)
}

/// Classify one capability on the remote host.
pub fn probe(remote: &dyn RemoteExecutor, capability: Capability) -> Result<CapabilityStatus> {
    let status = match capability {
        Capability::ContainerRuntime => probe_runtime(remote)?,
        Capability::Compose => {
            if detect_compose(remote)?.is_some() {
                CapabilityStatus::Present
            } else {
                CapabilityStatus::Absent
            }
        }
        Capability::ReverseProxy => probe_proxy(remote)?,
    };
    debug!(capability = %capability, status = %status, "probe");
    Ok(status)
}

fn probe_runtime(remote: &dyn RemoteExecutor) -> Result<CapabilityStatus> {
    if !has_binary(remote, "docker")? {
        return Ok(CapabilityStatus::Absent);
    }
    // Ask the daemon rather than systemd: it may run without a unit.
    if docker_responds(remote)? {
        Ok(CapabilityStatus::Present)
    } else {
        Ok(CapabilityStatus::Broken)
    }
}

fn probe_proxy(remote: &dyn RemoteExecutor) -> Result<CapabilityStatus> {
    if !has_binary(remote, "nginx")? {
        return Ok(CapabilityStatus::Absent);
    }
    if unit_active(remote, "nginx.service")? {
        return Ok(CapabilityStatus::Present);
    }
    let running = remote.check(Script::new(Cmd::new("pgrep").args(["-x", "nginx"]).quiet()))?;
    Ok(if running {
        CapabilityStatus::Present
    } else {
        CapabilityStatus::Broken
    })
}
