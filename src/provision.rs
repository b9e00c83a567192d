//! Installing and repairing remote capabilities.
//!
//! One strategy per capability:
//!
//! - container runtime: Docker's convenience script from
//!   `get.docker.com` on apt/dnf/yum hosts, the `docker` package on
//!   Alpine
//! - compose: the distribution's compose plugin package, only when the
//!   runtime install did not already bring it
//! - reverse proxy: the `nginx` package
//!
//! A capability whose binary exists but whose service is down is
//! repaired by enabling its systemd unit, or by starting the daemon
//! directly when the host has no such unit.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::probe::{self, Capability, CapabilityStatus};
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

const DOCKER_INSTALL_SCRIPT: &str = "https://get.docker.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Apk,
}

impl PackageManager {
    const ALL: [Self; 4] = [Self::Apt, Self::Dnf, Self::Yum, Self::Apk];

    #[must_use]
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Apk => "apk",
        }
    }

    /// First package manager found on the host.
    pub fn detect(remote: &dyn RemoteExecutor) -> Result<Option<Self>> {
        for pm in Self::ALL {
            let found = Cmd::new("command").args(["-v", pm.binary()]).quiet();
            if remote.check(Script::new(found))? {
                debug!(package_manager = pm.binary(), "detected");
                return Ok(Some(pm));
            }
        }
        Ok(None)
    }

    /// Non-interactive install of `packages`, refreshing indexes first
    /// where the manager needs it.
    #[must_use]
    pub fn install(self, packages: &[&str]) -> Script {
        let install = match self {
            Self::Apt => Cmd::new("apt-get")
                .env("DEBIAN_FRONTEND", "noninteractive")
                .args(["install", "-y", "-q"]),
            Self::Dnf => Cmd::new("dnf").args(["install", "-y", "-q"]),
            Self::Yum => Cmd::new("yum").args(["install", "-y", "-q"]),
            Self::Apk => Cmd::new("apk").args(["add", "--no-cache"]),
        }
        .args(packages.iter().copied());

        match self.refresh() {
            Some(refresh) => Script::new(refresh).and(install),
            None => Script::new(install),
        }
    }

    fn refresh(self) -> Option<Cmd> {
        match self {
            Self::Apt => Some(
                Cmd::new("apt-get")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .args(["update", "-q"]),
            ),
            Self::Apk => Some(Cmd::new("apk").arg("update")),
            Self::Dnf | Self::Yum => None,
        }
    }

    #[must_use]
    pub const fn compose_package(self) -> &'static str {
        match self {
            Self::Apk => "docker-cli-compose",
            Self::Apt | Self::Dnf | Self::Yum => "docker-compose-plugin",
        }
    }
}

/// Script that installs `capability` with the given package manager.
#[must_use]
pub fn install_script(pm: PackageManager, capability: Capability) -> Script {
    match (capability, pm) {
        (Capability::ContainerRuntime, PackageManager::Apk) => pm.install(&["docker"]),
        (Capability::ContainerRuntime, _) => Script::new(
            Cmd::new("curl").args(["-fsSL", DOCKER_INSTALL_SCRIPT, "-o", "/tmp/get-docker.sh"]),
        )
        .and(Cmd::new("sh").arg("/tmp/get-docker.sh"))
        .then(Cmd::new("rm").args(["-f", "/tmp/get-docker.sh"])),
        (Capability::Compose, _) => pm.install(&[pm.compose_package()]),
        (Capability::ReverseProxy, _) => pm.install(&["nginx"]),
    }
}

/// Script that brings an installed but stopped capability up.
#[must_use]
pub fn repair_script(capability: Capability, has_unit: bool) -> Option<Script> {
    let unit = capability.service_unit()?;
    if has_unit {
        return Some(Script::new(
            Cmd::new("systemctl").args(["enable", "--now", unit]),
        ));
    }
    let direct = match capability {
        Capability::ContainerRuntime => Cmd::new("setsid").args(["-f", "dockerd"]).quiet(),
        Capability::ReverseProxy => Cmd::new("nginx"),
        Capability::Compose => return None,
    };
    Some(Script::new(direct))
}

/// Idempotently brings capabilities to [`CapabilityStatus::Present`].
#[derive(Debug, Clone)]
pub struct Provisioner {
    force_reinstall: bool,
    settle_attempts: u32,
    settle_interval: Duration,
}

impl Default for Provisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            force_reinstall: false,
            settle_attempts: 5,
            settle_interval: Duration::from_secs(2),
        }
    }

    /// Reinstall the container runtime even when it is present.
    #[must_use]
    pub const fn force_reinstall(mut self, force: bool) -> Self {
        self.force_reinstall = force;
        self
    }

    /// How long to wait for a freshly started daemon.
    #[must_use]
    pub const fn settle(mut self, attempts: u32, interval: Duration) -> Self {
        self.settle_attempts = attempts;
        self.settle_interval = interval;
        self
    }

    /// Make sure `capability` is present and running.
    ///
    /// Returns immediately when it already is. Otherwise installs
    /// (absent) or repairs (broken) it and probes again.
    pub fn ensure(
        &self,
        remote: &dyn RemoteExecutor,
        capability: Capability,
    ) -> Result<CapabilityStatus> {
        let mut status = probe::probe(remote, capability)?;
        let forced = self.force_reinstall && capability == Capability::ContainerRuntime;

        if status == CapabilityStatus::Present && !forced {
            return Ok(status);
        }

        if status == CapabilityStatus::Absent || forced {
            info!(capability = %capability, "installing");
            install(remote, capability)?;
            status = self.wait_present(remote, capability)?;
        }

        if status == CapabilityStatus::Broken {
            warn!(capability = %capability, "installed but not running, repairing");
            repair(remote, capability)?;
            status = self.wait_present(remote, capability)?;
        }

        if status == CapabilityStatus::Present {
            info!(capability = %capability, "ready");
            Ok(status)
        } else {
            Err(DeployError::CapabilityMissing {
                capability: capability.to_string(),
                detail: format!("still {status} after provisioning"),
            })
        }
    }

    fn wait_present(
        &self,
        remote: &dyn RemoteExecutor,
        capability: Capability,
    ) -> Result<CapabilityStatus> {
        let mut status = probe::probe(remote, capability)?;
        for _ in 1..self.settle_attempts {
            if status != CapabilityStatus::Broken {
                break;
            }
            thread::sleep(self.settle_interval);
            status = probe::probe(remote, capability)?;
        }
        Ok(status)
    }
}

/// Install `curl` if the host lacks it. The runtime install
/// downloads with it.
pub fn ensure_curl(remote: &dyn RemoteExecutor) -> Result<()> {
    let found = Cmd::new("command").args(["-v", "curl"]).quiet();
    if remote.check(Script::new(found))? {
        return Ok(());
    }
    let pm = package_manager(remote, "curl")?;
    remote
        .run(pm.install(&["curl"]), &ExecOptions::install())
        .map(drop)
}

fn package_manager(remote: &dyn RemoteExecutor, what: &str) -> Result<PackageManager> {
    PackageManager::detect(remote)?.ok_or_else(|| DeployError::CapabilityMissing {
        capability: what.to_string(),
        detail: "no supported package manager (apt-get, dnf, yum, apk)".into(),
    })
}

fn install(remote: &dyn RemoteExecutor, capability: Capability) -> Result<()> {
    let pm = package_manager(remote, &capability.to_string())?;
    if capability == Capability::ContainerRuntime && pm != PackageManager::Apk {
        ensure_curl(remote)?;
    }
    remote
        .run(install_script(pm, capability), &ExecOptions::install())
        .map(drop)
        .map_err(|e| install_failed(capability, e))
}

fn repair(remote: &dyn RemoteExecutor, capability: Capability) -> Result<()> {
    let has_unit = match capability.service_unit() {
        Some(unit) => remote.check(Script::new(
            Cmd::new("systemctl").args(["cat", unit]).quiet(),
        ))?,
        None => false,
    };
    let Some(script) = repair_script(capability, has_unit) else {
        return Ok(());
    };
    remote
        .run(script, &ExecOptions::install())
        .map(drop)
        .map_err(|e| install_failed(capability, e))
}

fn install_failed(capability: Capability, e: DeployError) -> DeployError {
    if e.is_transient() {
        return e;
    }
    DeployError::CapabilityMissing {
        capability: capability.to_string(),
        detail: e.to_string(),
    }
}
