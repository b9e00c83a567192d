//! Snapshot and rollback.
//!
//! Before the Run step replaces the running application, the pipeline
//! records what was serving: the old container (set aside as
//! `<app>-previous`), its image (tagged `<app>:previous`), before the
//! proxy step the old nginx config (copied aside) and the default site,
//! and before the service step the old systemd unit. The record is
//! written to `<app-dir>/.trebuchet/snapshot.json` so `--rollback` can
//! use it from a later run. Only one prior generation is kept.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::compose;
use crate::container::{self, Workload};
use crate::error::{DeployError, Result};
use crate::manifest::BuildManifest;
use crate::probe::ComposeFlavor;
use crate::proxy::{self, DefaultSite, NginxLayout};
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};
use crate::systemd::{self, UnitRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Taken during a deployment that has not finished.
    Pending,
    /// The deployment it guarded succeeded; kept for `--rollback`.
    Committed,
}

/// Previous image of one compose service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceImage {
    pub service: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub app: String,
    pub app_dir: String,
    pub port: u16,
    pub manifest: BuildManifest,
    pub compose_flavor: ComposeFlavor,
    pub env_file: bool,
    pub systemd_managed: bool,
    /// Tag pointing at the image the old container ran.
    pub previous_image_ref: Option<String>,
    pub previous_container_id: Option<String>,
    #[serde(default)]
    pub previous_services: Vec<ServiceImage>,
    /// Whether `src.previous` holds the old source tree.
    pub previous_source: bool,
    /// Copy of the nginx config that was live, if there was one.
    pub previous_proxy_config_path: Option<String>,
    pub proxy_config_path: Option<String>,
    pub proxy_enabled_link: Option<String>,
    /// Default nginx site the proxy step removes.
    #[serde(default)]
    pub default_site: Option<DefaultSite>,
    #[serde(default)]
    pub service_unit: Option<UnitRecord>,
    pub timestamp: DateTime<Utc>,
    pub state: SnapshotState,
}

impl Snapshot {
    /// Whether anything was deployed before this snapshot.
    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.previous_container_id.is_some() || !self.previous_services.is_empty()
    }

    #[must_use]
    pub fn workload(&self) -> Workload {
        Workload::new(&self.app, self.port, &self.app_dir, self.manifest.clone())
            .compose_flavor(self.compose_flavor)
            .env_file(self.env_file)
            .systemd_managed(self.systemd_managed)
    }

    #[must_use]
    fn override_path(&self) -> String {
        format!("{}/rollback.override.yml", self.workload().state_dir())
    }
}

/// Where snapshots live on the host.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: String,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(app_dir: &str) -> Self {
        Self {
            path: format!("{app_dir}/.trebuchet/snapshot.json"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn load(&self, remote: &dyn RemoteExecutor) -> Result<Option<Snapshot>> {
        let Some(content) = remote.query(Script::new(Cmd::new("cat").arg(&self.path)))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, remote: &dyn RemoteExecutor, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        remote.write_file(&json, &self.path)
    }

    pub fn clear(&self, remote: &dyn RemoteExecutor) -> Result<()> {
        remote.run(
            Script::new(Cmd::new("rm").args(["-f", &self.path])),
            &ExecOptions::default(),
        )?;
        Ok(())
    }
}

fn docker(args: &[&str]) -> Script {
    Script::new(Cmd::new("docker").args(args.iter().copied()))
}

/// Record what is serving now, before the Run step replaces it.
pub fn capture(remote: &dyn RemoteExecutor, w: &Workload) -> Result<Snapshot> {
    let mut snapshot = Snapshot {
        app: w.app.clone(),
        app_dir: w.app_dir.clone(),
        port: w.port,
        manifest: w.manifest.clone(),
        compose_flavor: w.compose,
        env_file: w.env_file,
        systemd_managed: w.systemd_managed,
        previous_image_ref: None,
        previous_container_id: None,
        previous_services: Vec::new(),
        previous_source: remote.check(Script::new(
            Cmd::new("test").args(["-d", &w.previous_src_dir()]),
        ))?,
        previous_proxy_config_path: None,
        proxy_config_path: None,
        proxy_enabled_link: None,
        default_site: None,
        service_unit: None,
        timestamp: Utc::now(),
        state: SnapshotState::Pending,
    };

    if w.manifest.is_compose() {
        for (service, image) in container::project_service_images(remote, &w.app)? {
            let tag = w.previous_service_image(&service);
            remote.run(docker(&["tag", &image, &tag]), &ExecOptions::default())?;
            snapshot.previous_services.push(ServiceImage {
                service,
                image: tag,
            });
        }
    } else if let Some(id) = container::container_id(remote, &w.app)? {
        if let Some(image) = container::container_image(remote, &w.app)? {
            let tag = w.previous_image();
            remote.run(docker(&["tag", &image, &tag]), &ExecOptions::default())?;
            snapshot.previous_image_ref = Some(tag);
        }
        snapshot.previous_container_id = Some(id);
    }

    info!(
        app = %w.app,
        previous = snapshot.has_previous(),
        "snapshot taken"
    );
    Ok(snapshot)
}

/// Record the proxy config and the default site before the
/// ProxyConfigure step rewrites them.
pub fn capture_proxy(
    remote: &dyn RemoteExecutor,
    snapshot: &mut Snapshot,
    layout: NginxLayout,
) -> Result<()> {
    let config_path = layout.config_path(&snapshot.app);
    let had_config = proxy::backup(remote, &config_path)?;
    snapshot.previous_proxy_config_path = had_config.then(|| proxy::backup_path(&config_path));
    snapshot.proxy_enabled_link = layout.enabled_link(&snapshot.app);
    snapshot.proxy_config_path = Some(config_path);
    snapshot.default_site = proxy::capture_default_site(remote, layout)?;
    Ok(())
}

/// Record the service unit before the ServiceInstall step writes it.
pub fn capture_unit(remote: &dyn RemoteExecutor, snapshot: &mut Snapshot, unit: &str) -> Result<()> {
    snapshot.service_unit = Some(systemd::capture(remote, unit)?);
    Ok(())
}

/// Restore the state recorded in `snapshot`.
///
/// Any failure is returned as [`DeployError::Rollback`]: the host may
/// be half-restored and is never touched again automatically.
pub fn rollback(remote: &dyn RemoteExecutor, snapshot: &Snapshot) -> Result<()> {
    warn!(app = %snapshot.app, "rolling back");
    restore(remote, snapshot).map_err(|e| match e {
        DeployError::Rollback(_) => e,
        other => DeployError::Rollback(other.to_string()),
    })
}

fn restore(remote: &dyn RemoteExecutor, snapshot: &Snapshot) -> Result<()> {
    let w = snapshot.workload();

    if snapshot.previous_source {
        let swap = Script::new(Cmd::new("rm").args(["-rf", &w.src_dir()]))
            .and(Cmd::new("mv").args([w.previous_src_dir().as_str(), &w.src_dir()]))
            .and(Cmd::new("rm").args(["-f", &w.pending_marker()]));
        remote.run(swap, &ExecOptions::default())?;
    }

    // The unit may restart the container; put it back before the
    // container is swapped.
    if let Some(unit) = &snapshot.service_unit {
        systemd::restore(remote, unit)?;
    }

    if w.manifest.is_compose() {
        restore_compose(remote, snapshot, &w)?;
    } else {
        restore_container(remote, snapshot, &w)?;
    }

    if let Some(path) = &snapshot.proxy_config_path {
        proxy::restore(
            remote,
            path,
            snapshot.proxy_enabled_link.as_deref(),
            snapshot.previous_proxy_config_path.is_some(),
            snapshot.default_site.as_ref(),
        )?;
    }

    if snapshot.has_previous() && !container::is_running(remote, &w)? {
        return Err(DeployError::Rollback(format!(
            "{} is not running after restore",
            snapshot.app
        )));
    }
    info!(app = %snapshot.app, "previous deployment restored");
    Ok(())
}

fn restore_container(remote: &dyn RemoteExecutor, snapshot: &Snapshot, w: &Workload) -> Result<()> {
    let current = container::container_id(remote, &w.app)?;
    let opts = ExecOptions::default();

    let Some(previous) = &snapshot.previous_container_id else {
        // First deployment: nothing to go back to but an empty host.
        if current.is_some() {
            remote.run(docker(&["rm", "-f", &w.app]), &opts)?;
        }
        return Ok(());
    };

    if current.as_ref() == Some(previous) {
        remote.run(docker(&["start", &w.app]), &opts)?;
        return Ok(());
    }

    if current.is_some() {
        remote.run(docker(&["rm", "-f", &w.app]), &opts)?;
    }
    if container::container_id(remote, &w.previous_name())?.is_some() {
        let revive = docker(&["rename", &w.previous_name(), &w.app])
            .and(Cmd::new("docker").args(["start", w.app.as_str()]));
        remote.run(revive, &opts)?;
        return Ok(());
    }

    // The set-aside container is gone; recreate it from its image.
    let Some(image) = &snapshot.previous_image_ref else {
        return Err(DeployError::Rollback(format!(
            "neither {} nor its image survive",
            w.previous_name()
        )));
    };
    remote.run(w.run_image(image), &opts)?;
    Ok(())
}

fn restore_compose(remote: &dyn RemoteExecutor, snapshot: &Snapshot, w: &Workload) -> Result<()> {
    let opts = ExecOptions::install();

    if snapshot.previous_services.is_empty() {
        remote.run(
            Script::new(w.compose_cmd().args(["down", "--remove-orphans"])),
            &opts,
        )?;
        return Ok(());
    }

    let images: IndexMap<String, String> = snapshot
        .previous_services
        .iter()
        .map(|s| (s.service.clone(), s.image.clone()))
        .collect();
    let path = snapshot.override_path();
    remote.write_file(compose::render_override(&images)?.as_bytes(), &path)?;

    let up = w
        .compose_cmd()
        .args(["-f", path.as_str(), "up", "-d", "--no-build", "--remove-orphans"]);
    remote.run(Script::new(up), &opts)?;
    Ok(())
}
