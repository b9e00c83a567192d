//! Building and running the application on the remote host.
//!
//! A Dockerfile deployment keeps one container named after the app.
//! Replacing it stops the old one and renames it to `<app>-previous`
//! so a rollback can bring it back without rebuilding. A compose
//! deployment is a compose project named after the app.

use tracing::{debug, info};

use crate::error::Result;
use crate::manifest::BuildManifest;
use crate::probe::ComposeFlavor;
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

/// Label compose puts on every container of a project.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// `docker inspect` templates.
pub const ID_FORMAT: &str = "{{.Id}}";
pub const IMAGE_FORMAT: &str = "{{.Image}}";
pub const RUNNING_FORMAT: &str = "{{.State.Running}}";
pub const SERVICE_IMAGE_FORMAT: &str =
    "{{index .Config.Labels \"com.docker.compose.service\"}} {{.Image}}";

/// Everything needed to build and run one application.
#[derive(Debug, Clone)]
pub struct Workload {
    pub app: String,
    pub port: u16,
    pub app_dir: String,
    pub manifest: BuildManifest,
    pub compose: ComposeFlavor,
    pub env_file: bool,
    pub systemd_managed: bool,
}

impl Workload {
    #[must_use]
    pub fn new(app: &str, port: u16, app_dir: &str, manifest: BuildManifest) -> Self {
        Self {
            app: app.to_string(),
            port,
            app_dir: app_dir.to_string(),
            manifest,
            compose: ComposeFlavor::Plugin,
            env_file: false,
            systemd_managed: false,
        }
    }

    #[must_use]
    pub const fn compose_flavor(mut self, flavor: ComposeFlavor) -> Self {
        self.compose = flavor;
        self
    }

    #[must_use]
    pub const fn env_file(mut self, present: bool) -> Self {
        self.env_file = present;
        self
    }

    #[must_use]
    pub const fn systemd_managed(mut self, managed: bool) -> Self {
        self.systemd_managed = managed;
        self
    }

    #[must_use]
    pub fn src_dir(&self) -> String {
        format!("{}/src", self.app_dir)
    }

    #[must_use]
    pub fn previous_src_dir(&self) -> String {
        format!("{}/src.previous", self.app_dir)
    }

    #[must_use]
    pub fn state_dir(&self) -> String {
        format!("{}/.trebuchet", self.app_dir)
    }

    /// Present while `src` holds a generation that has not been
    /// verified yet. `src` is only rotated into `src.previous` when it
    /// is absent.
    #[must_use]
    pub fn pending_marker(&self) -> String {
        format!("{}/src.pending", self.state_dir())
    }

    #[must_use]
    pub fn env_path(&self) -> String {
        format!("{}/.env", self.app_dir)
    }

    #[must_use]
    pub fn manifest_path(&self) -> String {
        format!("{}/{}", self.src_dir(), self.manifest.path().display())
    }

    #[must_use]
    pub fn image(&self) -> String {
        format!("{}:latest", self.app)
    }

    #[must_use]
    pub fn previous_image(&self) -> String {
        format!("{}:previous", self.app)
    }

    #[must_use]
    pub fn previous_name(&self) -> String {
        format!("{}-previous", self.app)
    }

    /// Tag under which a compose service's previous image is kept.
    #[must_use]
    pub fn previous_service_image(&self, service: &str) -> String {
        format!("{}-{service}:previous", self.app)
    }

    /// `docker compose -p <app> --project-directory .. -f ..`.
    #[must_use]
    pub fn compose_cmd(&self) -> Cmd {
        let cmd = self.compose.command().args([
            "-p",
            self.app.as_str(),
            "--project-directory",
            &self.src_dir(),
            "-f",
            &self.manifest_path(),
        ]);
        if self.env_file {
            cmd.args(["--env-file", &self.env_path()])
        } else {
            cmd
        }
    }

    #[must_use]
    pub fn build_script(&self) -> Script {
        if self.manifest.is_compose() {
            Script::new(self.compose_cmd().arg("build"))
        } else {
            Script::new(Cmd::new("docker").args([
                "build",
                "-t",
                &self.image(),
                "-f",
                &self.manifest_path(),
                &self.src_dir(),
            ]))
        }
    }

    /// `docker run` for the current image, or `up -d` for compose.
    #[must_use]
    pub fn start_script(&self) -> Script {
        if self.manifest.is_compose() {
            return Script::new(self.compose_cmd().args(["up", "-d", "--remove-orphans"]));
        }
        self.run_image(&self.image())
    }

    /// `docker run` of `image` under the application's name.
    #[must_use]
    pub fn run_image(&self, image: &str) -> Script {
        let restart = if self.systemd_managed {
            "no"
        } else {
            "unless-stopped"
        };
        let mut run = Cmd::new("docker").args([
            "run",
            "-d",
            "--name",
            self.app.as_str(),
            "--restart",
            restart,
            "-p",
            &format!("{0}:{0}", self.port),
        ]);
        if self.env_file {
            run = run.args(["--env-file", &self.env_path()]);
        }
        Script::new(run.arg(image))
    }

    /// Commands the Run step issues, for display.
    #[must_use]
    pub fn run_actions(&self) -> Vec<String> {
        if self.manifest.is_compose() {
            return vec![self.start_script().render()];
        }
        vec![
            retire_previous(self).render(),
            set_aside(self).render(),
            self.start_script().render(),
        ]
    }
}

fn docker(args: &[&str]) -> Cmd {
    Cmd::new("docker").args(args.iter().copied())
}

fn retire_previous(w: &Workload) -> Script {
    Script::new(docker(&["rm", "-f", &w.previous_name()]).quiet()).or_true()
}

fn set_aside(w: &Workload) -> Script {
    Script::new(docker(&["stop", &w.app])).and(docker(&["rename", &w.app, &w.previous_name()]))
}

/// Run a read-only docker query, elevated when needed.
pub fn docker_query(remote: &dyn RemoteExecutor, cmd: Cmd) -> Result<Option<String>> {
    let script = remote.target().elevate(Script::new(cmd));
    remote.query(script)
}

/// Full id of container `name`, if it exists.
pub fn container_id(remote: &dyn RemoteExecutor, name: &str) -> Result<Option<String>> {
    Ok(
        docker_query(remote, docker(&["container", "inspect", "--format", ID_FORMAT, name]))?
            .filter(|id| !id.is_empty()),
    )
}

/// Image id container `name` was created from.
pub fn container_image(remote: &dyn RemoteExecutor, name: &str) -> Result<Option<String>> {
    Ok(
        docker_query(remote, docker(&["container", "inspect", "--format", IMAGE_FORMAT, name]))?
            .filter(|id| !id.is_empty()),
    )
}

/// Ids of every container in the compose project, running or not.
pub fn project_containers(remote: &dyn RemoteExecutor, app: &str) -> Result<Vec<String>> {
    let filter = format!("label={PROJECT_LABEL}={app}");
    let ids = docker_query(remote, docker(&["ps", "-aq", "--filter", &filter]))?;
    Ok(ids
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// `(service, image id)` for every container in the compose project.
pub fn project_service_images(
    remote: &dyn RemoteExecutor,
    app: &str,
) -> Result<Vec<(String, String)>> {
    let mut images = Vec::new();
    for id in project_containers(remote, app)? {
        let line = docker_query(
            remote,
            docker(&["container", "inspect", "--format", SERVICE_IMAGE_FORMAT, &id]),
        )?;
        if let Some((service, image)) = line.as_deref().and_then(|l| l.split_once(' ')) {
            if !service.is_empty() && !images.iter().any(|(s, _)| s == service) {
                images.push((service.to_string(), image.to_string()));
            }
        }
    }
    Ok(images)
}

pub fn build(remote: &dyn RemoteExecutor, w: &Workload) -> Result<()> {
    info!(app = %w.app, manifest = %w.manifest.path().display(), "building");
    remote.run(w.build_script(), &ExecOptions::build())?;
    Ok(())
}

/// Replace the running application with the freshly built one.
pub fn replace(remote: &dyn RemoteExecutor, w: &Workload) -> Result<()> {
    info!(app = %w.app, "starting new version");
    if w.manifest.is_compose() {
        remote.run(w.start_script(), &ExecOptions::install())?;
        return Ok(());
    }

    remote.run(retire_previous(w), &ExecOptions::default())?;
    if container_id(remote, &w.app)?.is_some() {
        debug!(app = %w.app, "setting current container aside");
        remote.run(set_aside(w), &ExecOptions::default())?;
    }
    remote.run(w.start_script(), &ExecOptions::default())?;
    Ok(())
}

/// Whether the application is running. A compose project counts as
/// running when at least one of its containers is.
pub fn is_running(remote: &dyn RemoteExecutor, w: &Workload) -> Result<bool> {
    if w.manifest.is_compose() {
        let filter = format!("label={PROJECT_LABEL}={}", w.app);
        let running = docker_query(
            remote,
            docker(&["ps", "-q", "--filter", &filter, "--filter", "status=running"]),
        )?;
        return Ok(running.is_some_and(|ids| !ids.trim().is_empty()));
    }
    let state = docker_query(
        remote,
        docker(&["container", "inspect", "--format", RUNNING_FORMAT, &w.app]),
    )?;
    Ok(state.as_deref() == Some("true"))
}
