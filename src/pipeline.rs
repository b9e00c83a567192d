//! The deploy step machine.
//!
//! [`Pipeline::deploy`] walks [`Step::ALL`] in order. A step that
//! fails stops the run; if a snapshot was taken by then the previous
//! deployment is restored and the run ends `RolledBack`, otherwise it
//! ends `Aborted`. Only transient errors are retried, per the step's
//! [`RetryPolicy`](crate::plan::RetryPolicy).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::ValidConfig;
use crate::container::{self, Workload};
use crate::error::{DeployError, Result};
use crate::health;
use crate::lock::{self, DeployLock};
use crate::manifest::{self, BuildManifest, COMPOSE_NAMES, DOCKERFILE_NAMES};
use crate::plan::{
    DeployPlan, DeployResult, DeployStatus, MachineState, PlannedFile, Step, StepRecord,
    StepResult,
};
use crate::probe::{self, Capability, ComposeFlavor};
use crate::provision::{self, Provisioner};
use crate::proxy::{self, NginxLayout, NginxSite};
use crate::repo::{GitStage, SourceStage, redact_url};
use crate::shell::{Cmd, Script};
use crate::snapshot::{self, Snapshot, SnapshotState, SnapshotStore};
use crate::ssh::{ExecOptions, RemoteExecutor};
use crate::systemd;
use crate::transfer::{FileTransfer, TarTransfer};

/// Set from outside to stop a deployment before its next step.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trigger on the first Ctrl-C; exit on the second.
    pub fn install_ctrl_c(&self) -> Result<()> {
        let signal = self.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        thread::Builder::new()
            .name("ctrl-c".into())
            .spawn(move || {
                runtime.block_on(async {
                    while tokio::signal::ctrl_c().await.is_ok() {
                        if signal.is_set() {
                            eprintln!("Interrupted again, exiting");
                            std::process::exit(130);
                        }
                        eprintln!(
                            "Interrupted: stopping after the current step \
                             (press Ctrl-C again to exit immediately)"
                        );
                        signal.trigger();
                    }
                });
            })?;
        Ok(())
    }
}

/// Deployment of one application to one host.
pub struct Pipeline {
    config: ValidConfig,
    stage: Box<dyn SourceStage>,
    transfer: Box<dyn FileTransfer>,
    provisioner: Provisioner,
    abort: AbortSignal,
    log_reference: Option<String>,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: ValidConfig) -> Self {
        let stage = GitStage::new(&config.staging_dir);
        let provisioner = Provisioner::new().force_reinstall(config.install_docker);
        Self {
            config,
            stage: Box::new(stage),
            transfer: Box::new(TarTransfer::new()),
            provisioner,
            abort: AbortSignal::new(),
            log_reference: None,
        }
    }

    #[must_use]
    pub fn stage(mut self, stage: impl SourceStage + 'static) -> Self {
        self.stage = Box::new(stage);
        self
    }

    #[must_use]
    pub fn transfer(mut self, transfer: impl FileTransfer + 'static) -> Self {
        self.transfer = Box::new(transfer);
        self
    }

    #[must_use]
    pub const fn provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    #[must_use]
    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Where the structured log of this run goes, reported in the result.
    #[must_use]
    pub fn log_reference(mut self, reference: &str) -> Self {
        self.log_reference = Some(reference.to_string());
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ValidConfig {
        &self.config
    }

    /// Run every step against `remote`.
    pub fn deploy(&self, remote: &dyn RemoteExecutor) -> DeployResult {
        let mut run = RunState::new(remote);
        let mut records = Vec::new();
        let mut state = MachineState::Validate;
        let mut failure = None;

        for step in Step::ALL {
            if self.abort.is_set() {
                warn!(step = %step, "abort requested");
                records.push(StepRecord {
                    step,
                    result: StepResult::Failed(DeployError::Aborted.to_string()),
                    attempts: 0,
                    elapsed_ms: 0,
                });
                failure = Some((step, DeployError::Aborted));
                break;
            }

            let started = Instant::now();
            let (outcome, attempts) = self.attempt(step, &mut run, state);
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(result) => {
                    state = step.reached();
                    info!(
                        step = %step,
                        result = %result,
                        attempts,
                        elapsed_ms,
                        state = ?state,
                        "step finished"
                    );
                    records.push(StepRecord {
                        step,
                        result,
                        attempts,
                        elapsed_ms,
                    });
                }
                Err(e) => {
                    error!(step = %step, attempts, elapsed_ms, error = %e, "step failed");
                    records.push(StepRecord {
                        step,
                        result: StepResult::Failed(e.to_string()),
                        attempts,
                        elapsed_ms,
                    });
                    failure = Some((step, e));
                    break;
                }
            }
        }

        self.finish(run, records, state, failure)
    }

    fn attempt(
        &self,
        step: Step,
        run: &mut RunState<'_>,
        state: MachineState,
    ) -> (Result<StepResult>, u32) {
        let policy = step.retry_policy();
        let mut attempt = 1;
        loop {
            info!(step = %step, attempt, state = ?state, "step started");
            match self.execute(step, run) {
                Err(e) if e.is_transient() && attempt < policy.attempts && !self.abort.is_set() => {
                    warn!(step = %step, attempt, error = %e, "transient failure, retrying");
                    thread::sleep(policy.backoff);
                    attempt += 1;
                }
                outcome => return (outcome.map_err(|e| e.in_step(step)), attempt),
            }
        }
    }

    fn execute(&self, step: Step, run: &mut RunState<'_>) -> Result<StepResult> {
        if step.is_destructive() {
            self.record(step, run)?;
        }
        match step {
            Step::Validate => self.validate(),
            Step::Stage => self.stage_source(run),
            Step::VerifyBuildFiles => self.verify_build_files(run),
            Step::Connect => self.connect(run),
            Step::Provision => self.provision(run),
            Step::Transfer => self.transfer_source(run),
            Step::Build => {
                container::build(run.remote, &self.workload(run)?)?;
                Ok(StepResult::Success)
            }
            Step::Run => self.replace(run),
            Step::HealthCheck => self.health_check(run),
            Step::ProxyConfigure => self.configure_proxy(run),
            Step::ServiceInstall => self.install_service(run),
            Step::Verify => self.verify(run),
        }
    }

    fn validate(&self) -> Result<StepResult> {
        if self.config.repository.is_none() {
            return Err(DeployError::Validation {
                field: "repo",
                reason: "a repository is required to deploy".into(),
            });
        }
        Ok(StepResult::Success)
    }

    fn stage_source(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        let url = self.repository()?;
        let dir = self
            .stage
            .stage(url, &self.config.credential, &self.config.branch)?;
        run.source = Some(dir);
        Ok(StepResult::Success)
    }

    fn verify_build_files(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        let source = run.source()?;
        let found = manifest::detect(source, self.config.compose_file.as_deref())?;
        info!(manifest = %found.path().display(), "build manifest found");
        run.manifest = Some(found);
        Ok(StepResult::Success)
    }

    fn connect(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        // Also proves sudo works without a password for non-root users.
        run.remote
            .run(Script::new(Cmd::new("true")), &ExecOptions::probe())?;
        if run.lock.is_none() {
            run.lock = Some(DeployLock::acquire(
                run.remote,
                &self.config.app_dir,
                &self.config.app_name,
                self.config.force_unlock,
            )?);
        }
        Ok(StepResult::Success)
    }

    fn provision(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        if let Err(e) = provision::ensure_curl(run.remote) {
            if e.is_transient() {
                return Err(e);
            }
            run.warn(format!("could not install curl, HTTP checks may be skipped: {e}"));
        }

        for capability in capabilities(run.manifest()?) {
            if let Err(e) = self.provisioner.ensure(run.remote, capability) {
                if capability.is_mandatory() || e.is_transient() {
                    return Err(e);
                }
                run.warn(format!("{capability} unavailable, continuing without it: {e}"));
                continue;
            }
            match capability {
                Capability::Compose => {
                    run.compose = probe::detect_compose(run.remote)?.ok_or_else(|| {
                        DeployError::CapabilityMissing {
                            capability: Capability::Compose.to_string(),
                            detail: "neither `docker compose` nor `docker-compose` responds"
                                .into(),
                        }
                    })?;
                }
                Capability::ReverseProxy => run.proxy_ready = true,
                Capability::ContainerRuntime => {}
            }
        }
        Ok(StepResult::Success)
    }

    fn transfer_source(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        let w = self.workload(run)?;
        let remote = run.remote;
        let opts = ExecOptions::default();

        remote.run(
            Script::new(Cmd::new("mkdir").args(["-p", w.app_dir.as_str(), &w.state_dir()])),
            &opts,
        )?;

        let pending = remote.check(Script::new(Cmd::new("test").args(["-e", &w.pending_marker()])))?;
        let has_src = remote.check(Script::new(Cmd::new("test").args(["-d", &w.src_dir()])))?;
        if has_src && !pending {
            let rotate = Script::new(Cmd::new("rm").args(["-rf", &w.previous_src_dir()]))
                .and(Cmd::new("mv").args([w.src_dir().as_str(), &w.previous_src_dir()]));
            remote.run(rotate, &opts)?;
            // A committed snapshot refers to the source just rotated out.
            SnapshotStore::new(&w.app_dir).clear(remote)?;
        }

        self.transfer
            .transfer(remote, run.source()?, &w.src_dir())?;
        remote.run(
            Script::new(Cmd::new("touch").arg(w.pending_marker())),
            &opts,
        )?;

        if let Some(env_file) = &self.config.env_file {
            let content = std::fs::read(env_file)?;
            let path = w.env_path();
            remote.run(
                Script::new(Cmd::new("touch").arg(&path)).and(Cmd::new("chmod").args(["600", &path])),
                &opts,
            )?;
            remote.write_file(&content, &path)?;
            info!(path = %path, "environment file uploaded");
        }
        Ok(StepResult::Success)
    }

    /// Extend the snapshot with what `step` is about to replace, and
    /// persist it before the step touches anything.
    fn record(&self, step: Step, run: &mut RunState<'_>) -> Result<()> {
        let remote = run.remote;
        match step {
            Step::Run => {
                let w = self.workload(run)?;
                run.snapshot = Some(snapshot::capture(remote, &w)?);
            }
            Step::ProxyConfigure if run.proxy_ready => {
                if let Some(snapshot) = run.snapshot.as_mut() {
                    snapshot::capture_proxy(remote, snapshot, NginxLayout::detect(remote)?)?;
                }
            }
            Step::ServiceInstall => {
                if let (Some(unit), Some(snapshot)) =
                    (&self.config.systemd_service, run.snapshot.as_mut())
                {
                    snapshot::capture_unit(remote, snapshot, unit)?;
                }
            }
            _ => return Ok(()),
        }
        if let Some(snapshot) = &run.snapshot {
            SnapshotStore::new(&self.config.app_dir).save(remote, snapshot)?;
        }
        Ok(())
    }

    fn replace(&self, run: &RunState<'_>) -> Result<StepResult> {
        container::replace(run.remote, &self.workload(run)?)?;
        Ok(StepResult::Success)
    }

    fn health_check(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        let w = self.workload(run)?;
        let report = health::check(run.remote, &w, &self.config.health)?;
        if let Some(warning) = report.warning {
            run.warn(warning);
        }
        Ok(StepResult::Success)
    }

    fn site(&self) -> NginxSite {
        let site = NginxSite::new(&self.config.app_name, self.config.app_port);
        match &self.config.domain {
            Some(domain) => site.server_name(domain),
            None => site,
        }
    }

    fn configure_proxy(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        if !run.proxy_ready {
            return Ok(StepResult::Skipped);
        }
        let layout = NginxLayout::detect(run.remote)?;
        let installed = proxy::configure(run.remote, &self.site(), layout)?;
        for warning in installed.warnings {
            run.warn(warning);
        }
        run.proxy_configured = true;
        Ok(StepResult::Success)
    }

    fn install_service(&self, run: &RunState<'_>) -> Result<StepResult> {
        let Some(unit) = &self.config.systemd_service else {
            return Ok(StepResult::Skipped);
        };
        systemd::install(run.remote, unit, &self.workload(run)?)?;
        Ok(StepResult::Success)
    }

    /// End-to-end check through the proxy, or the published port when
    /// there is no proxy. Commits the snapshot on success.
    fn verify(&self, run: &mut RunState<'_>) -> Result<StepResult> {
        let w = self.workload(run)?;
        let failed = |reason: String| DeployError::HealthCheckFailed {
            app: w.app.clone(),
            reason,
        };

        if !container::is_running(run.remote, &w)? {
            return Err(failed("not running at final verification".into()));
        }

        let path = &self.config.health.path;
        let (url, host) = if run.proxy_configured {
            (format!("http://127.0.0.1{path}"), self.config.domain.as_deref())
        } else {
            (format!("http://127.0.0.1:{}{path}", w.port), None)
        };

        match health::http_status(run.remote, &url, host) {
            Ok(Some(code @ 502..=504)) => {
                return Err(failed(format!("{url} answered {code} through the proxy")));
            }
            Ok(Some(code)) => info!(url = %url, status = code, "verified"),
            Ok(None) if run.proxy_configured => {
                return Err(failed(format!("no answer from {url}")));
            }
            Ok(None) => run.warn(format!("{url} did not answer; verified running state only")),
            Err(DeployError::CapabilityMissing { .. }) => {
                run.warn("curl unavailable, verified running state only".into());
            }
            Err(e) => return Err(e),
        }

        if let Some(snapshot) = run.snapshot.as_mut() {
            snapshot.state = SnapshotState::Committed;
            SnapshotStore::new(&w.app_dir).save(run.remote, snapshot)?;
        }
        run.remote.run(
            Script::new(Cmd::new("rm").args(["-f", &w.pending_marker()])),
            &ExecOptions::default(),
        )?;
        Ok(StepResult::Success)
    }

    fn finish(
        &self,
        mut run: RunState<'_>,
        steps: Vec<StepRecord>,
        state: MachineState,
        failure: Option<(Step, DeployError)>,
    ) -> DeployResult {
        let mut result = DeployResult {
            status: DeployStatus::Success,
            failed_step: None,
            final_state: state,
            steps,
            warnings: Vec::new(),
            error: None,
            hint: None,
            log_reference: self.log_reference.clone(),
            rolled_back: false,
        };

        if let Some((step, e)) = failure {
            result.status = DeployStatus::Failed;
            result.failed_step = Some(step);
            result.final_state = MachineState::Aborted;
            let mut cause = e;
            let mut message = cause.to_string();

            if let Some(snapshot) = run.snapshot.take() {
                match self.restore(run.remote, &snapshot) {
                    Ok(()) => {
                        result.final_state = MachineState::RolledBack;
                        result.rolled_back = true;
                    }
                    Err(rollback) => {
                        error!(error = %rollback, "rollback failed");
                        message = format!("{message}; {rollback}");
                        cause = rollback;
                    }
                }
            }
            result.error = Some(message);
            result.hint = Some(cause.hint().to_string());
        }

        if let Some(lock) = run.lock.take() {
            if let Err(e) = lock.release() {
                run.warn(format!("could not release deploy lock: {e}"));
            }
        }
        result.warnings = run.warnings;
        info!(
            status = ?result.status,
            final_state = ?result.final_state,
            failed_step = ?result.failed_step,
            "deployment finished"
        );
        result
    }

    fn restore(&self, remote: &dyn RemoteExecutor, snapshot: &Snapshot) -> Result<()> {
        snapshot::rollback(remote, snapshot)?;
        if let Err(e) = SnapshotStore::new(&self.config.app_dir).clear(remote) {
            warn!(error = %e, "could not remove used snapshot");
        }
        Ok(())
    }

    /// Restore the snapshot left on the host by the last deployment.
    pub fn rollback(&self, remote: &dyn RemoteExecutor) -> Result<Snapshot> {
        let lock = DeployLock::acquire(
            remote,
            &self.config.app_dir,
            &self.config.app_name,
            self.config.force_unlock,
        )?;
        let store = SnapshotStore::new(&self.config.app_dir);
        let snapshot = store
            .load(remote)?
            .ok_or_else(|| DeployError::NoSnapshot(format!("{}:{}", remote.target(), store.path())))?;

        info!(taken = %snapshot.timestamp, state = ?snapshot.state, "restoring snapshot");
        snapshot::rollback(remote, &snapshot)?;
        store.clear(remote)?;
        lock.release()?;
        Ok(snapshot)
    }

    /// What [`deploy`](Self::deploy) would do, without doing any of it.
    ///
    /// Nothing is fetched, so the build manifest is assumed: the
    /// configured compose file, else a Dockerfile.
    #[must_use]
    pub fn plan(&self) -> DeployPlan {
        let c = &self.config;
        let manifest = c.compose_file.as_ref().map_or_else(
            || BuildManifest::Dockerfile {
                path: PathBuf::from(DOCKERFILE_NAMES[0]),
            },
            |path| BuildManifest::Compose {
                path: path.clone(),
                services: Vec::new(),
            },
        );
        let w = self.workload_for(manifest, ComposeFlavor::Plugin);
        let layout = NginxLayout::SitesEnabled;
        let site = self.site();
        let mut plan = DeployPlan::default();

        plan.push(Step::Validate, vec![format!("deploy {} to {}", c.app_name, c.target)]);
        match &c.repository {
            Some(url) => plan.push(
                Step::Stage,
                vec![
                    format!("clone or fetch {} into {}", redact_url(url), c.staging_dir.display()),
                    format!("check out {} and fast-forward", c.branch),
                ],
            ),
            None => plan.skip(Step::Stage, "no repository"),
        }
        let searched = c.compose_file.as_ref().map_or_else(
            || {
                COMPOSE_NAMES
                    .iter()
                    .chain(DOCKERFILE_NAMES.iter())
                    .copied()
                    .collect::<Vec<_>>()
                    .join(", ")
            },
            |path| path.display().to_string(),
        );
        plan.push(Step::VerifyBuildFiles, vec![format!("look for {searched}")]);
        plan.push(
            Step::Connect,
            vec![
                format!("ssh {} (port {})", c.target.destination(), c.target.port),
                format!("mkdir {}", lock::lock_dir(&c.app_dir)),
            ],
        );

        let provision = capabilities(&w.manifest)
            .into_iter()
            .map(|capability| {
                let note = if !capability.is_mandatory() {
                    " (optional)"
                } else if capability == Capability::ContainerRuntime && c.install_docker {
                    " (reinstall)"
                } else {
                    ""
                };
                format!("ensure {capability}{note}")
            })
            .collect();
        plan.push(Step::Provision, provision);

        let mut transfer = vec![
            format!("mkdir -p {} {}", w.app_dir, w.state_dir()),
            format!("move {} to {}", w.src_dir(), w.previous_src_dir()),
            format!("upload source archive to {}", w.src_dir()),
        ];
        if c.env_file.is_some() {
            transfer.push(format!("upload environment file to {} (mode 600)", w.env_path()));
        }
        plan.push(Step::Transfer, transfer);
        plan.push(Step::Build, vec![w.build_script().render()]);

        let mut run = vec![format!(
            "record snapshot in {}",
            SnapshotStore::new(&w.app_dir).path()
        )];
        run.extend(w.run_actions());
        plan.push(Step::Run, run);

        plan.push(
            Step::HealthCheck,
            vec![format!(
                "poll http://127.0.0.1:{}{} up to {} times",
                w.port, c.health.path, c.health.attempts
            )],
        );
        plan.push(Step::ProxyConfigure, proxy::actions(&site, layout));
        match &c.systemd_service {
            Some(unit) => plan.push(Step::ServiceInstall, systemd::actions(unit)),
            None => plan.skip(Step::ServiceInstall, "no --systemd-service"),
        }
        plan.push(
            Step::Verify,
            vec![
                format!("GET http://127.0.0.1{} through the proxy", c.health.path),
                "commit snapshot".to_string(),
            ],
        );

        plan.files.push(PlannedFile {
            path: layout.config_path(&c.app_name),
            content: site.render(),
        });
        if let Some(unit) = &c.systemd_service {
            plan.files.push(PlannedFile {
                path: systemd::unit_path(unit),
                content: systemd::render_unit(&w),
            });
        }
        plan
    }

    fn repository(&self) -> Result<&str> {
        self.config
            .repository
            .as_deref()
            .ok_or_else(|| DeployError::Validation {
                field: "repo",
                reason: "a repository is required to deploy".into(),
            })
    }

    fn workload(&self, run: &RunState<'_>) -> Result<Workload> {
        Ok(self.workload_for(run.manifest()?.clone(), run.compose))
    }

    fn workload_for(&self, manifest: BuildManifest, compose: ComposeFlavor) -> Workload {
        let c = &self.config;
        Workload::new(&c.app_name, c.app_port, &c.app_dir, manifest)
            .compose_flavor(compose)
            .env_file(c.env_file.is_some())
            .systemd_managed(c.systemd_service.is_some())
    }
}

/// Capabilities the Provision step ensures, in order.
fn capabilities(manifest: &BuildManifest) -> Vec<Capability> {
    let mut needed = vec![Capability::ContainerRuntime];
    if manifest.is_compose() {
        needed.push(Capability::Compose);
    }
    needed.push(Capability::ReverseProxy);
    needed
}

/// What one run has learned and holds so far.
struct RunState<'a> {
    remote: &'a dyn RemoteExecutor,
    source: Option<PathBuf>,
    manifest: Option<BuildManifest>,
    compose: ComposeFlavor,
    lock: Option<DeployLock<'a>>,
    snapshot: Option<Snapshot>,
    proxy_ready: bool,
    proxy_configured: bool,
    warnings: Vec<String>,
}

impl<'a> RunState<'a> {
    fn new(remote: &'a dyn RemoteExecutor) -> Self {
        Self {
            remote,
            source: None,
            manifest: None,
            compose: ComposeFlavor::Plugin,
            lock: None,
            snapshot: None,
            proxy_ready: false,
            proxy_configured: false,
            warnings: Vec::new(),
        }
    }

    fn source(&self) -> Result<&Path> {
        self.source
            .as_deref()
            .ok_or_else(|| DeployError::Other("source has not been staged".into()))
    }

    fn manifest(&self) -> Result<&BuildManifest> {
        self.manifest
            .as_ref()
            .ok_or_else(|| DeployError::Other("build manifest has not been detected".into()))
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}
