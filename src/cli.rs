use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use crate::config::{Credential, DeploymentConfig, FileConfig};
use crate::error::{DeployError, Result};
use crate::pipeline::{AbortSignal, Pipeline};
use crate::ssh::SshSession;

/// Deploy a git repository to a host over SSH: provision Docker and
/// nginx, build and run the application, and roll back on failure.
#[derive(Parser)]
#[command(name = "trebuchet", version, about)]
pub struct Cli {
    /// Remote target as `user@host` (user defaults to root).
    #[arg(long, value_name = "USER@HOST")]
    pub host: Option<String>,

    /// SSH identity file.
    #[arg(long, value_name = "PATH")]
    pub ssh_key: Option<PathBuf>,

    /// SSH port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Remote deployment directory [default: /opt/app].
    #[arg(long, value_name = "PATH")]
    pub app_dir: Option<String>,

    /// Build manifest to use instead of searching the repository.
    #[arg(long, value_name = "PATH")]
    pub compose_file: Option<PathBuf>,

    /// Local environment file uploaded next to the application.
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Reinstall Docker even if it is already present.
    #[arg(long)]
    pub install_docker: bool,

    /// Install a systemd unit that keeps the application running.
    #[arg(long, value_name = "NAME")]
    pub systemd_service: Option<String>,

    /// Print the steps and generated files without executing anything.
    #[arg(long, conflicts_with = "rollback")]
    pub dry_run: bool,

    /// Restore the previous deployment from the snapshot on the host.
    #[arg(long)]
    pub rollback: bool,

    /// Log every command and step detail.
    #[arg(short, long)]
    pub verbose: bool,

    /// Git repository to deploy.
    #[arg(long, value_name = "URL")]
    pub repo: Option<String>,

    /// Branch to deploy [default: main].
    #[arg(long)]
    pub branch: Option<String>,

    /// Token for HTTPS repositories.
    #[arg(long, env = "GIT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Private key for SSH repositories.
    #[arg(long, value_name = "PATH", conflicts_with = "token")]
    pub git_ssh_key: Option<PathBuf>,

    /// Application and container name [default: derived from --repo].
    #[arg(long)]
    pub app_name: Option<String>,

    /// Port the application listens on [default: 8080].
    #[arg(long)]
    pub app_port: Option<u16>,

    /// Domain nginx serves the application on.
    #[arg(long)]
    pub domain: Option<String>,

    /// HTTP path polled by the health check [default: /].
    #[arg(long, value_name = "PATH")]
    pub health_path: Option<String>,

    /// Local directory the repository is staged in.
    #[arg(long, value_name = "PATH")]
    pub staging_dir: Option<PathBuf>,

    /// YAML file with deployment settings; flags take precedence.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Also write JSON step records to this file.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Break a deploy lock held by another run.
    #[arg(long)]
    pub force_unlock: bool,
}

impl Cli {
    /// Settings from `--config`, overridden by flags.
    pub fn deployment_config(&self) -> Result<DeploymentConfig> {
        let mut config = match &self.config {
            Some(path) => FileConfig::load(path)?.into_config(),
            None => DeploymentConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if config.host.is_empty() {
            return Err(DeployError::Validation {
                field: "host",
                reason: "required (--host user@host)".into(),
            });
        }
        if let Some(port) = self.port {
            config.ssh_port = port;
        }
        if self.ssh_key.is_some() {
            config.ssh_key.clone_from(&self.ssh_key);
        }
        if self.repo.is_some() {
            config.repository.clone_from(&self.repo);
        }
        if let Some(branch) = &self.branch {
            config.branch.clone_from(branch);
        }
        if let Some(token) = &self.token {
            config.credential = Credential::token(token);
        } else if let Some(key) = &self.git_ssh_key {
            config.credential = Credential::SshKey(key.clone());
        }
        if self.app_name.is_some() {
            config.app_name.clone_from(&self.app_name);
        }
        if let Some(port) = self.app_port {
            config.app_port = port;
        }
        if let Some(dir) = &self.app_dir {
            config.app_dir.clone_from(dir);
        }
        if self.compose_file.is_some() {
            config.compose_file.clone_from(&self.compose_file);
        }
        if self.env_file.is_some() {
            config.env_file.clone_from(&self.env_file);
        }
        if self.domain.is_some() {
            config.domain.clone_from(&self.domain);
        }
        if self.systemd_service.is_some() {
            config.systemd_service.clone_from(&self.systemd_service);
        }
        if let Some(path) = &self.health_path {
            config.health.path.clone_from(path);
        }
        if self.staging_dir.is_some() {
            config.staging_dir.clone_from(&self.staging_dir);
        }
        config.install_docker |= self.install_docker;
        config.force_unlock = self.force_unlock;
        Ok(config)
    }

    /// Execute the requested action and map the outcome to an exit code.
    #[must_use]
    pub fn run(&self) -> ExitCode {
        match self.dispatch() {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {e}");
                eprintln!("Hint: {}", e.hint());
                ExitCode::FAILURE
            }
        }
    }

    fn dispatch(&self) -> Result<ExitCode> {
        let config = self.deployment_config()?.validate()?;
        let mut pipeline = Pipeline::new(config);
        if let Some(path) = &self.log_file {
            pipeline = pipeline.log_reference(&path.display().to_string());
        }

        if self.dry_run {
            eprintln!("=== Dry run: no changes will be made ===");
            eprintln!();
            print!("{}", pipeline.plan());
            return Ok(ExitCode::SUCCESS);
        }

        let session = SshSession::new(pipeline.config().target.clone());

        if self.rollback {
            let snapshot = pipeline.rollback(&session)?;
            eprintln!(
                "Restored the deployment that was running before {}",
                snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            return Ok(ExitCode::SUCCESS);
        }

        let abort = AbortSignal::new();
        abort.install_ctrl_c()?;
        let result = pipeline.abort_signal(abort).deploy(&session);

        eprintln!("{result}");
        if let Some(error) = &result.error {
            eprintln!("Error: {error}");
        }
        if let Some(hint) = &result.hint {
            eprintln!("Hint: {hint}");
        }
        Ok(ExitCode::from(result.exit_code()))
    }
}
