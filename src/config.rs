//! Deployment parameters.
//!
//! A [`DeploymentConfig`] is assembled from flags and an optional YAML
//! file, then frozen by [`DeploymentConfig::validate`] into a
//! [`ValidConfig`]. Only a `ValidConfig` can drive a
//! [`Pipeline`](crate::Pipeline), so malformed input never reaches the
//! remote host.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{DeployError, Result};
use crate::health::HealthPolicy;
use crate::ssh::RemoteTarget;

/// How the source repository authenticates.
pub enum Credential {
    None,
    /// HTTPS token, embedded as URL userinfo when fetching.
    Token(SecretString),
    /// Private key handed to git's ssh.
    SshKey(PathBuf),
}

impl Credential {
    #[must_use]
    pub fn token(token: &str) -> Self {
        Self::Token(SecretString::from(token.to_string()))
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Token(token) => Self::token(token.expose_secret()),
            Self::SshKey(path) => Self::SshKey(path.clone()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Token(_) => f.write_str("Token(***)"),
            Self::SshKey(path) => f.debug_tuple("SshKey").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub repository: Option<String>,
    pub credential: Credential,
    pub branch: String,
    pub host: String,
    pub ssh_port: u16,
    pub ssh_key: Option<PathBuf>,
    pub app_name: Option<String>,
    pub app_port: u16,
    pub app_dir: String,
    pub compose_file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub domain: Option<String>,
    pub install_docker: bool,
    pub systemd_service: Option<String>,
    pub health: HealthPolicy,
    pub staging_dir: Option<PathBuf>,
    pub force_unlock: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            repository: None,
            credential: Credential::None,
            branch: "main".to_string(),
            host: String::new(),
            ssh_port: 22,
            ssh_key: None,
            app_name: None,
            app_port: 8080,
            app_dir: "/opt/app".to_string(),
            compose_file: None,
            env_file: None,
            domain: None,
            install_docker: false,
            systemd_service: None,
            health: HealthPolicy::default(),
            staging_dir: None,
            force_unlock: false,
        }
    }
}

impl DeploymentConfig {
    /// Start from defaults with `host` given as `user@host` or `host`.
    #[must_use]
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn repository(mut self, url: &str) -> Self {
        self.repository = Some(url.to_string());
        self
    }

    #[must_use]
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    #[must_use]
    pub fn branch(mut self, branch: &str) -> Self {
        self.branch = branch.to_string();
        self
    }

    #[must_use]
    pub const fn ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    #[must_use]
    pub fn ssh_key(mut self, key: &Path) -> Self {
        self.ssh_key = Some(key.to_path_buf());
        self
    }

    #[must_use]
    pub fn app_name(mut self, name: &str) -> Self {
        self.app_name = Some(name.to_string());
        self
    }

    #[must_use]
    pub const fn app_port(mut self, port: u16) -> Self {
        self.app_port = port;
        self
    }

    #[must_use]
    pub fn app_dir(mut self, dir: &str) -> Self {
        self.app_dir = dir.to_string();
        self
    }

    #[must_use]
    pub fn compose_file(mut self, path: &Path) -> Self {
        self.compose_file = Some(path.to_path_buf());
        self
    }

    #[must_use]
    pub fn env_file(mut self, path: &Path) -> Self {
        self.env_file = Some(path.to_path_buf());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    #[must_use]
    pub const fn install_docker(mut self, force: bool) -> Self {
        self.install_docker = force;
        self
    }

    #[must_use]
    pub fn systemd_service(mut self, name: &str) -> Self {
        self.systemd_service = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn health(mut self, policy: HealthPolicy) -> Self {
        self.health = policy;
        self
    }

    #[must_use]
    pub fn staging_dir(mut self, dir: &Path) -> Self {
        self.staging_dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub const fn force_unlock(mut self, force: bool) -> Self {
        self.force_unlock = force;
        self
    }

    /// Check every field and resolve defaults that depend on others.
    pub fn validate(self) -> Result<ValidConfig> {
        if let Some(url) = &self.repository {
            check_repository(url)?;
        }
        check_branch(&self.branch)?;

        let target = RemoteTarget::parse(&self.host)?.port(self.ssh_port);
        check_host("host", &target.host)?;
        check_user(&target.user)?;
        if self.ssh_port == 0 {
            return invalid("ssh-port", "must not be 0");
        }
        let target = match &self.ssh_key {
            Some(key) => {
                check_exists("ssh-key", key)?;
                target.identity(key)
            }
            None => target,
        };
        if let Credential::SshKey(key) = &self.credential {
            check_exists("git-ssh-key", key)?;
        }

        let app_name = match &self.app_name {
            Some(name) => name.clone(),
            None => self
                .repository
                .as_deref()
                .map_or_else(|| "app".to_string(), derive_app_name),
        };
        check_app_name(&app_name)?;

        if self.app_port == 0 {
            return invalid("app-port", "must not be 0");
        }
        check_app_dir(&self.app_dir)?;

        if let Some(compose) = &self.compose_file {
            if compose.is_absolute() || compose.components().any(|c| c.as_os_str() == "..") {
                return invalid(
                    "compose-file",
                    "must be a path inside the repository",
                );
            }
        }
        if let Some(env_file) = &self.env_file {
            check_exists("env-file", env_file)?;
        }
        if let Some(domain) = &self.domain {
            check_host("domain", domain)?;
        }
        if let Some(service) = &self.systemd_service {
            check_unit_name(service)?;
        }
        if !self.health.path.starts_with('/') {
            return invalid("health-path", "must start with '/'");
        }
        if self.health.attempts == 0 {
            return invalid("health-attempts", "must be at least 1");
        }

        let staging_dir = self
            .staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("trebuchet").join(&app_name));

        Ok(ValidConfig {
            repository: self.repository,
            credential: self.credential,
            branch: self.branch,
            target,
            app_name,
            app_port: self.app_port,
            app_dir: self.app_dir.trim_end_matches('/').to_string(),
            compose_file: self.compose_file,
            env_file: self.env_file,
            domain: self.domain,
            install_docker: self.install_docker,
            systemd_service: self.systemd_service,
            health: self.health,
            staging_dir,
            force_unlock: self.force_unlock,
        })
    }
}

/// A checked, immutable [`DeploymentConfig`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ValidConfig {
    pub repository: Option<String>,
    pub credential: Credential,
    pub branch: String,
    pub target: RemoteTarget,
    pub app_name: String,
    pub app_port: u16,
    pub app_dir: String,
    pub compose_file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub domain: Option<String>,
    pub install_docker: bool,
    pub systemd_service: Option<String>,
    pub health: HealthPolicy,
    pub staging_dir: PathBuf,
    pub force_unlock: bool,
}

/// Deployment settings read from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssh_key: Option<PathBuf>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub git_ssh_key: Option<PathBuf>,
    pub app_name: Option<String>,
    pub app_port: Option<u16>,
    pub app_dir: Option<String>,
    pub compose_file: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub domain: Option<String>,
    pub install_docker: Option<bool>,
    pub systemd_service: Option<String>,
    pub health_path: Option<String>,
    pub health_attempts: Option<u32>,
    pub staging_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeployError::FileNotFound(path.display().to_string())
            } else {
                DeployError::Io(e)
            }
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Turn file values into a config; flags are applied on top.
    #[must_use]
    pub fn into_config(self) -> DeploymentConfig {
        let defaults = DeploymentConfig::default();
        let mut health = defaults.health;
        if let Some(path) = self.health_path {
            health.path = path;
        }
        if let Some(attempts) = self.health_attempts {
            health.attempts = attempts;
        }
        DeploymentConfig {
            repository: self.repo,
            credential: self
                .git_ssh_key
                .map_or(Credential::None, Credential::SshKey),
            branch: self.branch.unwrap_or(defaults.branch),
            host: self.host.unwrap_or_default(),
            ssh_port: self.port.unwrap_or(defaults.ssh_port),
            ssh_key: self.ssh_key,
            app_name: self.app_name,
            app_port: self.app_port.unwrap_or(defaults.app_port),
            app_dir: self.app_dir.unwrap_or(defaults.app_dir),
            compose_file: self.compose_file,
            env_file: self.env_file,
            domain: self.domain,
            install_docker: self.install_docker.unwrap_or(false),
            systemd_service: self.systemd_service,
            health,
            staging_dir: self.staging_dir,
            force_unlock: false,
        }
    }
}

fn invalid<T>(field: &'static str, reason: &str) -> Result<T> {
    Err(DeployError::Validation {
        field,
        reason: reason.to_string(),
    })
}

fn check_repository(url: &str) -> Result<()> {
    if url.starts_with('/') {
        return Ok(());
    }
    if let Some((scheme, _)) = url.split_once("://") {
        if !matches!(scheme, "https" | "http" | "ssh" | "git" | "file") {
            return invalid("repo", &format!("unsupported scheme '{scheme}'"));
        }
        let parsed = url::Url::parse(url)
            .or_else(|e| invalid("repo", &e.to_string()))?;
        if scheme != "file" && parsed.host_str().is_none_or(str::is_empty) {
            return invalid("repo", "missing host");
        }
        return Ok(());
    }
    // scp-like: git@github.com:org/app.git
    match url.split_once(':') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() && !host.contains('/') => {
            Ok(())
        }
        _ => invalid(
            "repo",
            "expected an https://, ssh:// or git@host:path URL, or an absolute path",
        ),
    }
}

/// Git ref-name rules (`git check-ref-format`), minus the ones that
/// only matter for full refnames.
fn check_branch(branch: &str) -> Result<()> {
    let bad = branch.is_empty()
        || branch == "@"
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with('.')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("@{")
        || branch.contains("//")
        || branch
            .chars()
            .any(|c| c.is_ascii_control() || " ~^:?*[\\".contains(c))
        || branch.split('/').any(|part| part.starts_with('.'));
    if bad {
        return invalid("branch", &format!("'{branch}' is not a valid branch name"));
    }
    Ok(())
}

fn check_host(field: &'static str, host: &str) -> Result<()> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(())
    } else {
        invalid(field, &format!("'{host}' is not a hostname or IP address"))
    }
}

fn check_user(user: &str) -> Result<()> {
    let mut chars = user.chars();
    let valid = user.len() <= 32
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        invalid("user", &format!("'{user}' is not a valid login name"))
    }
}

fn check_exists(field: &'static str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        invalid(field, &format!("{} does not exist", path.display()))
    }
}

/// Container names: lowercase so they double as image and compose
/// project names.
fn check_app_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = name.len() <= 63
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')
        });
    if valid {
        Ok(())
    } else {
        invalid(
            "app-name",
            &format!("'{name}' must match [a-z0-9][a-z0-9_.-]* (max 63)"),
        )
    }
}

fn check_app_dir(dir: &str) -> Result<()> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return invalid("app-dir", "must be an absolute path");
    }
    if dir.trim_end_matches('/').is_empty() {
        return invalid("app-dir", "must not be the filesystem root");
    }
    if path.components().any(|c| c.as_os_str() == "..") {
        return invalid("app-dir", "must not contain '..'");
    }
    Ok(())
}

fn check_unit_name(name: &str) -> Result<()> {
    let base = name.strip_suffix(".service").unwrap_or(name);
    let valid = !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '_' | '.' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        invalid(
            "systemd-service",
            &format!("'{name}' is not a valid unit name"),
        )
    }
}

/// Application name from the last path segment of a repository URL.
#[must_use]
pub fn derive_app_name(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    let stem = last.strip_suffix(".git").unwrap_or(last);
    let name: String = stem
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if name.is_empty() {
        "app".to_string()
    } else {
        name.chars().take(63).collect()
    }
}
