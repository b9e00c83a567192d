//! Local staging of the source repository.
//!
//! [`GitStage`] keeps one working copy per application and brings it
//! to the tip of the requested branch. Re-staging an unchanged branch
//! changes nothing; local edits are stashed, never thrown away.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{debug, info, warn};
use url::Url;

use crate::cmd::{DEFAULT_TIMEOUT, Invocation};
use crate::config::Credential;
use crate::error::{DeployError, Result};
use crate::shell::quote;

/// Produces a local checkout of `branch`.
pub trait SourceStage {
    fn stage(&self, url: &str, credential: &Credential, branch: &str) -> Result<PathBuf>;
}

/// Git working copy in a fixed staging directory.
#[derive(Debug, Clone)]
pub struct GitStage {
    dir: PathBuf,
    timeout: Duration,
}

impl GitStage {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, credential: &Credential) -> Invocation {
        let inv = Invocation::new("git")
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout);
        match credential {
            Credential::SshKey(key) => inv.env(
                "GIT_SSH_COMMAND",
                &format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes \
                     -o StrictHostKeyChecking=accept-new",
                    quote(&key.display().to_string())
                ),
            ),
            _ => inv,
        }
    }

    fn git_in(&self, credential: &Credential) -> Invocation {
        self.git(credential).current_dir(&self.dir)
    }

    fn is_work_tree(&self) -> bool {
        let Ok(top) = self
            .git_in(&Credential::None)
            .args(["rev-parse", "--show-toplevel"])
            .run()
        else {
            return false;
        };
        match (Path::new(&top).canonicalize(), self.dir.canonicalize()) {
            (Ok(top), Ok(dir)) => top == dir,
            _ => false,
        }
    }

    fn stash_if_dirty(&self) -> Result<()> {
        let status = self
            .git_in(&Credential::None)
            .args(["status", "--porcelain"])
            .run()?;
        if status.is_empty() {
            return Ok(());
        }
        let message = format!(
            "trebuchet: local changes before deploy at {}",
            chrono::Utc::now().to_rfc3339()
        );
        // Stashing records a commit, which needs an identity even on
        // hosts where git was never configured.
        self.git_in(&Credential::None)
            .env("GIT_COMMITTER_NAME", "trebuchet")
            .env("GIT_COMMITTER_EMAIL", "trebuchet@localhost")
            .env("GIT_AUTHOR_NAME", "trebuchet")
            .env("GIT_AUTHOR_EMAIL", "trebuchet@localhost")
            .args(["stash", "push", "--include-untracked", "--message", &message])
            .run()?;
        warn!(dir = %self.dir.display(), "staging copy had local changes; stashed them");
        Ok(())
    }

    fn clone(&self, url: &str, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(repo = %redact_url(url), dir = %self.dir.display(), "cloning");
        let fetch_url = authenticated_url(url, credential)?;
        self.git(credential)
            .args(["clone", "--origin", "origin"])
            .secret_arg(&fetch_url)
            .arg(self.dir.display().to_string())
            .run()
            .map_err(|e| scrub(e, &fetch_url, url))?;
        // The token must not stay in .git/config.
        self.git_in(&Credential::None)
            .args(["remote", "set-url", "origin", url])
            .run()?;
        Ok(())
    }

    fn fetch(&self, url: &str, credential: &Credential) -> Result<()> {
        debug!(repo = %redact_url(url), "fetching");
        let fetch_url = authenticated_url(url, credential)?;
        self.git_in(credential)
            .args(["fetch", "--prune"])
            .secret_arg(&fetch_url)
            .arg("+refs/heads/*:refs/remotes/origin/*")
            .run()
            .map_err(|e| scrub(e, &fetch_url, url))?;
        Ok(())
    }

    fn has_ref(&self, reference: &str) -> bool {
        self.git_in(&Credential::None)
            .args(["rev-parse", "--verify", "--quiet", reference])
            .capture()
            .is_ok_and(|out| out.success())
    }

    fn remote_branches(&self) -> Result<Vec<String>> {
        let list = self
            .git_in(&Credential::None)
            .args([
                "for-each-ref",
                "--format=%(refname:strip=3)",
                "refs/remotes/origin",
            ])
            .run()?;
        Ok(list
            .lines()
            .map(str::trim)
            .filter(|b| !b.is_empty() && *b != "HEAD")
            .map(ToString::to_string)
            .collect())
    }

    /// Local branch first, then a new tracking branch for the remote one.
    fn checkout(&self, branch: &str) -> Result<()> {
        let git = || self.git_in(&Credential::None);
        if self.has_ref(&format!("refs/heads/{branch}")) {
            git().args(["checkout", "--quiet", branch]).run()?;
        } else if self.has_ref(&format!("refs/remotes/origin/{branch}")) {
            info!(branch, "creating local tracking branch");
            git()
                .args([
                    "checkout",
                    "--quiet",
                    "-b",
                    branch,
                    "--track",
                    &format!("origin/{branch}"),
                ])
                .run()?;
        } else {
            return Err(DeployError::BranchNotFound {
                branch: branch.to_string(),
                available: self.remote_branches()?,
            });
        }
        git()
            .args(["merge", "--ff-only", "--quiet", &format!("origin/{branch}")])
            .run()?;
        Ok(())
    }
}

impl SourceStage for GitStage {
    fn stage(&self, url: &str, credential: &Credential, branch: &str) -> Result<PathBuf> {
        if self.dir.exists() && !self.is_work_tree() {
            warn!(
                dir = %self.dir.display(),
                "staging directory is not a git working copy; re-cloning"
            );
            std::fs::remove_dir_all(&self.dir)?;
        }

        if self.dir.exists() {
            self.stash_if_dirty()?;
            self.fetch(url, credential)?;
        } else {
            self.clone(url, credential)?;
        }
        self.checkout(branch)?;

        let head = self
            .git_in(&Credential::None)
            .args(["rev-parse", "--short", "HEAD"])
            .run()?;
        info!(branch, commit = %head, "source staged");
        Ok(self.dir.clone())
    }
}

/// URL git fetches from. A token is only embedded for HTTP(S); SSH
/// URLs authenticate with keys.
pub fn authenticated_url(url: &str, credential: &Credential) -> Result<String> {
    let Credential::Token(token) = credential else {
        return Ok(url.to_string());
    };
    let Ok(mut parsed) = Url::parse(url) else {
        return Ok(url.to_string());
    };
    if !matches!(parsed.scheme(), "https" | "http") {
        return Ok(url.to_string());
    }
    let bad = |()| DeployError::Validation {
        field: "repo",
        reason: "cannot carry credentials".into(),
    };
    parsed.set_username("x-access-token").map_err(bad)?;
    parsed
        .set_password(Some(token.expose_secret()))
        .map_err(bad)?;
    Ok(parsed.into())
}

/// `url` with any userinfo replaced, for logs.
#[must_use]
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if !parsed.username().is_empty() || parsed.password().is_some() => {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(None);
            parsed.into()
        }
        _ => url.to_string(),
    }
}

// git may echo the URL it failed on.
fn scrub(e: DeployError, secret_url: &str, url: &str) -> DeployError {
    match e {
        DeployError::CommandFailed {
            command,
            status,
            stderr,
        } => DeployError::CommandFailed {
            command,
            status,
            stderr: stderr.replace(secret_url, &redact_url(url)),
        },
        other => other,
    }
}
