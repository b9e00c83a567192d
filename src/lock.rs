//! Per-host deploy lock.
//!
//! Two deployments against the same app directory must not interleave.
//! The lock is a directory created with `mkdir`, which is atomic, and
//! holds an `info.json` naming the holder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeployError, Result};
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

/// Who holds a deploy lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine running the deployment.
    pub holder: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub app: String,
}

impl LockInfo {
    #[must_use]
    pub fn new(app: &str) -> Self {
        Self {
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            started_at: Utc::now(),
            app: app.to_string(),
        }
    }

    /// Locks older than an hour belong to a deployment that died.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        (Utc::now() - self.started_at).num_hours() >= 1
    }
}

#[must_use]
pub fn lock_dir(app_dir: &str) -> String {
    format!("{app_dir}/.trebuchet/deploy.lock")
}

/// A held lock. Released on drop.
pub struct DeployLock<'a> {
    remote: &'a dyn RemoteExecutor,
    dir: String,
    released: bool,
}

impl std::fmt::Debug for DeployLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployLock").field("dir", &self.dir).finish()
    }
}

impl<'a> DeployLock<'a> {
    /// Take the lock for `app` in `app_dir`.
    ///
    /// A stale lock is broken with a warning; a live one only when
    /// `force` is set.
    pub fn acquire(
        remote: &'a dyn RemoteExecutor,
        app_dir: &str,
        app: &str,
        force: bool,
    ) -> Result<Self> {
        let dir = lock_dir(app_dir);
        remote.run(
            Script::new(Cmd::new("mkdir").args(["-p", &format!("{app_dir}/.trebuchet")])),
            &ExecOptions::default(),
        )?;

        if !try_create(remote, &dir)? {
            let existing = read_info(remote, &dir)?;
            match existing {
                Some(info) if !force && !info.is_stale() => {
                    return Err(DeployError::LockHeld {
                        holder: info.holder,
                        pid: info.pid,
                        since: info.started_at,
                    });
                }
                Some(info) => warn!(
                    holder = %info.holder,
                    pid = info.pid,
                    since = %info.started_at,
                    forced = force,
                    "breaking deploy lock"
                ),
                None if !force => {
                    return Err(DeployError::LockHeld {
                        holder: "unknown".into(),
                        pid: 0,
                        since: Utc::now(),
                    });
                }
                None => warn!("breaking unreadable deploy lock"),
            }
            remove(remote, &dir)?;
            if !try_create(remote, &dir)? {
                return Err(DeployError::Other(
                    "deploy lock was taken by another process while breaking it".into(),
                ));
            }
        }

        let info = serde_json::to_vec_pretty(&LockInfo::new(app))?;
        let lock = Self {
            remote,
            dir,
            released: false,
        };
        remote.write_file(&info, &format!("{}/info.json", lock.dir))?;
        debug!(dir = %lock.dir, "deploy lock acquired");
        Ok(lock)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove(self.remote, &self.dir)
    }
}

impl Drop for DeployLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove(self.remote, &self.dir) {
            warn!(dir = %self.dir, error = %e, "could not release deploy lock");
        }
    }
}

fn try_create(remote: &dyn RemoteExecutor, dir: &str) -> Result<bool> {
    let script = remote
        .target()
        .elevate(Script::new(Cmd::new("mkdir").arg(dir)));
    Ok(remote.execute(&script, &ExecOptions::default())?.success())
}

fn read_info(remote: &dyn RemoteExecutor, dir: &str) -> Result<Option<LockInfo>> {
    let content = remote.query(Script::new(
        Cmd::new("cat").arg(format!("{dir}/info.json")),
    ))?;
    Ok(content.and_then(|c| serde_json::from_str(&c).ok()))
}

fn remove(remote: &dyn RemoteExecutor, dir: &str) -> Result<()> {
    remote.run(
        Script::new(Cmd::new("rm").args(["-rf", dir])),
        &ExecOptions::default(),
    )?;
    Ok(())
}
