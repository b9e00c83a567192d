use std::path::Path;

use tracing::{debug, warn};

use crate::cmd;
use crate::error::{DeployError, Result};
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

/// Copies a local directory tree to the remote host.
pub trait FileTransfer {
    /// Replace `remote_dir` with the contents of `local_dir`.
    fn transfer(&self, remote: &dyn RemoteExecutor, local_dir: &Path, remote_dir: &str)
    -> Result<()>;
}

/// Left out of every archive.
const EXCLUDES: [&str; 1] = [".git"];

/// Ships the tree as one gzipped tarball over `scp` and unpacks it
/// next to the destination before swapping it into place.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarTransfer;

impl TarTransfer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Build the archive into `archive`.
    pub fn pack(&self, local_dir: &Path, archive: &Path) -> Result<()> {
        if !local_dir.is_dir() {
            return Err(DeployError::FileNotFound(local_dir.display().to_string()));
        }
        let archive = archive.display().to_string();
        let local = local_dir.display().to_string();
        let mut args = vec!["-czf".to_string(), archive];
        args.extend(EXCLUDES.iter().map(|e| format!("--exclude={e}")));
        args.extend(["-C".to_string(), local, ".".to_string()]);

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("tar", &refs)?;
        Ok(())
    }
}

/// Script that unpacks `archive` into `remote_dir`, replacing it.
#[must_use]
pub fn unpack_script(archive: &str, remote_dir: &str) -> Script {
    let incoming = format!("{remote_dir}.incoming");
    Script::new(Cmd::new("rm").args(["-rf", &incoming]))
        .and(Cmd::new("mkdir").args(["-p", &incoming]))
        .and(Cmd::new("tar").args(["-xzf", archive, "-C", &incoming]))
        .and(Cmd::new("rm").args(["-rf", remote_dir]))
        .and(Cmd::new("mv").args([incoming.as_str(), remote_dir]))
}

impl FileTransfer for TarTransfer {
    fn transfer(
        &self,
        remote: &dyn RemoteExecutor,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("source.tar.gz");
        self.pack(local_dir, &archive)?;

        let remote_archive = format!(
            "/tmp/trebuchet-{}-{}.tar.gz",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        debug!(archive = %remote_archive, "uploading source archive");

        let result = remote
            .copy_file(&archive, &remote_archive)
            .and_then(|()| {
                remote
                    .run(unpack_script(&remote_archive, remote_dir), &ExecOptions::install())
                    .map(drop)
            });

        let cleanup = Script::new(Cmd::new("rm").args(["-f", &remote_archive]));
        if let Err(e) = remote.run(cleanup, &ExecOptions::probe()) {
            warn!(archive = %remote_archive, error = %e, "could not remove remote archive");
        }

        result
    }
}
