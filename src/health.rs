use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::container::{self, Workload};
use crate::error::{DeployError, Result};
use crate::shell::{Cmd, Script};
use crate::ssh::{ExecOptions, RemoteExecutor};

/// Bounded polling of the application after it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub path: String,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(3),
            path: "/".to_string(),
        }
    }
}

impl HealthPolicy {
    #[must_use]
    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    #[must_use]
    pub const fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Result of a health check that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: Option<u16>,
    pub warning: Option<String>,
}

/// `curl` exits 127 through the shell when it is not installed.
const NOT_FOUND: i32 = 127;

/// HTTP status of `url` as seen from the remote host. `None` when
/// nothing answered.
pub fn http_status(
    remote: &dyn RemoteExecutor,
    url: &str,
    host_header: Option<&str>,
) -> Result<Option<u16>> {
    let mut curl = Cmd::new("curl").args([
        "-s",
        "-o",
        "/dev/null",
        "-w",
        "%{http_code}",
        "--max-time",
        "5",
    ]);
    if let Some(host) = host_header {
        curl = curl.args(["-H", &format!("Host: {host}")]);
    }
    let output = remote.execute(&Script::new(curl.arg(url)), &ExecOptions::probe())?;
    if output.exit_code == NOT_FOUND {
        return Err(DeployError::CapabilityMissing {
            capability: "curl".into(),
            detail: "needed on the host for HTTP checks".into(),
        });
    }
    Ok(output
        .stdout
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|code| *code != 0))
}

/// Poll the application until it answers.
///
/// The container not running is fatal at any attempt. A 404 on the
/// health path or no HTTP answer at all only warns: the service may
/// have no such endpoint or may not speak HTTP. A server error on any
/// attempt fails the check unless a later attempt succeeds, even when
/// the attempts after it got no answer.
pub fn check(
    remote: &dyn RemoteExecutor,
    workload: &Workload,
    policy: &HealthPolicy,
) -> Result<HealthReport> {
    let url = format!("http://127.0.0.1:{}{}", workload.port, policy.path);
    let mut server_error = None;

    for attempt in 1..=policy.attempts {
        if !container::is_running(remote, workload)? {
            return Err(DeployError::HealthCheckFailed {
                app: workload.app.clone(),
                reason: "container is not running".into(),
            });
        }

        let status = match http_status(remote, &url, None) {
            Ok(status) => status,
            Err(DeployError::CapabilityMissing { detail, .. }) => {
                return Ok(warning(None, format!("curl unavailable, HTTP not checked ({detail})")));
            }
            Err(e) => return Err(e),
        };
        debug!(attempt, url = %url, status = ?status, "health probe");

        match status {
            Some(code @ 200..=399) => {
                info!(app = %workload.app, status = code, "healthy");
                return Ok(HealthReport {
                    status: Some(code),
                    warning: None,
                });
            }
            Some(404) => {
                return Ok(warning(
                    Some(404),
                    format!("no health endpoint at {} (404)", policy.path),
                ));
            }
            Some(code @ 400..=499) => {
                return Ok(warning(
                    Some(code),
                    format!("{} answered {code}", policy.path),
                ));
            }
            Some(code) => server_error = Some(code),
            None => {}
        }

        if attempt < policy.attempts {
            thread::sleep(policy.interval);
        }
    }

    match server_error {
        Some(code) => Err(DeployError::HealthCheckFailed {
            app: workload.app.clone(),
            reason: format!("{url} returned {code} after {} attempts", policy.attempts),
        }),
        None => Ok(warning(
            None,
            format!("no HTTP answer on port {} after {} attempts", workload.port, policy.attempts),
        )),
    }
}

fn warning(status: Option<u16>, message: String) -> HealthReport {
    HealthReport {
        status,
        warning: Some(message),
    }
}
