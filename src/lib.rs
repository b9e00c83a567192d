//! Idempotent remote provisioning and deployment over SSH.
//!
//! Trebuchet takes a git repository with a Dockerfile or a compose
//! file and puts it in production on a plain Linux host: it installs
//! what is missing (Docker, compose, nginx), ships the source, builds
//! and runs the application, puts nginx in front of it and checks that
//! it answers. If anything fails after the running application was
//! touched, the previous deployment is restored.
//!
//! Every step is safe to run again. A second deployment of the same
//! commit finds the capabilities present, the proxy config unchanged
//! and the lock free, and only rebuilds and restarts the application.
//!
//! # Overview
//!
//! A deployment is a [`Pipeline`] built from a [`ValidConfig`]:
//!
//! - A [`DeploymentConfig`] describing the repository, the target
//!   host and the application, checked by
//!   [`DeploymentConfig::validate`]
//! - A [`SourceStage`](repo::SourceStage) producing a local checkout
//!   (default: [`GitStage`])
//! - A [`FileTransfer`](transfer::FileTransfer) shipping it (default:
//!   [`TarTransfer`])
//! - A [`RemoteExecutor`](ssh::RemoteExecutor) running commands on
//!   the host (in production: [`SshSession`])
//!
//! # Architecture
//!
//! The pipeline is a linear state machine over [`Step`]s:
//!
//! 1. **Validate**, **Stage**, **VerifyBuildFiles** - local only; a
//!    repository without a recognized build file never reaches the
//!    host
//! 2. **Connect** - reach the host and take the deploy lock
//! 3. **Provision** - probe and, where needed, install or repair the
//!    container runtime, compose and nginx
//! 4. **Transfer**, **Build**, **Run** - ship the source, build it and
//!    replace the running application, after taking a snapshot
//! 5. **HealthCheck**, **ProxyConfigure**, **ServiceInstall**,
//!    **Verify** - check the application, route nginx to it, optionally
//!    wrap it in a systemd unit, and check it end to end
//!
//! A failure after the snapshot restores the previous deployment and
//! the run ends [`MachineState::RolledBack`]; otherwise it ends
//! [`MachineState::Aborted`]. Either way [`DeployResult`] names the
//! failed step.
//!
//! # Examples
//!
//! ```rust,no_run
//! use trebuchet::{DeploymentConfig, Pipeline, SshSession};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = DeploymentConfig::new("deploy@10.0.0.5")
//!         .repository("https://example.com/acme/shop.git")
//!         .branch("main")
//!         .app_port(3000)
//!         .domain("shop.example.com")
//!         .validate()?;
//!
//!     let session = SshSession::new(config.target.clone());
//!     let result = Pipeline::new(config).deploy(&session);
//!
//!     eprintln!("{result}");
//!     std::process::exit(i32::from(result.exit_code()));
//! }
//! ```
//!
//! The `trebuchet` binary wraps the same pipeline:
//!
//! ```sh
//! # Deploy, creating a systemd unit for the container
//! trebuchet --host deploy@10.0.0.5 --repo https://example.com/acme/shop.git \
//!     --app-port 3000 --domain shop.example.com --systemd-service shop
//!
//! # Show what would happen
//! trebuchet --host deploy@10.0.0.5 --repo https://example.com/acme/shop.git --dry-run
//!
//! # Go back to the previous deployment
//! trebuchet --host deploy@10.0.0.5 --app-name shop --rollback
//! ```

// Allow noisy pedantic lints that don't add value for a
// deployment tool crate.
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod cli;
pub mod cmd;
pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod health;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod provision;
pub mod proxy;
pub mod repo;
pub mod shell;
pub mod snapshot;
pub mod ssh;
pub mod systemd;
pub mod transfer;

pub use config::{Credential, DeploymentConfig, ValidConfig};
pub use error::{DeployError, Result};
pub use pipeline::{AbortSignal, Pipeline};
pub use plan::{DeployResult, DeployStatus, MachineState, Step, StepResult};
pub use probe::{Capability, CapabilityStatus};
pub use provision::Provisioner;
pub use repo::GitStage;
pub use ssh::{RemoteTarget, SshSession};
pub use transfer::TarTransfer;
