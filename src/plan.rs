use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// A named unit of work in the deploy state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Step {
    Validate,
    Stage,
    VerifyBuildFiles,
    Connect,
    Provision,
    Transfer,
    Build,
    Run,
    HealthCheck,
    ProxyConfigure,
    ServiceInstall,
    Verify,
}

impl Step {
    pub const ALL: [Self; 12] = [
        Self::Validate,
        Self::Stage,
        Self::VerifyBuildFiles,
        Self::Connect,
        Self::Provision,
        Self::Transfer,
        Self::Build,
        Self::Run,
        Self::HealthCheck,
        Self::ProxyConfigure,
        Self::ServiceInstall,
        Self::Verify,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Validate => "Validate",
            Self::Stage => "Stage",
            Self::VerifyBuildFiles => "VerifyBuildFiles",
            Self::Connect => "Connect",
            Self::Provision => "Provision",
            Self::Transfer => "Transfer",
            Self::Build => "Build",
            Self::Run => "Run",
            Self::HealthCheck => "HealthCheck",
            Self::ProxyConfigure => "ProxyConfigure",
            Self::ServiceInstall => "ServiceInstall",
            Self::Verify => "Verify",
        }
    }

    /// State the machine is in once this step succeeds.
    #[must_use]
    pub const fn reached(self) -> MachineState {
        match self {
            Self::Validate => MachineState::Validate,
            Self::Stage => MachineState::Staged,
            Self::VerifyBuildFiles => MachineState::Verified,
            Self::Connect => MachineState::Connected,
            Self::Provision => MachineState::Provisioned,
            Self::Transfer => MachineState::Transferred,
            Self::Build => MachineState::Built,
            Self::Run => MachineState::Running,
            Self::HealthCheck => MachineState::HealthChecked,
            Self::ProxyConfigure => MachineState::ProxyConfigured,
            Self::ServiceInstall => MachineState::ServiceInstalled,
            Self::Verify => MachineState::Done,
        }
    }

    /// Steps that replace something the previous deployment left on
    /// the host. The snapshot is extended before each of them.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Run | Self::ProxyConfigure | Self::ServiceInstall)
    }

    #[must_use]
    pub const fn retry_policy(self) -> RetryPolicy {
        match self {
            Self::Connect => RetryPolicy::new(5, Duration::from_secs(5)),
            Self::Stage | Self::Provision | Self::Transfer | Self::Build => {
                RetryPolicy::new(3, Duration::from_secs(3))
            }
            _ => RetryPolicy::once(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How often a step is attempted when it fails with a transient
/// error. Deterministic failures are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum StepResult {
    Success,
    Failed(String),
    Skipped,
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("ok"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    Validate,
    Staged,
    Verified,
    Connected,
    Provisioned,
    Transferred,
    Built,
    Running,
    HealthChecked,
    ProxyConfigured,
    ServiceInstalled,
    Done,
    RolledBack,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    #[serde(flatten)]
    pub result: StepResult,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// What a step would do, for `--dry-run`.
#[derive(Debug, Clone, Default)]
pub struct PlannedStep {
    pub actions: Vec<String>,
    pub skipped: bool,
}

/// A rendered file the deployment would install.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeployPlan {
    pub steps: Vec<(Step, PlannedStep)>,
    pub files: Vec<PlannedFile>,
}

impl DeployPlan {
    pub fn push(&mut self, step: Step, actions: Vec<String>) {
        self.steps.push((
            step,
            PlannedStep {
                actions,
                skipped: false,
            },
        ));
    }

    pub fn skip(&mut self, step: Step, reason: &str) {
        self.steps.push((
            step,
            PlannedStep {
                actions: vec![format!("skipped: {reason}")],
                skipped: true,
            },
        ));
    }

    #[must_use]
    pub fn step(&self, step: Step) -> Option<&PlannedStep> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, p)| p)
    }
}

impl fmt::Display for DeployPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (step, planned)) in self.steps.iter().enumerate() {
            writeln!(f, "{}. {step}", index + 1)?;
            for action in &planned.actions {
                writeln!(f, "     {action}")?;
            }
        }
        for file in &self.files {
            writeln!(f)?;
            writeln!(f, "--- {} ---", file.path)?;
            write!(f, "{}", file.content)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeployStatus {
    Success,
    Failed,
}

/// Terminal record of a deployment run.
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub status: DeployStatus,
    pub failed_step: Option<Step>,
    pub final_state: MachineState,
    pub steps: Vec<StepRecord>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub hint: Option<String>,
    pub log_reference: Option<String>,
    pub rolled_back: bool,
}

impl DeployResult {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.status, DeployStatus::Success)
    }

    /// Process exit code. A rolled-back deployment is still a failure.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self.status {
            DeployStatus::Success => 0,
            DeployStatus::Failed => 1,
        }
    }

    #[must_use]
    pub fn record(&self, step: Step) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }
}

impl fmt::Display for DeployResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.steps {
            writeln!(f, "  {:<16} {}", record.step.name(), record.result)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {warning}")?;
        }
        match (self.status, self.failed_step) {
            (DeployStatus::Success, _) => write!(f, "Deployment succeeded")?,
            (DeployStatus::Failed, Some(step)) if self.rolled_back => {
                write!(f, "Deployment failed at {step}; previous deployment restored")?;
            }
            (DeployStatus::Failed, Some(step)) => write!(f, "Deployment failed at {step}")?,
            (DeployStatus::Failed, None) => write!(f, "Deployment failed")?,
        }
        if let Some(log) = &self.log_reference {
            write!(f, " (log: {log})")?;
        }
        Ok(())
    }
}
