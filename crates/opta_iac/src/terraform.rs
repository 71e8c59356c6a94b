//! Terraform CLI driver.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use opta_runner::{CommandRunner, CommandSpec, ExecutionResult, RunConfig, RunnerError};

use crate::error::{IacError, IacResult};
use crate::state::TerraformState;

/// Default plan file name, relative to the working directory.
pub const PLAN_FILE: &str = "tf.plan";

const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "connection reset by peer",
    "connection refused",
    "i/o timeout",
    "TLS handshake timeout",
    "no such host",
    "RequestError: send request failed",
    "unexpected EOF",
    "timeout while waiting",
];

const LOCK_ERROR_PATTERN: &str = "Error acquiring the state lock";

/// Backoff for transient network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0-based): 1, 2, 4, 8 s.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

pub fn is_network_error(message: &str) -> bool {
    NETWORK_ERROR_PATTERNS.iter().any(|p| message.contains(p))
}

/// Pull the lock ID out of Terraform's "Error acquiring the state lock" output.
pub fn parse_lock_id(message: &str) -> Option<String> {
    let re = Regex::new(r"ID:\s+(\S+)").ok()?;
    re.captures(message).map(|c| c[1].to_string())
}

/// Terraform address of a module block.
pub fn module_target(name: &str) -> String {
    format!("module.{}", name)
}

/// Options for `terraform plan`.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    pub targets: Vec<String>,
    pub destroy: bool,
    pub out: Option<String>,
}

impl PlanOptions {
    pub fn targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn destroy(mut self) -> Self {
        self.destroy = true;
        self
    }

    pub fn out(mut self, file: impl Into<String>) -> Self {
        self.out = Some(file.into());
        self
    }
}

/// Options for `terraform apply`.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub targets: Vec<String>,
    pub plan_file: Option<String>,
    pub auto_approve: bool,
}

/// Kind of change Terraform plans for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlanAction {
    Create,
    Update,
    Replace,
    Delete,
    Read,
    NoOp,
}

impl PlanAction {
    fn from_actions(actions: &[String]) -> Self {
        let has = |a: &str| actions.iter().any(|x| x == a);
        match (has("create"), has("delete")) {
            (true, true) => PlanAction::Replace,
            (true, false) => PlanAction::Create,
            (false, true) => PlanAction::Delete,
            _ if has("update") => PlanAction::Update,
            _ if has("read") => PlanAction::Read,
            _ => PlanAction::NoOp,
        }
    }
}

/// A single planned resource change.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    pub address: String,
    pub module: Option<String>,
    pub action: PlanAction,
}

/// Per-module summary of a saved plan.
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub changes: Vec<PlannedChange>,
}

#[derive(Deserialize)]
struct PlanJson {
    #[serde(default)]
    resource_changes: Vec<ResourceChangeJson>,
}

#[derive(Deserialize)]
struct ResourceChangeJson {
    address: String,
    #[serde(default)]
    module_address: Option<String>,
    change: ChangeJson,
}

#[derive(Deserialize)]
struct ChangeJson {
    actions: Vec<String>,
}

impl PlanSummary {
    pub fn parse(plan_json: &str) -> IacResult<Self> {
        let plan: PlanJson = serde_json::from_str(plan_json)?;
        let changes = plan
            .resource_changes
            .into_iter()
            .map(|rc| PlannedChange {
                module: rc
                    .module_address
                    .as_deref()
                    .and_then(|m| m.strip_prefix("module."))
                    .map(|m| m.split('.').next().unwrap_or(m).to_string()),
                address: rc.address,
                action: PlanAction::from_actions(&rc.change.actions),
            })
            .filter(|c| !matches!(c.action, PlanAction::NoOp | PlanAction::Read))
            .collect();
        Ok(Self { changes })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn count(&self, action: PlanAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Counts per module, keyed by module name (`""` for root resources).
    pub fn by_module(&self) -> BTreeMap<String, BTreeMap<PlanAction, usize>> {
        let mut out: BTreeMap<String, BTreeMap<PlanAction, usize>> = BTreeMap::new();
        for change in &self.changes {
            *out.entry(change.module.clone().unwrap_or_default())
                .or_default()
                .entry(change.action)
                .or_default() += 1;
        }
        out
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "No changes. Infrastructure is up-to-date.".to_string();
        }
        let mut lines = Vec::new();
        for (module, counts) in self.by_module() {
            let get = |a: PlanAction| counts.get(&a).copied().unwrap_or(0);
            let name = if module.is_empty() { "(root)".to_string() } else { module };
            lines.push(format!(
                "{}: {} to add, {} to change, {} to replace, {} to destroy",
                name,
                get(PlanAction::Create),
                get(PlanAction::Update),
                get(PlanAction::Replace),
                get(PlanAction::Delete),
            ));
        }
        lines.join("\n")
    }
}

/// Runs terraform in a working directory through a [`CommandRunner`].
pub struct TerraformRunner {
    runner: Arc<dyn CommandRunner>,
    workdir: PathBuf,
    retry: RetryPolicy,
    stream_logs: bool,
    layer_name: String,
}

impl TerraformRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            retry: RetryPolicy::default(),
            stream_logs: false,
            layer_name: String::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Echo terraform output while it runs.
    pub fn streaming(mut self) -> Self {
        self.stream_logs = true;
        self
    }

    /// Layer name used in lock errors.
    pub fn for_layer(mut self, layer_name: impl Into<String>) -> Self {
        self.layer_name = layer_name.into();
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub async fn is_installed(&self) -> bool {
        self.runner.is_available("terraform").await
    }

    pub async fn ensure_installed(&self) -> IacResult<()> {
        if !self.is_installed().await {
            return Err(IacError::TerraformNotAvailable(
                "terraform was not found on PATH".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn version(&self) -> IacResult<String> {
        let result = self.run(vec!["version".into(), "-json".into()], false, false).await?;
        let parsed: Value = serde_json::from_str(&result.stdout)?;
        Ok(parsed["terraform_version"].as_str().unwrap_or_default().to_string())
    }

    pub async fn init(&self, reconfigure: bool) -> IacResult<()> {
        info!("Running terraform init in {:?}", self.workdir);
        let mut args = vec!["init".to_string(), "-input=false".to_string()];
        if reconfigure {
            args.push("-reconfigure".to_string());
        }
        self.run(args, true, self.stream_logs).await?;
        Ok(())
    }

    pub async fn refresh(&self, targets: &[String]) -> IacResult<()> {
        let mut args = vec!["refresh".to_string(), "-input=false".to_string()];
        args.extend(targets.iter().map(|t| format!("-target={}", t)));
        self.run(args, true, self.stream_logs).await?;
        Ok(())
    }

    pub async fn plan(&self, options: &PlanOptions) -> IacResult<()> {
        info!(
            "Running terraform plan ({} targets{})",
            options.targets.len(),
            if options.destroy { ", destroy" } else { "" }
        );
        let mut args = vec![
            "plan".to_string(),
            "-input=false".to_string(),
            "-compact-warnings".to_string(),
            "-lock-timeout=60s".to_string(),
        ];
        if options.destroy {
            args.push("-destroy".to_string());
        }
        if let Some(out) = &options.out {
            args.push(format!("-out={}", out));
        }
        args.extend(options.targets.iter().map(|t| format!("-target={}", t)));
        self.run(args, true, self.stream_logs).await?;
        Ok(())
    }

    pub async fn apply(&self, options: &ApplyOptions) -> IacResult<()> {
        info!("Running terraform apply");
        let mut args = vec![
            "apply".to_string(),
            "-input=false".to_string(),
            "-compact-warnings".to_string(),
        ];
        match &options.plan_file {
            Some(plan) => args.push(plan.clone()),
            None => {
                if options.auto_approve {
                    args.push("-auto-approve".to_string());
                }
                args.extend(options.targets.iter().map(|t| format!("-target={}", t)));
            }
        }
        self.run(args, true, true).await?;
        Ok(())
    }

    pub async fn destroy(&self, targets: &[String], auto_approve: bool) -> IacResult<()> {
        info!("Running terraform destroy on {:?}", targets);
        let mut args = vec![
            "destroy".to_string(),
            "-input=false".to_string(),
            "-compact-warnings".to_string(),
        ];
        if auto_approve {
            args.push("-auto-approve".to_string());
        }
        args.extend(targets.iter().map(|t| format!("-target={}", t)));
        self.run(args, false, true).await?;
        Ok(())
    }

    /// Human readable rendering of a saved plan.
    pub async fn show(&self, plan_file: &str) -> IacResult<String> {
        let args = vec!["show".to_string(), "-no-color".to_string(), plan_file.to_string()];
        Ok(self.run(args, false, false).await?.stdout)
    }

    pub async fn show_summary(&self, plan_file: &str) -> IacResult<PlanSummary> {
        let args = vec!["show".to_string(), "-json".to_string(), plan_file.to_string()];
        let result = self.run(args, false, false).await?;
        PlanSummary::parse(&result.stdout)
    }

    /// Current remote state, or `None` when the layer was never applied.
    pub async fn state_pull(&self) -> IacResult<Option<TerraformState>> {
        let result = self
            .run(vec!["state".to_string(), "pull".to_string()], true, false)
            .await?;
        if result.stdout.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(TerraformState::parse(&result.stdout)?))
    }

    pub async fn get_existing_modules(&self) -> IacResult<BTreeSet<String>> {
        Ok(self
            .state_pull()
            .await?
            .map(|s| s.existing_modules())
            .unwrap_or_default())
    }

    /// Values of every root output.
    pub async fn output(&self) -> IacResult<BTreeMap<String, Value>> {
        let result = self
            .run(vec!["output".to_string(), "-json".to_string()], true, false)
            .await?;
        let raw: BTreeMap<String, Value> = serde_json::from_str(&result.stdout)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, v.get("value").cloned().unwrap_or(Value::Null)))
            .collect())
    }

    pub async fn force_unlock(&self, lock_id: &str) -> IacResult<()> {
        warn!("Force unlocking state lock {}", lock_id);
        let args = vec!["force-unlock".to_string(), "-force".to_string(), lock_id.to_string()];
        self.run(args, false, false).await?;
        Ok(())
    }

    async fn run(&self, args: Vec<String>, retry: bool, stream: bool) -> IacResult<ExecutionResult> {
        let command = args.first().cloned().unwrap_or_default();
        let spec = CommandSpec::new("terraform")
            .args(args)
            .workdir(&self.workdir)
            .env("TF_IN_AUTOMATION", "1");
        let config = if stream { RunConfig::default().stream() } else { RunConfig::default() };
        let attempts = if retry { self.retry.max_attempts.max(1) } else { 1 };

        let mut attempt = 0;
        loop {
            debug!("Executing {}", spec.command_line());
            match self.runner.run(&spec, &config).await {
                Ok(result) => return Ok(result),
                Err(RunnerError::NonZeroExit { stderr, .. }) => {
                    if stderr.contains(LOCK_ERROR_PATTERN) {
                        return Err(IacError::StateLocked {
                            layer: self.layer_name.clone(),
                            lock_id: parse_lock_id(&stderr).unwrap_or_else(|| "unknown".to_string()),
                        });
                    }
                    attempt += 1;
                    if attempt < attempts && is_network_error(&stderr) {
                        let delay = self.retry.delay_for(attempt - 1);
                        warn!(
                            "terraform {} hit a network error, retrying in {:?} ({}/{})",
                            command, delay, attempt, attempts
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(IacError::TerraformFailed {
                        command,
                        message: stderr,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
