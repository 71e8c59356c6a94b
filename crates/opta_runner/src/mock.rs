//! Mock command runner for testing.
//!
//! Provides a configurable mock implementation of the CommandRunner trait
//! so cloud, Kubernetes and Terraform interactions can be tested without
//! the real binaries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::config::{CommandSpec, RunConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::runner::{CommandRunner, ExecutionResult};

/// Predefined mock response for a command execution.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 10,
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 10,
        }
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub program: String,
    pub args: Vec<String>,
    pub command_line: String,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
struct MockRule {
    pattern: String,
    responses: Vec<MockResponse>,
    hits: usize,
}

/// Mock command runner for testing.
///
/// Responses are chosen by the first rule whose pattern is a substring of
/// the rendered command line. A rule registered several times replays its
/// responses in order and then repeats the last one. Commands matching no
/// rule consume the sequential response list, and succeed with empty
/// output once it is exhausted.
#[derive(Clone)]
pub struct MockRunner {
    available: Arc<RwLock<Vec<String>>>,
    rules: Arc<RwLock<Vec<MockRule>>>,
    responses: Arc<RwLock<Vec<MockResponse>>>,
    response_index: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    simulate_failure: Arc<RwLock<Option<String>>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self {
            available: Arc::new(RwLock::new(Vec::new())),
            rules: Arc::new(RwLock::new(Vec::new())),
            responses: Arc::new(RwLock::new(Vec::new())),
            response_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            simulate_failure: Arc::new(RwLock::new(None)),
        }
    }

    /// Mark a program as installed.
    pub fn with_program(self, program: impl Into<String>) -> Self {
        self.available.write().push(program.into());
        self
    }

    /// Respond to commands containing `pattern`.
    pub fn on(self, pattern: impl Into<String>, response: MockResponse) -> Self {
        let pattern = pattern.into();
        {
            let mut rules = self.rules.write();
            if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
                rule.responses.push(response);
            } else {
                rules.push(MockRule {
                    pattern,
                    responses: vec![response],
                    hits: 0,
                });
            }
        }
        self
    }

    /// Add a mock response for the next unmatched call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Set a failure to simulate for every call.
    pub fn simulate_failure(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Get the rendered command lines, in call order.
    pub fn command_lines(&self) -> Vec<String> {
        self.captured_calls
            .read()
            .iter()
            .map(|c| c.command_line.clone())
            .collect()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// Check if any call contained `pattern`.
    pub fn was_called(&self, pattern: &str) -> bool {
        self.captured_calls
            .read()
            .iter()
            .any(|c| c.command_line.contains(pattern))
    }

    /// Get calls containing `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.command_line.contains(pattern))
            .cloned()
            .collect()
    }

    fn record_call(&self, spec: &CommandSpec) {
        self.captured_calls.write().push(CapturedCall {
            program: spec.program.clone(),
            args: spec.args.clone(),
            command_line: spec.command_line(),
            env: spec.env.clone(),
            stdin: spec.stdin.clone(),
        });
    }

    fn next_response(&self, command_line: &str) -> MockResponse {
        {
            let mut rules = self.rules.write();
            if let Some(rule) = rules
                .iter_mut()
                .find(|r| command_line.contains(r.pattern.as_str()))
            {
                let index = rule.hits.min(rule.responses.len().saturating_sub(1));
                rule.hits += 1;
                if let Some(response) = rule.responses.get(index) {
                    return response.clone();
                }
            }
        }

        let responses = self.responses.read();
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index)
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }

    fn check_failure(&self) -> RunnerResult<()> {
        if let Some(msg) = self.simulate_failure.read().clone() {
            return Err(RunnerError::ExecutionFailed(msg));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn is_available(&self, program: &str) -> bool {
        self.available.read().iter().any(|p| p == program)
    }

    async fn run(&self, spec: &CommandSpec, config: &RunConfig) -> RunnerResult<ExecutionResult> {
        self.record_call(spec);
        self.check_failure()?;

        let command = spec.command_line();
        let response = self.next_response(&command);
        if config.check && response.exit_code != 0 {
            return Err(RunnerError::NonZeroExit {
                command,
                exit_code: response.exit_code,
                stderr: response.stderr.trim().to_string(),
            });
        }

        let started_at = Utc::now();
        let finished_at = started_at + chrono::Duration::milliseconds(response.duration_ms as i64);
        Ok(ExecutionResult {
            command,
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            started_at,
            finished_at,
            duration_ms: response.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runner_rule_matching() {
        let runner = MockRunner::new()
            .on("helm list --pending", MockResponse::success("[]"))
            .add_response(MockResponse::success("fallback"));

        let pending = CommandSpec::new("helm").args(["list", "--pending"]);
        let result = runner.run(&pending, &RunConfig::default()).await.unwrap();
        assert_eq!(result.stdout, "[]");

        let other = CommandSpec::new("helm").arg("version");
        let result = runner.run(&other, &RunConfig::default()).await.unwrap();
        assert_eq!(result.stdout, "fallback");
    }

    #[tokio::test]
    async fn test_mock_runner_rule_sequence_repeats_last() {
        let runner = MockRunner::new()
            .on("terraform plan", MockResponse::failure(1, "connection reset by peer"))
            .on("terraform plan", MockResponse::success("ok"));

        let spec = CommandSpec::new("terraform").arg("plan");
        let config = RunConfig::default().unchecked();
        assert_eq!(runner.run(&spec, &config).await.unwrap().exit_code, 1);
        assert_eq!(runner.run(&spec, &config).await.unwrap().stdout, "ok");
        assert_eq!(runner.run(&spec, &config).await.unwrap().stdout, "ok");
    }

    #[tokio::test]
    async fn test_mock_runner_checked_failure() {
        let runner = MockRunner::new().on("aws", MockResponse::failure(255, "AccessDenied"));
        let spec = CommandSpec::new("aws").args(["s3", "ls"]);
        let result = runner.run(&spec, &RunConfig::default()).await;
        assert!(matches!(result, Err(RunnerError::NonZeroExit { exit_code: 255, .. })));
    }

    #[tokio::test]
    async fn test_mock_runner_captures_calls() {
        let runner = MockRunner::new();
        let spec = CommandSpec::new("terraform")
            .args(["apply", "-input=false"])
            .env("KUBECONFIG", "/tmp/kc")
            .stdin("{}");
        runner.run(&spec, &RunConfig::default()).await.unwrap();

        let calls = runner.calls_matching("terraform apply");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stdin.as_deref(), Some("{}"));
        assert_eq!(calls[0].env.get("KUBECONFIG").map(String::as_str), Some("/tmp/kc"));
    }

    #[tokio::test]
    async fn test_mock_runner_availability() {
        let runner = MockRunner::new().with_program("terraform");
        assert!(runner.is_available("terraform").await);
        assert!(!runner.is_available("helm").await);
    }

    #[tokio::test]
    async fn test_mock_runner_failure_simulation() {
        let runner = MockRunner::new().simulate_failure("simulated error");
        let spec = CommandSpec::new("terraform").arg("init");
        assert!(runner.run(&spec, &RunConfig::default()).await.is_err());
        assert_eq!(runner.call_count(), 1);
    }
}
