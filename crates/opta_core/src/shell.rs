//! Calls to cloud CLIs (`aws`, `gcloud`, `dig`, `openssl`) made by processors.

use serde_json::Value;
use tracing::debug;

use opta_runner::{CommandRunner, CommandSpec, RunConfig, RunnerError};

use crate::error::{OptaError, OptaResult};

/// Run `spec` and return its stdout; a failed call becomes a provider error
/// carrying the tool's stderr.
pub async fn run(runner: &dyn CommandRunner, spec: CommandSpec, operation: &str) -> OptaResult<String> {
    debug!("{}: {}", operation, spec.command_line());
    match runner.run(&spec, &RunConfig::default()).await {
        Ok(result) => Ok(result.stdout),
        Err(RunnerError::NonZeroExit { stderr, .. }) => Err(OptaError::provider(operation, stderr)),
        Err(e) => Err(OptaError::provider(operation, e)),
    }
}

/// Like [`run`], but a failure whose message mentions one of `missing` is `None`.
pub async fn run_optional(
    runner: &dyn CommandRunner,
    spec: CommandSpec,
    operation: &str,
    missing: &[&str],
) -> OptaResult<Option<String>> {
    match run(runner, spec, operation).await {
        Ok(stdout) => Ok(Some(stdout)),
        Err(OptaError::Provider { message, .. }) if missing.iter().any(|m| message.contains(m)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Run and parse stdout as JSON; empty output reads as `null`.
pub async fn run_json(runner: &dyn CommandRunner, spec: CommandSpec, operation: &str) -> OptaResult<Value> {
    let stdout = run(runner, spec, operation).await?;
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_runner::{MockResponse, MockRunner};

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let mock = MockRunner::new().on("dig", MockResponse::failure(9, "connection timed out"));
        let err = run(&mock, CommandSpec::new("dig").args(["+short", "NS", "a.com"]), "Resolving NS")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection timed out"));
    }

    #[tokio::test]
    async fn test_optional_missing() {
        let mock = MockRunner::new().on(
            "delete-log-group",
            MockResponse::failure(254, "An error occurred (ResourceNotFoundException)"),
        );
        let out = run_optional(
            &mock,
            CommandSpec::new("aws").args(["logs", "delete-log-group"]),
            "Deleting log group",
            &["ResourceNotFoundException"],
        )
        .await
        .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_empty_json_is_null() {
        let mock = MockRunner::new();
        let value = run_json(&mock, CommandSpec::new("aws"), "Listing").await.unwrap();
        assert!(value.is_null());
    }
}
