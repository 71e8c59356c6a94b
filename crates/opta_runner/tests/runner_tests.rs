//! Integration tests for the command execution layer.

use std::sync::Arc;

use opta_runner::{
    CommandRunner, CommandSpec, MockResponse, MockRunner, RunConfig, RunnerError,
};

/// Shared runners behave like the orchestration code uses them: behind an Arc.
#[tokio::test]
async fn test_mock_runner_behind_trait_object() {
    let mock = MockRunner::new()
        .on("aws s3 ls", MockResponse::success("PRE opta_config/\n"));
    let runner: Arc<dyn CommandRunner> = Arc::new(mock.clone());

    let spec = CommandSpec::new("aws").args(["s3", "ls", "s3://opta-tf-state-acme-prod/"]);
    let result = runner.run(&spec, &RunConfig::default()).await.unwrap();

    assert!(result.success());
    assert!(result.stdout.contains("opta_config/"));
    assert!(mock.was_called("s3://opta-tf-state-acme-prod/"));
}

#[tokio::test]
async fn test_mock_runner_json_output() {
    let runner = MockRunner::new().on(
        "helm list",
        MockResponse::success(r#"[{"name":"app","status":"deployed"}]"#),
    );
    let spec = CommandSpec::new("helm").args(["list", "-o", "json"]);
    let result = runner.run(&spec, &RunConfig::default()).await.unwrap();

    let releases: Vec<serde_json::Value> = result.json().unwrap();
    assert_eq!(releases[0]["status"], "deployed");
}

#[tokio::test]
async fn test_mock_runner_nonzero_exit_carries_stderr() {
    let runner = MockRunner::new().on(
        "terraform apply",
        MockResponse::failure(1, "Error acquiring the state lock\n"),
    );
    let spec = CommandSpec::new("terraform").args(["apply", "tf.plan"]);

    match runner.run(&spec, &RunConfig::default()).await {
        Err(RunnerError::NonZeroExit { stderr, .. }) => {
            assert_eq!(stderr, "Error acquiring the state lock");
        }
        other => panic!("unexpected result: {:?}", other.map(|r| r.exit_code)),
    }
}

#[tokio::test]
async fn test_mock_runner_records_order() {
    let runner = MockRunner::new();
    for args in [["init", "-input=false"], ["plan", "-input=false"]] {
        let spec = CommandSpec::new("terraform").args(args);
        runner.run(&spec, &RunConfig::default()).await.unwrap();
    }
    assert_eq!(
        runner.command_lines(),
        vec!["terraform init -input=false", "terraform plan -input=false"]
    );
}
