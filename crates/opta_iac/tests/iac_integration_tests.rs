//! Integration tests for the IaC crate.

use std::sync::Arc;
use std::time::Duration;

use opta_iac::{
    client_for, module_target, ApplyOptions, CloudConnector, InMemoryAws, PlanOptions, RetryPolicy,
    StateLocation, StructuredConfig, TerraformRunner, UsedDefault, PLAN_FILE,
};
use opta_registry::Cloud;
use opta_runner::MockRunner;
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn test_stepwise_apply_command_sequence() {
    let mock = MockRunner::new();
    let tf = TerraformRunner::new(Arc::new(mock.clone()), "/work")
        .with_retry(RetryPolicy::default().with_base_delay(Duration::ZERO));

    tf.init(false).await.unwrap();
    tf.plan(
        &PlanOptions::default()
            .targets(vec![module_target("base")])
            .out(PLAN_FILE),
    )
    .await
    .unwrap();
    tf.apply(&ApplyOptions {
        plan_file: Some(PLAN_FILE.to_string()),
        ..Default::default()
    })
    .await
    .unwrap();

    let lines = mock.command_lines();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("terraform init"));
    assert!(lines[1].contains("-target=module.base"));
    assert!(lines[2].ends_with("tf.plan"));
    assert!(mock
        .get_calls()
        .iter()
        .all(|c| c.env.get("TF_IN_AUTOMATION").map(String::as_str) == Some("1")));
}

#[tokio::test]
async fn test_local_structured_config_keeps_defaults() {
    let home = tempdir().unwrap();
    let location = StateLocation::new(Cloud::Local, "localopta", "local").with_opta_home(home.path());
    let client = client_for(location, &CloudConnector::new(Arc::new(MockRunner::new())));

    let mut defaults = std::collections::BTreeMap::new();
    defaults.insert(
        "base".to_string(),
        vec![UsedDefault {
            input_name: "linkerd_enabled".to_string(),
            default_value: json!(true),
            force_update_default_counter: 0,
        }],
    );
    let config = StructuredConfig::new("0.1.0", "name: localopta\n").with_defaults(defaults);
    client.upload_opta_config(&config).await.unwrap();

    let read = client.get_remote_config().await.unwrap().unwrap();
    assert_eq!(read.defaults_for("base").len(), 1);
    assert_eq!(read.defaults_for("base")[0].default_value, json!(true));
    assert!(read.defaults_for("missing").is_empty());
}

#[tokio::test]
async fn test_aws_remote_state_outputs() {
    let state = json!({
        "serial": 9,
        "outputs": {"name_servers": {"value": ["ns-1.awsdns.com.", "ns-2.awsdns.net."]}},
        "resources": []
    });
    let aws = InMemoryAws::new().with_object("opta-tf-state-acme-staging", "staging", state.to_string());
    let connector = CloudConnector::new(Arc::new(MockRunner::new())).with_aws(Arc::new(aws));
    let location = StateLocation::new(Cloud::Aws, "staging", "opta-tf-state-acme-staging");
    let client = client_for(location, &connector);
    let state = client.get_remote_state().await.unwrap().unwrap();
    assert_eq!(
        state.output("name_servers"),
        Some(&json!(["ns-1.awsdns.com.", "ns-2.awsdns.net."]))
    );
}
