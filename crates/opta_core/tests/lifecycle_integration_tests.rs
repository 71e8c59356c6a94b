//! Integration tests for apply, destroy, force-unlock and
//! generate-terraform against a mocked cloud and terraform.

mod common;

use std::sync::Arc;

use opta_core::{Layer, Lifecycle, LoadOptions, OptaError, Outcome, RunOptions, ScriptedInteraction};
use opta_iac::{InMemoryAws, InMemoryCluster, StructuredConfig};
use opta_runner::{MockResponse, MockRunner};
use serde_json::Value;

use common::{plan_json, state_with_modules, Workspace, ENV_YAML};

const BUCKETS_YAML: &str = r#"
name: parent
org_name: acme
providers:
  aws:
    region: us-east-1
    account_id: "123456789012"
modules:
  - type: aws-base
    name: base
  - type: aws-s3
    name: files
    bucket_name: acme-files
  - type: aws-s3
    name: logs
    bucket_name: acme-logs
"#;

const PARENT_BUCKET: &str = "opta-tf-state-acme-parent";

fn terraform_lines(runner: &MockRunner, subcommand: &str) -> Vec<String> {
    let prefix = format!("terraform {}", subcommand);
    runner
        .command_lines()
        .into_iter()
        .filter(|line| line.starts_with(&prefix))
        .collect()
}

#[tokio::test]
async fn test_apply_stops_at_halting_module_then_applies_everything() {
    let ws = Workspace::new();
    let path = ws.write("staging.yaml", ENV_YAML);
    let runner = MockRunner::new().on("show -json", MockResponse::success(plan_json(&["base"], "create")));
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let plans = terraform_lines(&runner, "plan");
    assert_eq!(plans.len(), 2);
    assert!(plans[0].contains("-target=module.base -target=module.k8scluster"));
    assert!(!plans[1].contains("-target"));
    assert_eq!(terraform_lines(&runner, "apply").len(), 2);

    let upload = ws
        .aws
        .object("opta-tf-state-acme-staging", "opta_config/staging")
        .unwrap();
    let uploaded: StructuredConfig = serde_json::from_slice(&upload).unwrap();
    assert!(uploaded
        .defaults_for("k8scluster")
        .iter()
        .any(|d| d.input_name == "k8s_version" && d.force_update_default_counter == 2));
    assert!(!ctx.config.main_tf_path().exists());
}

#[tokio::test]
async fn test_apply_skips_stages_whose_modules_exist() {
    let ws = Workspace::new();
    let path = ws.write("staging.yaml", ENV_YAML);
    let runner = MockRunner::new()
        .on("state pull", MockResponse::success(state_with_modules(&["base", "k8scluster"])))
        .on("show -json", MockResponse::success(plan_json(&[], "create")));
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default())
        .await
        .unwrap();

    // One untargeted plan with nothing to change: no apply and no prompt.
    let plans = terraform_lines(&runner, "plan");
    assert_eq!(plans.len(), 1);
    assert!(!plans[0].contains("-target"));
    assert!(terraform_lines(&runner, "apply").is_empty());
}

#[tokio::test]
async fn test_declined_apply_is_cancelled() {
    let ws = Workspace::new();
    let path = ws.write("staging.yaml", BUCKETS_YAML);
    let runner = MockRunner::new().on("show -json", MockResponse::success(plan_json(&["files"], "create")));
    let interaction = Arc::new(ScriptedInteraction::new().confirm_with(false));
    let ctx = ws.context_with(&runner, interaction.clone());
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(interaction.questions().len(), 1);
    assert!(interaction.shown()[0].contains("files: 1 to add"));
    assert!(terraform_lines(&runner, "apply").is_empty());
    assert!(ws.aws.object(PARENT_BUCKET, "opta_config/parent").is_none());
}

#[tokio::test]
async fn test_apply_refuses_locked_state() {
    let ws = Workspace::new().with_aws(InMemoryAws::new().with_lock(
        PARENT_BUCKET,
        "opta-tf-state-acme-parent/parent",
        r#"{"ID":"9db590f1"}"#,
    ));
    let path = ws.write("staging.yaml", BUCKETS_YAML);
    let runner = MockRunner::new();
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let err = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap_err();
    assert!(matches!(err, OptaError::StateLocked { ref lock_id, .. } if lock_id == "9db590f1"));
    assert!(terraform_lines(&runner, "init").is_empty());
}

#[tokio::test]
async fn test_child_apply_needs_applied_parent() {
    let ws = Workspace::new();
    ws.write("staging.yaml", ENV_YAML);
    let path = ws.write(
        "app.yaml",
        "name: app\nenvironments:\n  - name: staging\n    path: staging.yaml\nmodules: []\n",
    );
    let runner = MockRunner::new();
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let err = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap_err();
    assert!(err.is_user_error());
    assert!(err.to_string().contains("Layer staging has not been applied yet"));
}

#[tokio::test]
async fn test_destroy_runs_in_reverse_module_order() {
    let parent_config = serde_json::to_string(&StructuredConfig::new("0.1.0", BUCKETS_YAML)).unwrap();
    let ws = Workspace::new().with_aws(
        InMemoryAws::new()
            .with_object(PARENT_BUCKET, "opta_config/parent", parent_config)
            .with_object(PARENT_BUCKET, "parent", r#"{"serial": 3, "resources": []}"#),
    );
    let path = ws.write("parent.yaml", BUCKETS_YAML);
    let runner = MockRunner::new()
        .on("state pull", MockResponse::success(state_with_modules(&["base", "files", "logs"])))
        .on("show -json", MockResponse::success(plan_json(&["base", "files", "logs"], "delete")));
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx)
        .destroy(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let targets: Vec<String> = terraform_lines(&runner, "destroy")
        .iter()
        .filter_map(|line| line.split("-target=").nth(1).map(str::to_string))
        .collect();
    assert_eq!(targets, vec!["module.logs", "module.files", "module.base"]);
    assert!(ws.aws.object(PARENT_BUCKET, "opta_config/parent").is_none());
    assert!(ws.aws.object(PARENT_BUCKET, "parent").is_none());
    assert!(ws.aws.bucket_deleted(PARENT_BUCKET));
    assert!(ws.aws.table_deleted(PARENT_BUCKET));
}

#[tokio::test]
async fn test_destroy_refuses_while_child_exists() {
    let parent_config = StructuredConfig::new("0.1.0", BUCKETS_YAML);
    let child_config = StructuredConfig::new("0.1.0", "name: child\n").with_parent(Some("parent".into()));
    let ws = Workspace::new().with_aws(
        InMemoryAws::new()
            .with_object(PARENT_BUCKET, "opta_config/parent", serde_json::to_string(&parent_config).unwrap())
            .with_object(PARENT_BUCKET, "opta_config/child", serde_json::to_string(&child_config).unwrap()),
    );
    let path = ws.write("parent.yaml", BUCKETS_YAML);
    let runner = MockRunner::new();
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let err = Lifecycle::new(&ctx)
        .destroy(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap_err();
    assert!(err.is_user_error());
    let message = err.to_string();
    assert!(message.contains("Found the following services that depend on this environment"));
    assert!(message.ends_with("child"));
    assert!(runner.command_lines().iter().all(|line| !line.starts_with("terraform")));
    assert!(!ws.aws.bucket_deleted(PARENT_BUCKET));
}

fn locked_parent() -> InMemoryAws {
    InMemoryAws::new().with_lock(PARENT_BUCKET, "opta-tf-state-acme-parent/parent", r#"{"ID":"lock-42"}"#)
}

#[tokio::test]
async fn test_force_unlock_after_two_confirmations() {
    let ws = Workspace::new().with_aws(locked_parent());
    let path = ws.write("parent.yaml", BUCKETS_YAML);
    let runner = MockRunner::new();
    let interaction = Arc::new(ScriptedInteraction::approving(2));
    let ctx = ws.context_with(&runner, interaction.clone());
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx).force_unlock(&mut layer).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(interaction.questions().len(), 2);
    assert!(runner.was_called("terraform force-unlock -force lock-42"));
    // terraform released the lock itself; the item is left to it.
    assert!(ws.aws.has_lock(PARENT_BUCKET, "opta-tf-state-acme-parent/parent"));
}

#[tokio::test]
async fn test_force_unlock_falls_back_to_deleting_the_lock() {
    let ws = Workspace::new().with_aws(locked_parent());
    let path = ws.write("parent.yaml", BUCKETS_YAML);
    let runner = MockRunner::new().on("force-unlock", MockResponse::failure(1, "Error: failed to unlock state"));
    let ctx = ws.context_with(&runner, Arc::new(ScriptedInteraction::approving(2)));
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    Lifecycle::new(&ctx).force_unlock(&mut layer).await.unwrap();
    assert!(!ws.aws.has_lock(PARENT_BUCKET, "opta-tf-state-acme-parent/parent"));
}

#[tokio::test]
async fn test_force_unlock_declined() {
    let ws = Workspace::new();
    let path = ws.write("parent.yaml", BUCKETS_YAML);
    let runner = MockRunner::new();
    let ctx = ws.context_with(&runner, Arc::new(ScriptedInteraction::new().confirm_with(false)));
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx).force_unlock(&mut layer).await.unwrap();
    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn test_generate_terraform_exports_portable_files() {
    let ws = Workspace::new();
    let path = ws.write("parent.yaml", BUCKETS_YAML);
    ws.write(
        "modules/aws_s3/tf_module/main.tf",
        "resource \"aws_s3_bucket\" \"bucket\" {\n  bucket = var.bucket_name\n}\n",
    );
    let runner = MockRunner::new();
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();
    let out = ws.root().join("out");

    let written = Lifecycle::new(&ctx)
        .generate_terraform(&mut layer, &out, false)
        .await
        .unwrap();
    assert!(written.contains(&out.join("module-files.tf.json")));
    assert!(out.join("modules/aws_s3/tf_module/main.tf").exists());
    assert!(out.join("modules/aws_s3/tf_module/opta_tags_override.tf.json").exists());
    assert_eq!(runner.call_count(), 0);

    let read = |name: &str| -> Value {
        serde_json::from_str(&std::fs::read_to_string(out.join(name)).unwrap()).unwrap()
    };
    assert_eq!(read("module-files.tf.json")["module"]["files"]["source"], "./modules/aws_s3/tf_module");
    // aws-base was not packaged here, so it keeps a path relative to the output.
    assert_eq!(read("module-base.tf.json")["module"]["base"]["source"], "../modules/aws_base/tf_module");
    assert_eq!(
        read("terraform.tf.json")["terraform"]["backend"]["local"]["path"],
        "./tfstate/parent.tfstate"
    );
    let readme = std::fs::read_to_string(out.join("README.md")).unwrap();
    assert!(readme.contains("terraform plan -out=tf.plan && terraform apply tf.plan"));

    // A second export into the same directory needs `replace`.
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();
    let err = Lifecycle::new(&ctx)
        .generate_terraform(&mut layer, &out, false)
        .await
        .unwrap_err();
    assert!(err.is_user_error());
    Lifecycle::new(&ctx)
        .generate_terraform(&mut layer, &out, true)
        .await
        .unwrap();
}

const HELM_YAML: &str = r#"
name: app
org_name: acme
providers:
  helm:
    kube_context: kind-dev
    kubeconfig: /home/dev/.kube/config
modules:
  - type: k8s-service
    name: web
    image: nginx
    port:
      http: 80
"#;

fn mesh_cluster() -> InMemoryCluster {
    InMemoryCluster::new()
        .with_namespace("linkerd", "Active")
        .with_ingress_class("nginx")
}

#[tokio::test]
async fn test_helm_apply_prepares_namespace_and_stores_config() {
    let ws = Workspace::new().with_cluster(mesh_cluster());
    let path = ws.write("app.yaml", HELM_YAML);
    let runner = MockRunner::new().on("show -json", MockResponse::success(plan_json(&["web"], "create")));
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let annotations = ws.cluster.namespace_annotations("app").unwrap();
    assert_eq!(annotations["linkerd.io/inject"], "enabled");
    assert!(runner.was_called("helm --kubeconfig=/home/dev/.kube/config --kube-context=kind-dev list --pending"));

    let stored = ws.cluster.secret("default", "opta-config-app").unwrap();
    let config: StructuredConfig = serde_json::from_slice(&stored["config"]).unwrap();
    assert!(config.original_spec.contains("name: web"));
    assert_eq!(ws.cluster.secret_labels("default", "opta-config-app").unwrap()["opta.dev/config"], "true");
}

#[tokio::test]
async fn test_helm_apply_needs_service_mesh() {
    let ws = Workspace::new().with_cluster(InMemoryCluster::new().with_ingress_class("nginx"));
    let path = ws.write("app.yaml", HELM_YAML);
    let runner = MockRunner::new().on("show -json", MockResponse::success(plan_json(&["web"], "create")));
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let err = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap_err();
    assert!(err.is_user_error());
    assert!(err.to_string().contains("Linkerd must be installed"));
    assert!(terraform_lines(&runner, "apply").is_empty());
    assert!(ws.cluster.secret("default", "opta-config-app").is_none());
}

#[tokio::test]
async fn test_helm_apply_refuses_held_lease() {
    let ws = Workspace::new().with_cluster(mesh_cluster().with_lease(
        "default",
        "lock-tfstate-default-app",
        "4a7b1c2d",
    ));
    let path = ws.write("app.yaml", HELM_YAML);
    let runner = MockRunner::new();
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let err = Lifecycle::new(&ctx)
        .apply(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap_err();
    assert!(matches!(err, OptaError::StateLocked { ref lock_id, .. } if lock_id == "4a7b1c2d"));
}

#[tokio::test]
async fn test_helm_destroy_removes_service_volumes() {
    let config = serde_json::to_vec(&StructuredConfig::new("0.1.0", HELM_YAML)).unwrap();
    let instance = [("opta.dev/managed", "true"), ("app.kubernetes.io/instance", "app-web")];
    let ws = Workspace::new().with_cluster(
        mesh_cluster()
            .with_secret("default", "opta-config-app", "config", config)
            .with_secret("default", "tfstate-default-app", "tfstate", "{}")
            .with_pvc("app", "data-web-0", &instance)
            .with_pvc("app", "data-other-0", &[("opta.dev/managed", "true")]),
    );
    let path = ws.write("app.yaml", HELM_YAML);
    let runner = MockRunner::new()
        .on("state pull", MockResponse::success(state_with_modules(&["web"])))
        .on("show -json", MockResponse::success(plan_json(&["web"], "delete")));
    let ctx = ws.context(&runner);
    let mut layer = Layer::load_from_yaml(&ctx, &path, &LoadOptions::default()).unwrap();

    let outcome = Lifecycle::new(&ctx)
        .destroy(&mut layer, &RunOptions::default().auto_approve())
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(ws.cluster.pvc_names("app"), vec!["data-other-0".to_string()]);
    assert!(ws.cluster.secret("default", "opta-config-app").is_none());
    assert!(ws.cluster.secret("default", "tfstate-default-app").is_none());
}
