//! Container services (`aws-k8s-service`, `gcp-k8s-service`, ...).
//!
//! Processing is split in three parts: ports, links and cloud wiring. Links
//! to datastores become `link_secrets`; links to buckets, queues, topics and
//! tables become grants on the service's cloud identity.

pub mod ports;

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use opta_registry::Cloud;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::iam::{GcsBucketGrants, IamAssembler, AWS_LINKABLE};
use crate::kube::Helm;
use crate::layer::Layer;
use crate::linker::{connection_vars, dedup_link_secrets, handle_link, parse_links};
use crate::module::Module;

use super::layer_or_parent_ref;

const INGRESS_NAMESPACE: &str = "ingress-nginx";
const TCP_CONFIGMAP: &str = "ingress-nginx-tcp";
const MANAGED_LABEL: &str = "opta.dev/managed=true";

/// Pairs of probe settings where only one side may be set.
const EXCLUSIVE_PROBES: [(&str, &str); 3] = [
    ("healthcheck_path", "healthcheck_command"),
    ("liveness_probe_path", "liveness_probe_command"),
    ("readiness_probe_path", "readiness_probe_command"),
];

fn as_count(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn validate(module: &Module) -> OptaResult<()> {
    let min = as_count(module.get("min_containers"));
    let max = as_count(module.get("max_containers"));
    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(OptaError::validation(
                &module.name,
                format!("min_containers ({}) is larger than max_containers ({})", min, max),
            ));
        }
        if min == 0 && max != 0 {
            return Err(OptaError::validation(
                &module.name,
                "min_containers can only be 0 when max_containers is 0 too",
            ));
        }
    }
    for (path, command) in EXCLUSIVE_PROBES {
        if module.get(path).is_some() && module.get(command).is_some() {
            return Err(OptaError::validation(
                &module.name,
                format!("set either {} or {}, not both", path, command),
            ));
        }
    }
    Ok(())
}

/// `env_vars` may be a mapping; Terraform wants a list of name/value pairs.
fn normalize_env_vars(module: &mut Module) {
    if let Some(Value::Object(vars)) = module.get("env_vars") {
        let list: Vec<Value> = vars
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        module.set("env_vars", Value::Array(list));
    }
}

fn normalize_public_uri(module: &mut Module) {
    if let Some(Value::String(uri)) = module.get("public_uri") {
        let uri = uri.clone();
        module.set("public_uri", json!([uri]));
    }
}

pub(super) fn process(layer: &mut Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let service_ports = ports::normalize(&layer.modules[index], ctx.config.multiple_ports_supported)?;
    validate(&layer.modules[index])?;

    let image_tag = layer.variable_str("image_tag").map(str::to_string);
    let image_digest = layer.variable_str("image_digest").map(str::to_string);
    let cloud = layer.cloud;
    let links = parse_links(&layer.modules[index])?;

    // Resolve link targets before borrowing the service mutably.
    let mut targets: Vec<(Module, Vec<Value>)> = Vec::new();
    for link in links {
        let target = layer.get_module(&link.target, index)?.ok_or_else(|| {
            OptaError::validation(
                &layer.modules[index].name,
                format!("linked module {} does not exist in this layer", link.target),
            )
        })?;
        targets.push((target.clone(), link.permissions));
    }

    let wiring = cloud_wiring(layer, index)?;

    let module = &mut layer.modules[index];
    ports::apply(module, &service_ports)?;
    normalize_env_vars(module);
    normalize_public_uri(module);
    if let Some(tag) = image_tag {
        module.set("tag", Value::String(tag));
    }
    if let Some(digest) = image_digest {
        module.set("digest", Value::String(digest));
    }

    let mut iam = IamAssembler::new();
    let mut buckets = GcsBucketGrants::default();
    for (target, permissions) in &targets {
        if let Some(vars) = connection_vars(&target.module_type) {
            handle_link(module, &target.name, permissions, vars)?;
        } else if cloud == Cloud::Aws && target.is_type(AWS_LINKABLE) {
            iam.add_link(&module.name, target, permissions)?;
        } else if cloud == Cloud::Google && target.module_type == "gcp-gcs" {
            buckets.add_link(&module.name, target, permissions)?;
        } else {
            return Err(OptaError::validation(
                &module.name,
                format!("cannot link to {} of type {}", target.name, target.module_type),
            ));
        }
    }
    dedup_link_secrets(module);

    match module.module_type.as_str() {
        "aws-k8s-service" => module.set("iam_policy", iam.policy_document()),
        "gcp-k8s-service" => buckets.apply_to(module),
        _ => {}
    }
    for (input, value) in wiring {
        module.set_default(&input, value);
    }
    debug!("Service {} exposes {} ports", module.name, service_ports.len());
    Ok(())
}

/// Inputs the service needs from the cluster it runs on.
fn cloud_wiring(layer: &Layer, index: usize) -> OptaResult<Map<String, Value>> {
    let module = &layer.modules[index];
    let mut wiring = Map::new();
    let mut wire = |input: &str, types: &[&str], output: &str| -> OptaResult<()> {
        let value = layer_or_parent_ref(layer, index, types, output).ok_or_else(|| {
            OptaError::validation(
                &module.name,
                format!("needs a {} module in this layer or its environment", types.join(" or ")),
            )
        })?;
        wiring.insert(input.to_string(), value);
        Ok(())
    };

    match module.module_type.as_str() {
        "aws-k8s-service" => {
            wire("openid_provider_url", &["aws-eks"], "k8s_openid_provider_url")?;
            wire("openid_provider_arn", &["aws-eks"], "k8s_openid_provider_arn")?;
            wire("eks_cluster_name", &["aws-eks"], "k8s_cluster_name")?;
        }
        "azure-k8s-service" => wire("acr_registry_name", &["azure-base"], "acr_name")?,
        _ => {}
    }
    Ok(wiring)
}

pub(super) async fn pre_hook(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    let target = layer.default_kube_target(&ctx.config);
    let cluster = ctx.cluster(&target).await?;
    let namespace = layer.name.as_str();

    if cluster.namespace_phase(namespace).await?.is_none() {
        info!("Creating namespace {}", namespace);
        let annotations = BTreeMap::from([("linkerd.io/inject".to_string(), "enabled".to_string())]);
        cluster.create_namespace(namespace, &annotations).await?;
    }

    if layer.cloud == Cloud::Helm {
        if cluster.namespace_phase("linkerd").await?.as_deref() != Some("Active") {
            return Err(OptaError::user(
                "Linkerd must be installed in the cluster (namespace `linkerd` is not active)",
            ));
        }
        if !cluster.ingress_class_exists("nginx").await? {
            return Err(OptaError::user(
                "An nginx ingress controller must be installed in the cluster (ingressclass `nginx` not found)",
            ));
        }
    }

    let release = format!("{}-{}", layer.name, module.name);
    let helm = Helm::new(ctx.runner.as_ref(), &target);
    for pending in helm.pending_releases(namespace).await? {
        if pending.name == release && pending.status == "pending-upgrade" {
            return Err(OptaError::user(format!(
                "Helm release {} is stuck in pending-upgrade (revision {}); run `opta force-unlock` to roll it back",
                release, pending.revision
            )));
        }
    }
    Ok(())
}

/// Point the ingress TCP map at this service's TCP ports, dropping entries
/// it no longer has.
pub(crate) fn reconcile_tcp_ports(
    data: &BTreeMap<String, String>,
    namespace: &str,
    service: &str,
    tcp_ports: &[u16],
) -> BTreeMap<String, String> {
    let prefix = format!("{}/{}:", namespace, service);
    let mut updated: BTreeMap<String, String> = data
        .iter()
        .filter(|(_, target)| !target.starts_with(&prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for port in tcp_ports {
        updated.insert(port.to_string(), format!("{}{}", prefix, port));
    }
    updated
}

pub(super) async fn post_hook(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    if !ctx.config.multiple_ports_supported {
        return Ok(());
    }
    let module = &layer.modules[index];
    let tcp_ports: Vec<u16> = module
        .get("ports")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|p| p["type"] == "tcp")
        .filter_map(|p| p["service_port"].as_u64())
        .filter_map(|p| u16::try_from(p).ok())
        .collect();

    let target = layer.default_kube_target(&ctx.config);
    let cluster = ctx.cluster(&target).await?;
    let Some(current) = cluster.get_config_map(INGRESS_NAMESPACE, TCP_CONFIGMAP).await? else {
        if !tcp_ports.is_empty() {
            warn!("{} configmap not found; TCP ports of {} are not exposed", TCP_CONFIGMAP, module.name);
        }
        return Ok(());
    };

    let updated = reconcile_tcp_ports(&current, &layer.name, &module.name, &tcp_ports);
    if updated == current {
        return Ok(());
    }
    cluster
        .apply_config_map(INGRESS_NAMESPACE, TCP_CONFIGMAP, updated)
        .await?;
    Ok(())
}

/// Persistent volume claims outlive the Helm release; remove them.
pub(super) async fn post_delete(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    let target = layer.default_kube_target(&ctx.config);
    let cluster = ctx.cluster(&target).await?;
    let selector = format!(
        "{},app.kubernetes.io/instance={}-{}",
        MANAGED_LABEL, layer.name, module.name
    );
    let deleted = cluster.delete_pvcs(&layer.name, &selector).await?;
    debug!("Deleted {} persistent volume claims of {}", deleted, module.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::Registry;
    use std::path::Path;

    fn service(extra: Value) -> Module {
        let mut entry = json!({"type": "k8s-service", "name": "app", "image": "nginx"});
        if let (Value::Object(entry), Value::Object(extra)) = (&mut entry, extra) {
            entry.extend(extra);
        }
        let registry = Registry::embedded().unwrap();
        Module::new(&registry, Cloud::Aws, &entry, Path::new("/m"), Path::new("/")).unwrap()
    }

    #[test]
    fn test_min_above_max_rejected() {
        let err = validate(&service(json!({"min_containers": 5, "max_containers": 2}))).unwrap_err();
        assert!(err.to_string().contains("larger than max_containers"));
        assert!(validate(&service(json!({"min_containers": "2", "max_containers": "5"}))).is_ok());
    }

    #[test]
    fn test_zero_min_needs_zero_max() {
        assert!(validate(&service(json!({"min_containers": 0, "max_containers": 3}))).is_err());
        assert!(validate(&service(json!({"min_containers": 0, "max_containers": 0}))).is_ok());
    }

    #[test]
    fn test_probe_path_and_command_exclusive() {
        let err = validate(&service(json!({
            "healthcheck_path": "/healthz",
            "healthcheck_command": ["cat", "/tmp/ready"],
        })))
        .unwrap_err();
        assert!(err.to_string().contains("healthcheck_path"));
        assert!(validate(&service(json!({
            "liveness_probe_path": "/live",
            "readiness_probe_command": ["true"],
        })))
        .is_ok());
    }

    #[test]
    fn test_env_vars_map_becomes_list() {
        let mut m = service(json!({"env_vars": {"A": "1", "B": "two"}}));
        normalize_env_vars(&mut m);
        assert_eq!(
            m.get("env_vars").unwrap(),
            &json!([{"name": "A", "value": "1"}, {"name": "B", "value": "two"}])
        );

        let listed = json!([{"name": "C", "value": "3"}]);
        let mut m = service(json!({"env_vars": listed.clone()}));
        normalize_env_vars(&mut m);
        assert_eq!(m.get("env_vars").unwrap(), &listed);
    }

    #[test]
    fn test_public_uri_string_becomes_list() {
        let mut m = service(json!({"public_uri": "app.example.com/api"}));
        normalize_public_uri(&mut m);
        assert_eq!(m.get("public_uri").unwrap(), &json!(["app.example.com/api"]));

        let mut m = service(json!({"public_uri": ["a.example.com", "b.example.com"]}));
        normalize_public_uri(&mut m);
        assert_eq!(m.get("public_uri").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_reconcile_tcp_ports() {
        let data = BTreeMap::from([
            ("5432".to_string(), "app/db:5432".to_string()),
            ("9000".to_string(), "app/web:9000".to_string()),
            ("9100".to_string(), "app/web:9100".to_string()),
        ]);

        let updated = reconcile_tcp_ports(&data, "app", "web", &[9100, 9200]);
        assert_eq!(updated["5432"], "app/db:5432");
        assert!(updated.get("9000").is_none());
        assert_eq!(updated["9100"], "app/web:9100");
        assert_eq!(updated["9200"], "app/web:9200");
    }

    #[test]
    fn test_counts_from_strings() {
        assert_eq!(as_count(Some(&json!("3"))), Some(3));
        assert_eq!(as_count(Some(&json!(0))), Some(0));
        assert_eq!(as_count(Some(&json!("${{vars.n}}"))), None);
    }
}
