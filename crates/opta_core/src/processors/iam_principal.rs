//! Standalone identities: `aws-iam-role`, `aws-iam-user` and
//! `gcp-service-account`.

use serde_json::{json, Value};

use crate::error::{OptaError, OptaResult};
use crate::iam::{GcsBucketGrants, IamAssembler};
use crate::layer::Layer;
use crate::linker::parse_links;
use crate::module::Module;

use super::layer_or_parent_ref;

fn link_targets(layer: &Layer, index: usize) -> OptaResult<Vec<(Module, Vec<Value>)>> {
    let source = &layer.modules[index];
    parse_links(source)?
        .into_iter()
        .map(|link| {
            let target = layer.get_module(&link.target, index)?.ok_or_else(|| {
                OptaError::validation(
                    &source.name,
                    format!("linked module {} does not exist in this layer", link.target),
                )
            })?;
            Ok((target.clone(), link.permissions))
        })
        .collect()
}

pub(super) fn process_aws(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let targets = link_targets(layer, index)?;
    let trusts = match layer.modules[index].module_type.as_str() {
        "aws-iam-role" => Some(kubernetes_trusts(layer, index)?),
        _ => None,
    };

    let module = &mut layer.modules[index];
    let mut iam = IamAssembler::new();
    for (target, permissions) in &targets {
        iam.add_link(&module.name, target, permissions)?;
    }
    module.set("iam_policy", iam.policy_document());
    if let Some(trusts) = trusts {
        module.set("kubernetes_trusts", Value::Array(trusts));
    }
    Ok(())
}

/// Let service accounts of the listed k8s services assume the role through
/// the cluster's OIDC provider.
fn kubernetes_trusts(layer: &Layer, index: usize) -> OptaResult<Vec<Value>> {
    let module = &layer.modules[index];
    let services = match module.get("allowed_k8s_services") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(services)) => services,
        Some(_) => {
            return Err(OptaError::validation(
                &module.name,
                "`allowed_k8s_services` must be a list",
            ))
        }
    };
    if services.is_empty() {
        return Ok(Vec::new());
    }

    let missing_cluster =
        || OptaError::validation(&module.name, "allowed_k8s_services needs an aws-eks cluster");
    let url = layer_or_parent_ref(layer, index, &["aws-eks"], "k8s_openid_provider_url")
        .ok_or_else(missing_cluster)?;
    let arn = layer_or_parent_ref(layer, index, &["aws-eks"], "k8s_openid_provider_arn")
        .ok_or_else(missing_cluster)?;

    services
        .iter()
        .map(|service| {
            let namespace = service.get("namespace").and_then(Value::as_str);
            let name = service.get("service_name").and_then(Value::as_str);
            match (namespace, name) {
                (Some(namespace), Some(name)) => Ok(json!({
                    "open_id_url": url,
                    "open_id_arn": arn,
                    "service_name": name,
                    "namespace": namespace,
                })),
                _ => Err(OptaError::validation(
                    &module.name,
                    format!("allowed_k8s_services entry {} needs namespace and service_name", service),
                )),
            }
        })
        .collect()
}

pub(super) fn process_gcp(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let targets = link_targets(layer, index)?;
    let module = &mut layer.modules[index];
    let mut grants = GcsBucketGrants::default();
    for (target, permissions) in &targets {
        grants.add_link(&module.name, target, permissions)?;
    }
    grants.apply_to(module);
    Ok(())
}
