//! Cluster add-on modules (`aws-k8s-base`, `gcp-k8s-base`, ...).

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::interpolation::module_ref;
use crate::layer::Layer;

/// Username opta writes on the aws-auth entries it owns.
const OPTA_MANAGED: &str = "opta-managed";

pub(super) fn process(layer: &mut Layer, index: usize) -> OptaResult<()> {
    match layer.modules[index].module_type.as_str() {
        "aws-k8s-base" => process_aws(layer, index),
        "gcp-k8s-base" => {
            if let Some(dns) = layer.find_module_before(&["gcp-dns"], index).map(|m| m.name.clone()) {
                let module = &mut layer.modules[index];
                module.set_default("hosted_zone_name", module_ref(&dns, "zone_name"));
                module.set_default("domain", module_ref(&dns, "domain"));
                module.set_default("cert_self_link", module_ref(&dns, "cert_self_link"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn process_aws(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let name = layer.modules[index].name.clone();
    let eks = layer
        .find_module_before(&["aws-eks"], index)
        .map(|m| m.name.clone())
        .ok_or_else(|| OptaError::validation(&name, "aws-k8s-base needs an aws-eks module declared before it"))?;
    let base = layer.find_module_before(&["aws-base"], index).map(|m| m.name.clone());
    let dns = layer.find_module_before(&["aws-dns"], index).map(|m| m.name.clone());
    let ssl = layer
        .find_module_before(&["external-ssl-cert"], index)
        .map(|m| m.name.clone());

    let module = &mut layer.modules[index];
    module.set_default("eks_cluster_name", module_ref(&eks, "k8s_cluster_name"));
    module.set_default("openid_provider_url", module_ref(&eks, "k8s_openid_provider_url"));
    module.set_default("openid_provider_arn", module_ref(&eks, "k8s_openid_provider_arn"));
    if let Some(base) = base {
        module.set_default("s3_log_bucket_name", module_ref(&base, "s3_log_bucket_name"));
    }
    if let Some(dns) = dns {
        module.set_default("domain", module_ref(&dns, "domain"));
        module.set_default("cert_arn", module_ref(&dns, "cert_arn"));
    } else if let Some(ssl) = ssl {
        module.set_default("domain", module_ref(&ssl, "domain"));
        module.set_default("cert_arn", module_ref(&ssl, "certificate_arn"));
    }

    if let Some(arns) = module.get("admin_arns") {
        let arns = arns
            .as_array()
            .ok_or_else(|| OptaError::validation(&name, "`admin_arns` must be a list"))?;
        for arn in arns {
            let arn = arn.as_str().unwrap_or_default();
            if iam_principal_kind(arn).is_none() {
                return Err(OptaError::validation(
                    &name,
                    format!("{} is not an IAM role or user ARN", arn),
                ));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrincipalKind {
    Role,
    User,
}

/// Classify `arn:aws:iam::<account>:role/...` and `...:user/...`.
pub(crate) fn iam_principal_kind(arn: &str) -> Option<PrincipalKind> {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" || parts[2] != "iam" {
        return None;
    }
    let resource = parts[5];
    if resource.starts_with("role/") {
        Some(PrincipalKind::Role)
    } else if resource.starts_with("user/") {
        Some(PrincipalKind::User)
    } else {
        None
    }
}

/// Replace opta's own aws-auth entries with one per admin ARN and keep
/// everything else (node roles, hand-added users) as found.
pub(crate) fn merge_aws_auth(
    map_roles: Vec<Value>,
    map_users: Vec<Value>,
    admin_arns: &[String],
) -> (Vec<Value>, Vec<Value>) {
    let not_ours = |entry: &Value| entry.get("username").and_then(Value::as_str) != Some(OPTA_MANAGED);
    let mut roles: Vec<Value> = map_roles.into_iter().filter(not_ours).collect();
    let mut users: Vec<Value> = map_users.into_iter().filter(not_ours).collect();

    for arn in admin_arns {
        match iam_principal_kind(arn) {
            Some(PrincipalKind::Role) => roles.push(json!({
                "rolearn": arn,
                "username": OPTA_MANAGED,
                "groups": ["system:masters"],
            })),
            Some(PrincipalKind::User) => users.push(json!({
                "userarn": arn,
                "username": OPTA_MANAGED,
                "groups": ["system:masters"],
            })),
            None => {}
        }
    }
    (roles, users)
}

fn yaml_list(data: &BTreeMap<String, String>, key: &str) -> OptaResult<Vec<Value>> {
    match data.get(key) {
        Some(raw) if !raw.trim().is_empty() => {
            let parsed: Option<Vec<Value>> = serde_yaml::from_str(raw)?;
            Ok(parsed.unwrap_or_default())
        }
        _ => Ok(Vec::new()),
    }
}

pub(super) async fn post_hook(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    if module.module_type != "aws-k8s-base" {
        return Ok(());
    }
    let admin_arns: Vec<String> = module
        .get("admin_arns")
        .and_then(Value::as_array)
        .map(|arns| arns.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let target = layer.default_kube_target(&ctx.config);
    let cluster = ctx.cluster(&target).await?;
    let current = cluster
        .get_config_map("kube-system", "aws-auth")
        .await?
        .unwrap_or_default();

    let (roles, users) = merge_aws_auth(
        yaml_list(&current, "mapRoles")?,
        yaml_list(&current, "mapUsers")?,
        &admin_arns,
    );
    debug!("aws-auth: {} role and {} user mappings", roles.len(), users.len());

    let mut data = current;
    data.insert("mapRoles".to_string(), serde_yaml::to_string(&roles)?);
    data.insert("mapUsers".to_string(), serde_yaml::to_string(&users)?);
    cluster.apply_config_map("kube-system", "aws-auth", data).await?;
    info!("Granted cluster admin to {} principals", admin_arns.len());
    Ok(())
}
