//! Kubernetes cluster modules (`aws-eks`, `gcp-gke`, `azure-aks`).

use serde_json::Value;
use tracing::{debug, info, warn};

use opta_runner::CommandSpec;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::interpolation::module_ref;
use crate::layer::Layer;
use crate::shell;

/// Base type a cluster builds on and the base outputs it consumes, keyed
/// by input name.
fn base_wiring(module_type: &str) -> Option<(&'static str, &'static [&'static str])> {
    match module_type {
        "aws-eks" => Some(("aws-base", &["vpc_id", "private_subnet_ids", "kms_account_key_arn"])),
        "gcp-gke" => Some((
            "gcp-base",
            &["vpc_self_link", "private_subnet_self_link", "k8s_master_ipv4_cidr_block"],
        )),
        "azure-aks" => Some(("azure-base", &["vpc_name", "private_subnet_name"])),
        _ => None,
    }
}

pub(super) fn process(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let module_type = layer.modules[index].module_type.clone();
    let Some((base_type, inputs)) = base_wiring(&module_type) else {
        return Ok(());
    };

    let base_name = layer
        .find_module_before(&[base_type], index)
        .map(|m| m.name.clone())
        .ok_or_else(|| {
            OptaError::validation(
                &layer.modules[index].name,
                format!("{} needs a {} module declared before it", module_type, base_type),
            )
        })?;
    let cluster_name = format!("opta-{}", layer.root().name);

    let module = &mut layer.modules[index];
    for input in inputs {
        module.set_default(input, module_ref(&base_name, input));
    }
    module.set("cluster_name", Value::String(cluster_name));
    Ok(())
}

/// Clean up what EKS leaves behind once the cluster is gone: detached
/// network interfaces, security groups tagged for the cluster and the
/// control plane log group.
pub(super) async fn post_delete(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    if layer.modules[index].module_type != "aws-eks" {
        return Ok(());
    }
    let region = layer
        .provider_str("region")
        .ok_or_else(|| OptaError::user("The aws provider block needs a `region`"))?;
    let cluster = format!("opta-{}", layer.root().name);
    let runner = ctx.runner.as_ref();
    info!("Cleaning up leftovers of cluster {}", cluster);

    let interfaces = shell::run_json(
        runner,
        CommandSpec::new("aws").args([
            "ec2".to_string(),
            "describe-network-interfaces".to_string(),
            "--region".to_string(),
            region.clone(),
            "--filters".to_string(),
            format!("Name=tag:cluster.k8s.amazonaws.com/name,Values={}", cluster),
            "--output".to_string(),
            "json".to_string(),
        ]),
        "Listing cluster network interfaces",
    )
    .await?;
    for eni in interfaces["NetworkInterfaces"].as_array().into_iter().flatten() {
        let (Some(id), Some("available")) = (
            eni["NetworkInterfaceId"].as_str(),
            eni["Status"].as_str(),
        ) else {
            continue;
        };
        debug!("Deleting network interface {}", id);
        shell::run(
            runner,
            CommandSpec::new("aws").args([
                "ec2",
                "delete-network-interface",
                "--network-interface-id",
                id,
                "--region",
                region.as_str(),
            ]),
            "Deleting network interface",
        )
        .await?;
    }

    let groups = shell::run_json(
        runner,
        CommandSpec::new("aws").args([
            "ec2".to_string(),
            "describe-security-groups".to_string(),
            "--region".to_string(),
            region.clone(),
            "--filters".to_string(),
            format!("Name=tag:kubernetes.io/cluster/{},Values=owned", cluster),
            "--output".to_string(),
            "json".to_string(),
        ]),
        "Listing cluster security groups",
    )
    .await?;
    for group in groups["SecurityGroups"].as_array().into_iter().flatten() {
        let Some(id) = group["GroupId"].as_str() else {
            continue;
        };
        debug!("Deleting security group {}", id);
        if let Err(e) = shell::run(
            runner,
            CommandSpec::new("aws").args([
                "ec2",
                "delete-security-group",
                "--group-id",
                id,
                "--region",
                region.as_str(),
            ]),
            "Deleting security group",
        )
        .await
        {
            warn!("Could not delete security group {}: {}", id, e);
        }
    }

    let log_group = format!("/aws/eks/{}/cluster", cluster);
    let deleted = shell::run_optional(
        runner,
        CommandSpec::new("aws").args([
            "logs",
            "delete-log-group",
            "--log-group-name",
            log_group.as_str(),
            "--region",
            region.as_str(),
        ]),
        "Deleting cluster log group",
        &["ResourceNotFoundException"],
    )
    .await?;
    if deleted.is_none() {
        debug!("Log group {} was already gone", log_group);
    }
    Ok(())
}
