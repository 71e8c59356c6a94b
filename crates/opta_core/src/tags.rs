//! Tag-override side files.
//!
//! Every AWS resource declared by a packaged module gets an override that
//! stamps it with `opta`, `layer` and `tf_address` tags, so opta can later
//! recognise what it owns. The override lives next to the module's `.tf`
//! files, and several instances of one module type share it, so layer and
//! module names come from the module's `layer_name` / `module_name` variables.

use std::path::Path;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{OptaError, OptaResult};

pub const TAG_OVERRIDE_FILE: &str = "opta_tags_override.tf.json";

/// AWS resource types that reject a `tags` argument.
const UNTAGGABLE: &[&str] = &[
    "aws_iam_policy_attachment",
    "aws_iam_role_policy",
    "aws_iam_role_policy_attachment",
    "aws_iam_user_policy",
    "aws_iam_user_policy_attachment",
    "aws_route",
    "aws_route_table_association",
    "aws_security_group_rule",
    "aws_s3_bucket_policy",
    "aws_s3_bucket_public_access_block",
    "aws_kms_alias",
    "aws_route53_record",
    "aws_acm_certificate_validation",
    "aws_eks_addon",
    "aws_sns_topic_subscription",
    "aws_sqs_queue_policy",
    "aws_lambda_permission",
    "aws_cloudwatch_log_subscription_filter",
    "aws_ssm_parameter",
];

/// `(resource_type, resource_name)` pairs declared in `.tf` files of `module_dir`.
pub fn declared_resources(module_dir: &Path) -> OptaResult<Vec<(String, String)>> {
    let re = Regex::new(r#"(?m)^\s*resource\s+"([a-z0-9_]+)"\s+"([A-Za-z0-9_-]+)""#)
        .map_err(|e| OptaError::provider("Compiling resource pattern", e))?;
    let pattern = module_dir.join("*.tf");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern)
        .map_err(|e| OptaError::provider("Listing module files", e))?;

    let mut resources = Vec::new();
    for path in paths.flatten() {
        let content = std::fs::read_to_string(&path)?;
        for caps in re.captures_iter(&content) {
            resources.push((caps[1].to_string(), caps[2].to_string()));
        }
    }
    resources.sort();
    resources.dedup();
    Ok(resources)
}

/// The override document for a module directory, or `None` if it declares
/// nothing taggable.
pub fn tag_override(module_dir: &Path) -> OptaResult<Option<Value>> {
    let mut by_type: Map<String, Value> = Map::new();
    for (resource_type, name) in declared_resources(module_dir)? {
        if !resource_type.starts_with("aws_") || UNTAGGABLE.contains(&resource_type.as_str()) {
            continue;
        }
        let tags = json!({
            "tags": {
                "opta": "true",
                "layer": "${var.layer_name}",
                "tf_address": format!("module.${{var.module_name}}.{}.{}", resource_type, name),
            }
        });
        let entry = by_type
            .entry(resource_type)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(resources) = entry {
            resources.insert(name, tags);
        }
    }
    if by_type.is_empty() {
        return Ok(None);
    }
    debug!("Tag override for {:?} covers {} resource types", module_dir, by_type.len());
    Ok(Some(json!({ "resource": by_type })))
}

/// Write the override next to the module's files.
pub fn write_tag_override(module_dir: &Path) -> OptaResult<bool> {
    match tag_override(module_dir)? {
        Some(document) => {
            std::fs::write(
                module_dir.join(TAG_OVERRIDE_FILE),
                serde_json::to_string_pretty(&document)?,
            )?;
            Ok(true)
        }
        None => Ok(false),
    }
}
