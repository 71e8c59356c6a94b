//! Small processors that mostly wire references and read local files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use opta_registry::Cloud;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::iam::IamAssembler;
use crate::interpolation::module_ref;
use crate::layer::Layer;
use crate::linker::parse_links;
use crate::module::{relative_source, Module};

use super::certs::key_matches_certificate;
use super::layer_or_parent_ref;

/// Largest zip AWS accepts for a direct lambda upload.
const MAX_LAMBDA_ZIP_BYTES: u64 = 50 * 1024 * 1024;

const ATLAS_KEY_VARS: [&str; 2] = ["MONGODB_ATLAS_PUBLIC_KEY", "MONGODB_ATLAS_PRIVATE_KEY"];

fn local_path(layer_dir: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        layer_dir.join(path)
    }
}

fn read_file_field(module: &Module, layer_dir: &Path, field: &str) -> OptaResult<Option<(PathBuf, String)>> {
    let Some(path) = module.get_str(field) else {
        return Ok(None);
    };
    let path = local_path(layer_dir, path);
    let content = std::fs::read_to_string(&path).map_err(|e| {
        OptaError::validation(&module.name, format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(Some((path, content)))
}

/// `external-ssl-cert`: read the key, certificate and chain files and check
/// that the key belongs to the certificate.
pub(super) async fn external_ssl_cert(layer: &mut Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let layer_dir = layer.dir().to_path_buf();
    let module = &layer.modules[index];
    let key = read_file_field(module, &layer_dir, "private_key_file")?;
    let body = read_file_field(module, &layer_dir, "certificate_body_file")?;
    let chain = read_file_field(module, &layer_dir, "certificate_chain_file")?;

    if let (Some((key_path, _)), Some((body_path, _))) = (&key, &body) {
        if !key_matches_certificate(ctx.runner.as_ref(), key_path, body_path).await? {
            return Err(OptaError::CertificateMismatch(format!(
                "{} is not the private key of {}",
                key_path.display(),
                body_path.display()
            )));
        }
    }

    let module = &mut layer.modules[index];
    for (field, file, loaded) in [
        ("private_key", "private_key_file", key),
        ("certificate_body", "certificate_body_file", body),
        ("certificate_chain", "certificate_chain_file", chain),
    ] {
        module.remove(file);
        if let Some((_, content)) = loaded {
            module.set(field, Value::String(content));
        }
    }
    Ok(())
}

/// `aws-cloudfront-distribution`: an S3 bucket or the ingress load balancer
/// as origin.
pub(super) fn cloudfront(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let name = layer.modules[index].name.clone();
    let mut fields: Vec<(&str, Value)> = Vec::new();

    for link in parse_links(&layer.modules[index])? {
        let target = layer.get_module(&link.target, index)?.ok_or_else(|| {
            OptaError::validation(&name, format!("linked module {} does not exist in this layer", link.target))
        })?;
        match target.module_type.as_str() {
            "aws-s3" => {
                let bucket = target.get_str("bucket_name").unwrap_or_default();
                fields.push(("bucket_name", Value::String(bucket.to_string())));
                fields.push((
                    "origin_access_identity_path",
                    module_ref(&target.name, "cloudfront_read_path"),
                ));
                fields.push(("s3_load_balancer_enabled", Value::Bool(true)));
            }
            "aws-k8s-base" => fields.push((
                "lb_load_balancer_domain",
                module_ref(&target.name, "load_balancer_raw_dns"),
            )),
            other => {
                return Err(OptaError::validation(
                    &name,
                    format!("cloudfront can only front aws-s3 or aws-k8s-base, not {}", other),
                ))
            }
        }
    }

    if fields.is_empty() {
        let lb = layer_or_parent_ref(layer, index, &["aws-k8s-base"], "load_balancer_raw_dns")
            .ok_or_else(|| {
                OptaError::validation(&name, "link an aws-s3 bucket or run next to an aws-k8s-base")
            })?;
        fields.push(("lb_load_balancer_domain", lb));
    }

    let module = &mut layer.modules[index];
    for (field, value) in fields {
        module.set_default(field, value);
    }
    let has_domains = module
        .get("domains")
        .and_then(Value::as_array)
        .map_or(false, |d| !d.is_empty());
    if has_domains && module.get("acm_cert_arn").is_none() {
        return Err(OptaError::validation(&name, "`domains` need an `acm_cert_arn`"));
    }
    Ok(())
}

/// `aws-lambda`: validate the zip and grant linked resources.
pub(super) fn lambda(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let layer_dir = layer.dir().to_path_buf();
    let name = layer.modules[index].name.clone();

    let mut iam = IamAssembler::new();
    for link in parse_links(&layer.modules[index])? {
        let target = layer.get_module(&link.target, index)?.ok_or_else(|| {
            OptaError::validation(&name, format!("linked module {} does not exist in this layer", link.target))
        })?;
        iam.add_link(&name, target, &link.permissions)?;
    }

    let module = &mut layer.modules[index];
    let filename = module
        .get_str("filename")
        .ok_or_else(|| OptaError::validation(&name, "`filename` is required"))?;
    let path = local_path(&layer_dir, filename);
    if path.extension().and_then(|e| e.to_str()) != Some("zip") {
        return Err(OptaError::validation(&name, format!("{} is not a zip file", path.display())));
    }
    let size = std::fs::metadata(&path)
        .map_err(|e| OptaError::validation(&name, format!("cannot read {}: {}", path.display(), e)))?
        .len();
    if size > MAX_LAMBDA_ZIP_BYTES {
        return Err(OptaError::validation(
            &name,
            format!("{} is {} bytes; lambda zips are limited to {}", path.display(), size, MAX_LAMBDA_ZIP_BYTES),
        ));
    }
    module.set("filename", Value::String(path.display().to_string()));
    module.set("iam_policy", iam.policy_document());
    Ok(())
}

fn atlas_region(cloud: Cloud, region: &str) -> String {
    match cloud {
        Cloud::Aws => region.replace('-', "_").to_uppercase(),
        _ => region.to_uppercase(),
    }
}

/// `mongodb-atlas`: allow the environment's NAT addresses and place the
/// cluster in the layer's cloud and region.
pub(super) fn mongodb_atlas(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let name = layer.modules[index].name.clone();
    let nat_ips = layer_or_parent_ref(layer, index, &["aws-base", "gcp-base"], "public_nat_ips")
        .ok_or_else(|| OptaError::validation(&name, "needs an aws-base or gcp-base module in this layer or its environment"))?;
    let provider = match layer.cloud {
        Cloud::Aws => Some("AWS"),
        Cloud::Google => Some("GCP"),
        Cloud::Azurerm => Some("AZURE"),
        _ => None,
    };
    let region = layer
        .provider_str("region")
        .map(|region| atlas_region(layer.cloud, &region));

    let module = &mut layer.modules[index];
    module.set_default("public_nat_ips", nat_ips);
    if let Some(provider) = provider {
        module.set_default("cloud_provider", Value::String(provider.to_string()));
    }
    if let Some(region) = region {
        module.set_default("region", Value::String(region));
    }
    Ok(())
}

/// The Atlas provider reads its keys from the environment.
pub(super) fn mongodb_atlas_pre_hook() -> OptaResult<()> {
    let missing: Vec<&str> = ATLAS_KEY_VARS
        .iter()
        .copied()
        .filter(|var| std::env::var(var).map_or(true, |v| v.is_empty()))
        .collect();
    if !missing.is_empty() {
        return Err(OptaError::user(format!(
            "Set {} to deploy a mongodb-atlas module",
            missing.join(" and ")
        )));
    }
    Ok(())
}

const DATADOG_KEY_VAR: &str = "DATADOG_API_KEY";
const DATADOG_SECRET: &str = "opta-datadog-api-key";
const DATADOG_SECRET_ENTRY: &str = "api_key";
/// Rendered when no key is known outside of an apply; nothing deploys it.
const PLACEHOLDER_DATADOG_KEY: &str = "00000000000000000000000000000000";

fn is_datadog_key(key: &str) -> bool {
    key.len() == 32 && key.chars().all(|c| c.is_ascii_hexdigit())
}

fn datadog_namespace(module: &Module) -> String {
    module.get_str("namespace").unwrap_or("datadog").to_string()
}

/// The key a previous apply stored in the cluster, when the cluster is up.
async fn stored_datadog_key(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<Option<String>> {
    let Some(target) = &layer.kube else {
        return Ok(None);
    };
    let namespace = datadog_namespace(&layer.modules[index]);
    let secret = ctx
        .cluster(target)
        .await?
        .get_secret(&namespace, DATADOG_SECRET)
        .await?;
    Ok(secret
        .and_then(|data| data.get(DATADOG_SECRET_ENTRY).cloned())
        .map(|raw| String::from_utf8_lossy(&raw).trim().to_string())
        .filter(|key| !key.is_empty()))
}

/// `datadog`: the API key comes from the module, the secret a previous
/// apply stored, `DATADOG_API_KEY` or, during an interactive apply, a prompt.
pub(super) async fn datadog(layer: &mut Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let key = match layer.modules[index].get_str("api_key") {
        Some(key) => key.to_string(),
        None => match stored_datadog_key(layer, index, ctx).await? {
            Some(key) => key,
            None => match std::env::var(DATADOG_KEY_VAR) {
                Ok(key) if !key.is_empty() => key,
                _ if !ctx.applying => {
                    debug!("No Datadog API key outside of apply, rendering a placeholder");
                    PLACEHOLDER_DATADOG_KEY.to_string()
                }
                _ if ctx.config.ci => {
                    return Err(OptaError::user(format!(
                        "Set {} or the datadog module's api_key; a non-interactive apply cannot prompt for it",
                        DATADOG_KEY_VAR
                    )))
                }
                _ => ctx.interaction.prompt("Datadog API key")?,
            },
        },
    };
    let module = &mut layer.modules[index];
    let key = key.trim().to_string();
    if !is_datadog_key(&key) {
        return Err(OptaError::validation(
            &module.name,
            "the Datadog API key must be 32 hexadecimal characters",
        ));
    }
    module.set("api_key", Value::String(key));
    Ok(())
}

/// Keep the key in the cluster so later runs do not ask again.
pub(super) async fn datadog_post_hook(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    let Some(key) = module.get_str("api_key").filter(|key| *key != PLACEHOLDER_DATADOG_KEY) else {
        return Ok(());
    };
    let namespace = datadog_namespace(module);
    let target = layer.default_kube_target(&ctx.config);
    let cluster = ctx.cluster(&target).await?;
    cluster.create_namespace(&namespace, &BTreeMap::new()).await?;
    let data = BTreeMap::from([(DATADOG_SECRET_ENTRY.to_string(), key.as_bytes().to_vec())]);
    cluster
        .apply_secret(&namespace, DATADOG_SECRET, &BTreeMap::new(), data)
        .await?;
    debug!("Stored the Datadog API key in {}/{}", namespace, DATADOG_SECRET);
    Ok(())
}

/// `helm-chart`: local charts, values files and the default namespace.
pub(super) fn helm_chart(layer: &mut Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let layer_dir = layer.dir().to_path_buf();
    let namespace = layer.name.clone();
    let module = &mut layer.modules[index];
    let name = module.name.clone();

    let chart = module
        .get_str("chart")
        .ok_or_else(|| OptaError::validation(&name, "`chart` is required"))?
        .to_string();
    if chart.starts_with("./") || chart.starts_with("../") {
        if module.get("repository").is_some() {
            return Err(OptaError::validation(&name, "a local chart cannot have a `repository`"));
        }
        let dir = layer_dir.join(&chart);
        if !dir.is_dir() {
            return Err(OptaError::validation(&name, format!("chart directory {} does not exist", dir.display())));
        }
        if module.get("chart_version").is_some() {
            warn!("Module {}: chart_version is ignored for local charts", name);
        }
        module.set("chart", Value::String(relative_source(&dir, &ctx.config.workdir)));
    }

    if let Some(Value::String(file)) = module.remove("values_file") {
        let path = local_path(&layer_dir, &file);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| OptaError::validation(&name, format!("cannot read {}: {}", path.display(), e)))?;
        let from_file: Option<Map<String, Value>> = serde_yaml::from_str(&content)?;
        let mut values = from_file.unwrap_or_default();
        if let Some(Value::Object(inline)) = module.get("values") {
            values.extend(inline.clone());
        }
        debug!("Module {}: {} values after merging {}", name, values.len(), path.display());
        module.set("values", Value::Object(values));
    }

    module.set_default("namespace", Value::String(namespace));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atlas_region() {
        assert_eq!(atlas_region(Cloud::Aws, "us-east-1"), "US_EAST_1");
        assert_eq!(atlas_region(Cloud::Google, "central_us"), "CENTRAL_US");
    }

    #[test]
    fn test_datadog_key_shape() {
        assert!(is_datadog_key("0123456789abcdef0123456789abcdef"));
        assert!(!is_datadog_key("not-a-key"));
    }
}
