//! Hosted zones (`aws-dns`, `gcp-dns`).
//!
//! Before the zone is applied with `delegated: true`, the name servers the
//! zone was created with must already answer for the domain. `aws-dns` can
//! also import a certificate bought elsewhere: the key, body and chain are
//! kept in SSM under `/opta-<env>/<module>/`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use opta_runner::CommandSpec;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::layer::Layer;
use crate::shell;

use super::certs::key_matches_certificate;

const CERT_ATTEMPTS: usize = 3;

pub(super) fn process(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let module = &mut layer.modules[index];
    if let Some(domain) = module.get_str("domain") {
        let domain = domain.trim_end_matches('.').to_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return Err(OptaError::validation(
                &module.name,
                format!("`{}` is not a fully qualified domain", domain),
            ));
        }
        module.set("domain", Value::String(domain));
    }
    Ok(())
}

pub(super) async fn pre_hook(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    if module.module_type == "aws-dns" && module.get_bool("upload_cert") {
        upload_certificate(layer, index, ctx).await?;
    }
    if module.get_bool("delegated") {
        check_delegation(layer, index, ctx).await?;
    }
    Ok(())
}

fn normalize_ns(names: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    names
        .into_iter()
        .map(|n| n.trim().trim_end_matches('.').to_lowercase())
        .filter(|n| !n.is_empty())
        .collect()
}

async fn check_delegation(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    let domain = module
        .get_str("domain")
        .ok_or_else(|| OptaError::validation(&module.name, "`domain` is required"))?;

    let client = ctx.cloud_client(layer.state_location(&ctx.config));
    let state = client.get_remote_state().await?;
    let prefixed = format!("{}_name_servers", module.name);
    let expected = state
        .as_ref()
        .and_then(|s| s.output(&prefixed).or_else(|| s.output("name_servers")))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            OptaError::user(format!(
                "{} has `delegated: true` but its zone was never created; apply once with `delegated: false` first",
                module.name
            ))
        })?;
    let expected = normalize_ns(expected.iter().filter_map(Value::as_str).map(str::to_string));

    let answer = shell::run(
        ctx.runner.as_ref(),
        CommandSpec::new("dig").args(["+short", "NS", domain]),
        "Resolving name servers",
    )
    .await?;
    let actual = normalize_ns(answer.lines().map(str::to_string));
    debug!("NS for {}: expected {:?}, found {:?}", domain, expected, actual);

    if expected != actual {
        return Err(OptaError::DnsDelegationMismatch {
            domain: domain.to_string(),
            expected: expected.into_iter().collect(),
            actual: actual.into_iter().collect(),
        });
    }
    Ok(())
}

struct SsmPaths {
    private_key: String,
    certificate_body: String,
    certificate_chain: String,
}

impl SsmPaths {
    fn new(env: &str, module: &str) -> Self {
        let prefix = format!("/opta-{}/{}", env, module);
        Self {
            private_key: format!("{}/private_key", prefix),
            certificate_body: format!("{}/certificate_body", prefix),
            certificate_chain: format!("{}/certificate_chain", prefix),
        }
    }

    fn prefix(&self) -> &str {
        self.private_key.trim_end_matches("/private_key")
    }
}

/// What the user pointed us at.
struct CertificateFiles {
    private_key: PathBuf,
    certificate_body: PathBuf,
    certificate_chain: Option<PathBuf>,
}

fn resolve_path(base: &Path, answer: &str) -> PathBuf {
    let path = PathBuf::from(answer.trim());
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

async fn ask_for_files(layer: &Layer, domain: &str, ctx: &Context) -> OptaResult<CertificateFiles> {
    let base = layer.dir();
    for attempt in 1..=CERT_ATTEMPTS {
        let key = ctx
            .interaction
            .prompt(&format!("Path to the private key for {}", domain))?;
        let body = ctx
            .interaction
            .prompt(&format!("Path to the certificate for {}", domain))?;
        let chain = ctx
            .interaction
            .prompt("Path to the certificate chain (leave empty if there is none)")?;

        let files = CertificateFiles {
            private_key: resolve_path(base, &key),
            certificate_body: resolve_path(base, &body),
            certificate_chain: (!chain.trim().is_empty()).then(|| resolve_path(base, &chain)),
        };
        if key_matches_certificate(ctx.runner.as_ref(), &files.private_key, &files.certificate_body).await? {
            return Ok(files);
        }
        ctx.interaction.show(&format!(
            "The private key does not belong to the certificate (attempt {}/{}), try again",
            attempt, CERT_ATTEMPTS
        ));
    }
    Err(OptaError::CertificateMismatch(format!(
        "the private key and certificate for {} do not match",
        domain
    )))
}

async fn existing_parameters(ctx: &Context, prefix: &str, region: &str) -> OptaResult<Vec<String>> {
    let listed = shell::run_json(
        ctx.runner.as_ref(),
        CommandSpec::new("aws").args([
            "ssm",
            "get-parameters-by-path",
            "--path",
            prefix,
            "--region",
            region,
            "--output",
            "json",
        ]),
        "Listing stored certificate parameters",
    )
    .await?;
    Ok(listed["Parameters"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|p| p["Name"].as_str())
        .map(str::to_string)
        .collect())
}

async fn put_parameter(ctx: &Context, name: &str, value: &str, region: &str) -> OptaResult<()> {
    shell::run(
        ctx.runner.as_ref(),
        CommandSpec::new("aws")
            .args([
                "ssm",
                "put-parameter",
                "--name",
                name,
                "--type",
                "SecureString",
                "--overwrite",
                "--region",
                region,
                "--value",
                "file:///dev/stdin",
            ])
            .stdin(value),
        "Storing certificate parameter",
    )
    .await
    .map(|_| ())
}

async fn upload_certificate(layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
    let module = &layer.modules[index];
    let domain = module.get_str("domain").unwrap_or_default();
    let region = layer
        .provider_str("region")
        .ok_or_else(|| OptaError::user("The aws provider block needs a `region`"))?;
    let paths = SsmPaths::new(&layer.root().name, &module.name);

    let existing = existing_parameters(ctx, paths.prefix(), &region).await?;
    if existing.contains(&paths.private_key) && existing.contains(&paths.certificate_body) {
        let replace = ctx.interaction.confirm(
            &format!("A certificate for {} is already stored. Upload a new one?", domain),
            false,
        )?;
        if !replace {
            return Ok(());
        }
    }

    let files = ask_for_files(layer, domain, ctx).await?;
    put_parameter(ctx, &paths.private_key, &std::fs::read_to_string(&files.private_key)?, &region).await?;
    put_parameter(
        ctx,
        &paths.certificate_body,
        &std::fs::read_to_string(&files.certificate_body)?,
        &region,
    )
    .await?;
    match &files.certificate_chain {
        Some(chain) => {
            put_parameter(ctx, &paths.certificate_chain, &std::fs::read_to_string(chain)?, &region).await?;
        }
        None if existing.contains(&paths.certificate_chain) => {
            shell::run(
                ctx.runner.as_ref(),
                CommandSpec::new("aws").args([
                    "ssm",
                    "delete-parameter",
                    "--name",
                    paths.certificate_chain.as_str(),
                    "--region",
                    region.as_str(),
                ]),
                "Removing stale certificate chain",
            )
            .await?;
        }
        None => {}
    }
    info!("Stored certificate for {} under {}", domain, paths.prefix());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ns_normalization() {
        let a = normalize_ns(vec!["NS-1.awsdns.com.".to_string(), "ns-2.awsdns.net".to_string()]);
        let b = normalize_ns(vec!["ns-2.awsdns.net.".to_string(), "ns-1.awsdns.com".to_string(), String::new()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ssm_paths() {
        let paths = SsmPaths::new("staging", "dns");
        assert_eq!(paths.private_key, "/opta-staging/dns/private_key");
        assert_eq!(paths.certificate_chain, "/opta-staging/dns/certificate_chain");
        assert_eq!(paths.prefix(), "/opta-staging/dns");
    }
}
