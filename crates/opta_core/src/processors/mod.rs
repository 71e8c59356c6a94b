//! Per-type module processors.
//!
//! Before rendering, every module of a layer goes through the processor of
//! its type. Processors inject computed inputs, wire references to other
//! modules and validate user data. Some also run hooks around the Terraform
//! apply (pre/post) or after a targeted destroy.
//!
//! Dispatch is a closed enum keyed by catalog type name; types without
//! special handling use [`ProcessorKind::Generic`], which only injects the
//! common values.

mod base;
mod certs;
mod cluster;
mod custom_terraform;
mod datastore;
mod dns;
mod iam_principal;
mod k8s_base;
mod k8s_service;
mod wiring;

pub use k8s_service::ports::{PortSpec, PortType, Protocol};

use serde_json::Value;

use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::layer::Layer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    Base,
    Cluster,
    K8sBase,
    K8sService,
    IamPrincipal,
    GcpServiceAccount,
    Dns,
    Datastore,
    ExternalSslCert,
    Cloudfront,
    Lambda,
    MongodbAtlas,
    Datadog,
    HelmChart,
    CustomTerraform,
    Generic,
}

impl ProcessorKind {
    pub fn for_type(module_type: &str) -> Self {
        match module_type {
            "aws-base" | "gcp-base" | "azure-base" => Self::Base,
            "aws-eks" | "gcp-gke" | "azure-aks" => Self::Cluster,
            "aws-k8s-base" | "gcp-k8s-base" | "azure-k8s-base" | "k8s-base" | "local-base" => {
                Self::K8sBase
            }
            "aws-k8s-service" | "gcp-k8s-service" | "azure-k8s-service" | "k8s-service"
            | "local-k8s-service" => Self::K8sService,
            "aws-iam-role" | "aws-iam-user" => Self::IamPrincipal,
            "gcp-service-account" => Self::GcpServiceAccount,
            "aws-dns" | "gcp-dns" => Self::Dns,
            "aws-postgres" | "aws-mysql" | "aws-redis" | "aws-documentdb" | "gcp-postgres"
            | "gcp-redis" | "azure-postgres" | "azure-redis" => Self::Datastore,
            "external-ssl-cert" => Self::ExternalSslCert,
            "aws-cloudfront-distribution" => Self::Cloudfront,
            "aws-lambda" => Self::Lambda,
            "mongodb-atlas" => Self::MongodbAtlas,
            "datadog" => Self::Datadog,
            "helm-chart" => Self::HelmChart,
            "custom-terraform" => Self::CustomTerraform,
            _ => Self::Generic,
        }
    }

    /// Mutate `layer.modules[index]` ahead of rendering.
    pub async fn process(self, layer: &mut Layer, index: usize, ctx: &Context) -> OptaResult<()> {
        inject_common(layer, index)?;
        match self {
            Self::Base => base::process(layer, index),
            Self::Cluster => cluster::process(layer, index),
            Self::K8sBase => k8s_base::process(layer, index),
            Self::K8sService => k8s_service::process(layer, index, ctx),
            Self::IamPrincipal => iam_principal::process_aws(layer, index),
            Self::GcpServiceAccount => iam_principal::process_gcp(layer, index),
            Self::Dns => dns::process(layer, index),
            Self::Datastore => datastore::process(layer, index),
            Self::ExternalSslCert => wiring::external_ssl_cert(layer, index, ctx).await,
            Self::Cloudfront => wiring::cloudfront(layer, index),
            Self::Lambda => wiring::lambda(layer, index),
            Self::MongodbAtlas => wiring::mongodb_atlas(layer, index),
            Self::Datadog => wiring::datadog(layer, index, ctx).await,
            Self::HelmChart => wiring::helm_chart(layer, index, ctx),
            Self::CustomTerraform => custom_terraform::process(layer, index, ctx),
            Self::Generic => Ok(()),
        }
    }

    /// Runs right before the apply stage that includes the module.
    pub async fn pre_hook(self, layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
        match self {
            Self::K8sService => k8s_service::pre_hook(layer, index, ctx).await,
            Self::Dns => dns::pre_hook(layer, index, ctx).await,
            Self::MongodbAtlas => wiring::mongodb_atlas_pre_hook(),
            _ => Ok(()),
        }
    }

    /// Runs after the apply stage, whether it failed or not.
    pub async fn post_hook(
        self,
        layer: &Layer,
        index: usize,
        ctx: &Context,
        error: Option<&OptaError>,
    ) -> OptaResult<()> {
        if error.is_some() {
            return Ok(());
        }
        match self {
            Self::K8sBase => k8s_base::post_hook(layer, index, ctx).await,
            Self::K8sService => k8s_service::post_hook(layer, index, ctx).await,
            Self::Datadog => wiring::datadog_post_hook(layer, index, ctx).await,
            _ => Ok(()),
        }
    }

    /// Runs after the module's resources were destroyed.
    pub async fn post_delete(self, layer: &Layer, index: usize, ctx: &Context) -> OptaResult<()> {
        match self {
            Self::Cluster => cluster::post_delete(layer, index, ctx).await,
            Self::K8sService => k8s_service::post_delete(layer, index, ctx).await,
            _ => Ok(()),
        }
    }
}

/// Checks and injections every module gets: root-only placement and the
/// `env_name`, `layer_name` and `module_name` inputs.
fn inject_common(layer: &mut Layer, index: usize) -> OptaResult<()> {
    let is_root = layer.is_root();
    let env_name = layer.root().name.clone();
    let layer_name = layer.name.clone();
    let module = &mut layer.modules[index];

    if module.spec().root_only && !is_root {
        return Err(OptaError::validation(
            &module.name,
            format!("{} can only be used in an environment layer", module.module_type),
        ));
    }

    let module_name = module.name.clone();
    module.set("env_name", Value::String(env_name));
    module.set("layer_name", Value::String(layer_name));
    module.set("module_name", Value::String(module_name));
    Ok(())
}

/// Reference to an output of the nearest earlier module of `types` in this
/// layer, falling back to the parent layer's exported output.
pub(crate) fn layer_or_parent_ref(
    layer: &Layer,
    index: usize,
    types: &[&str],
    output: &str,
) -> Option<Value> {
    if let Some(found) = layer.find_module_before(types, index) {
        return Some(crate::interpolation::module_ref(&found.name, output));
    }
    layer
        .parent
        .is_some()
        .then(|| crate::interpolation::parent_ref(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch() {
        assert_eq!(ProcessorKind::for_type("aws-eks"), ProcessorKind::Cluster);
        assert_eq!(ProcessorKind::for_type("k8s-service"), ProcessorKind::K8sService);
        assert_eq!(ProcessorKind::for_type("aws-s3"), ProcessorKind::Generic);
        assert_eq!(ProcessorKind::for_type("gcp-service-account"), ProcessorKind::GcpServiceAccount);
    }
}
