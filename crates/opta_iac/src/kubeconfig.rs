//! Scoped kubeconfig files under `~/.opta/kubeconfigs`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::json;
use tracing::debug;

use opta_registry::Cloud;

use crate::error::IacResult;

/// Generated kubeconfigs are reused for a week.
pub const KUBECONFIG_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Path of the kubeconfig opta writes for a root layer.
pub fn kubeconfig_path(dir: &Path, root_layer_name: &str, cloud: Cloud) -> PathBuf {
    dir.join(format!("kubeconfig-{}-{}.yaml", root_layer_name, cloud))
}

/// Whether `path` exists and was written less than [`KUBECONFIG_MAX_AGE`] ago.
pub fn is_fresh(path: &Path) -> bool {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age < KUBECONFIG_MAX_AGE)
        .unwrap_or(true)
}

/// Credential plugin invoked by Kubernetes clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecCredential {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecCredential {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Everything needed to render a single-cluster kubeconfig.
#[derive(Debug, Clone)]
pub struct ClusterCredentials {
    pub cluster_name: String,
    pub endpoint: String,
    /// Base64 encoded CA bundle.
    pub ca_data: String,
    pub exec: ExecCredential,
}

/// Render a self-contained kubeconfig with a single context.
pub fn render(credentials: &ClusterCredentials, context_name: &str) -> IacResult<String> {
    let env: Vec<_> = credentials
        .exec
        .env
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();
    let server = if credentials.endpoint.starts_with("https://") {
        credentials.endpoint.clone()
    } else {
        format!("https://{}", credentials.endpoint)
    };
    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": credentials.cluster_name,
            "cluster": {
                "server": server,
                "certificate-authority-data": credentials.ca_data,
            }
        }],
        "contexts": [{
            "name": context_name,
            "context": {"cluster": credentials.cluster_name, "user": context_name}
        }],
        "current-context": context_name,
        "preferences": {},
        "users": [{
            "name": context_name,
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": credentials.exec.command,
                    "args": credentials.exec.args,
                    "env": env,
                }
            }
        }]
    });
    Ok(serde_yaml::to_string(&doc)?)
}

/// Write a kubeconfig, creating the parent directory.
pub async fn write(path: &Path, content: &str) -> IacResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    debug!("Writing kubeconfig to {:?}", path);
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_kubeconfig_path() {
        let path = kubeconfig_path(Path::new("/home/u/.opta/kubeconfigs"), "staging", Cloud::Aws);
        assert_eq!(
            path,
            PathBuf::from("/home/u/.opta/kubeconfigs/kubeconfig-staging-aws.yaml")
        );
    }

    #[test]
    fn test_render_contains_exec_plugin() {
        let creds = ClusterCredentials {
            cluster_name: "opta-staging".into(),
            endpoint: "ABC.gr7.us-east-1.eks.amazonaws.com".into(),
            ca_data: "Q0E=".into(),
            exec: ExecCredential::new("aws")
                .args(["eks", "get-token", "--cluster-name", "opta-staging"])
                .env("AWS_PROFILE", "default"),
        };
        let rendered = render(&creds, "opta-acme-staging-aws").unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["current-context"].as_str(), Some("opta-acme-staging-aws"));
        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://ABC.gr7.us-east-1.eks.amazonaws.com")
        );
        assert_eq!(parsed["users"][0]["user"]["exec"]["command"].as_str(), Some("aws"));
    }

    #[tokio::test]
    async fn test_fresh_after_write() {
        let dir = tempdir().unwrap();
        let path = kubeconfig_path(dir.path(), "staging", Cloud::Google);
        assert!(!is_fresh(&path));
        write(&path, "apiVersion: v1\n").await.unwrap();
        assert!(is_fresh(&path));
    }
}
