//! Remote state data: where a layer's state lives and what opta keeps there.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use opta_registry::Cloud;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of every state bucket opta creates.
pub const STATE_BUCKET_PREFIX: &str = "opta-tf-state";

/// Key prefix of the structured config blobs inside a state bucket.
pub const CONFIG_PREFIX: &str = "opta_config/";

/// A default value the resolver applied, persisted so later runs stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsedDefault {
    pub input_name: String,
    pub default_value: Value,
    #[serde(default)]
    pub force_update_default_counter: u32,
}

/// The per-layer blob opta uploads next to the Terraform state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredConfig {
    pub opta_version: String,
    pub date: DateTime<Utc>,
    pub original_spec: String,
    /// Module name -> defaults used when it was last applied.
    #[serde(default)]
    pub defaults: BTreeMap<String, Vec<UsedDefault>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
}

impl StructuredConfig {
    pub fn new(opta_version: impl Into<String>, original_spec: impl Into<String>) -> Self {
        Self {
            opta_version: opta_version.into(),
            date: Utc::now(),
            original_spec: original_spec.into(),
            defaults: BTreeMap::new(),
            parent_name: None,
        }
    }

    pub fn with_parent(mut self, parent_name: Option<String>) -> Self {
        self.parent_name = parent_name;
        self
    }

    pub fn with_defaults(mut self, defaults: BTreeMap<String, Vec<UsedDefault>>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults_for(&self, module_name: &str) -> &[UsedDefault] {
        self.defaults
            .get(module_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether this config belongs to a layer that names `parent` as its parent.
    ///
    /// Configs written before `parent_name` was recorded are checked against
    /// the `environments` list of their original spec instead.
    pub fn depends_on(&self, parent: &str) -> bool {
        if let Some(name) = &self.parent_name {
            return name == parent;
        }
        let Ok(spec) = serde_yaml::from_str::<serde_yaml::Value>(&self.original_spec) else {
            return false;
        };
        spec.get("environments")
            .and_then(|e| e.as_sequence())
            .map(|envs| {
                envs.iter()
                    .filter_map(|e| e.get("name").and_then(|n| n.as_str()))
                    .any(|n| n == parent)
            })
            .unwrap_or(false)
    }
}

/// A structured config found while listing a bucket.
#[derive(Debug, Clone)]
pub struct RemoteConfigEntry {
    pub bucket: String,
    pub layer_name: String,
    pub config: StructuredConfig,
}

/// Identity of a layer's remote state.
#[derive(Debug, Clone)]
pub struct StateLocation {
    pub cloud: Cloud,
    pub org_name: String,
    pub layer_name: String,
    pub root_layer_name: String,
    /// Bucket (AWS, GCP) or container (Azure) holding the state.
    pub state_storage: String,
    /// The layer's provider block for its cloud, e.g. `{region, account_id}`.
    pub provider: Map<String, Value>,
    pub opta_home: PathBuf,
}

impl StateLocation {
    pub fn new(
        cloud: Cloud,
        layer_name: impl Into<String>,
        state_storage: impl Into<String>,
    ) -> Self {
        let layer_name = layer_name.into();
        Self {
            cloud,
            org_name: String::new(),
            root_layer_name: layer_name.clone(),
            layer_name,
            state_storage: state_storage.into(),
            provider: Map::new(),
            opta_home: PathBuf::from(".opta"),
        }
    }

    pub fn with_org(mut self, org_name: impl Into<String>) -> Self {
        self.org_name = org_name.into();
        self
    }

    pub fn with_root(mut self, root_layer_name: impl Into<String>) -> Self {
        self.root_layer_name = root_layer_name.into();
        self
    }

    pub fn with_provider(mut self, provider: Map<String, Value>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_opta_home(mut self, opta_home: impl Into<PathBuf>) -> Self {
        self.opta_home = opta_home.into();
        self
    }

    /// Default bucket name for a root layer.
    pub fn default_storage(org_name: &str, root_layer_name: &str) -> String {
        format!("{}-{}-{}", STATE_BUCKET_PREFIX, org_name, root_layer_name)
    }

    pub fn provider_str(&self, key: &str) -> Option<&str> {
        self.provider.get(key).and_then(Value::as_str)
    }

    pub fn region(&self) -> Option<&str> {
        self.provider_str("region")
            .or_else(|| self.provider_str("location"))
    }

    /// Key of the structured config blob.
    pub fn config_key(&self) -> String {
        format!("{}{}", CONFIG_PREFIX, self.layer_name)
    }

    pub fn is_root(&self) -> bool {
        self.layer_name == self.root_layer_name
    }

    /// Name of the Kubernetes cluster the root layer creates.
    pub fn cluster_name(&self) -> String {
        format!("opta-{}", self.root_layer_name)
    }

    pub fn kubeconfig_dir(&self) -> PathBuf {
        self.opta_home.join("kubeconfigs")
    }
}

/// An output recorded in Terraform state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOutput {
    pub value: Value,
    #[serde(default)]
    pub sensitive: bool,
}

/// A resource recorded in Terraform state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResource {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub mode: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
}

/// The parts of a Terraform state file opta reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerraformState {
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub outputs: BTreeMap<String, StateOutput>,
    #[serde(default)]
    pub resources: Vec<StateResource>,
}

impl TerraformState {
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).map(|o| &o.value)
    }

    /// Names of the top-level modules that own at least one resource.
    pub fn existing_modules(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter_map(|r| r.module.as_deref())
            .filter_map(|m| m.strip_prefix("module."))
            .map(|m| m.split('.').next().unwrap_or(m).to_string())
            .collect()
    }
}
