//! Data models for the module catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Clouds a layer can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cloud {
    Aws,
    Google,
    Azurerm,
    Local,
    Helm,
}

impl Cloud {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cloud::Aws => "aws",
            Cloud::Google => "google",
            Cloud::Azurerm => "azurerm",
            Cloud::Local => "local",
            Cloud::Helm => "helm",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Some(Cloud::Aws),
            "google" | "gcp" => Some(Cloud::Google),
            "azurerm" | "azure" => Some(Cloud::Azurerm),
            "local" => Some(Cloud::Local),
            "helm" => Some(Cloud::Helm),
            _ => None,
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Cloud::Aws, Cloud::Google, Cloud::Azurerm, Cloud::Local, Cloud::Helm]
    }

    /// Clouds whose state lives in a provider-managed bucket or container.
    pub fn has_remote_bucket(&self) -> bool {
        matches!(self, Cloud::Aws | Cloud::Google | Cloud::Azurerm)
    }
}

impl std::fmt::Display for Cloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A declared module input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub user_facing: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub force_update_default_counter: u32,
    #[serde(default)]
    pub description: String,
}

impl InputSpec {
    /// Inputs the layer injects rather than the user supplying them.
    pub const INJECTED: [&'static str; 3] = ["module_name", "layer_name", "env_name"];

    pub fn is_injected(&self) -> bool {
        Self::INJECTED.contains(&self.name.as_str())
    }
}

/// A declared module output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub sensitive: bool,
}

/// Descriptor of a module type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleTypeSpec {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Terraform module directory relative to the packaged modules root.
    /// Absent for types whose source comes from user data.
    #[serde(default)]
    pub module_dir: Option<String>,
    /// Stop stepwise apply after this module.
    #[serde(default)]
    pub halt: bool,
    #[serde(default = "default_true")]
    pub is_exportable: bool,
    /// Only allowed in a layer without a parent.
    #[serde(default)]
    pub root_only: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

fn default_true() -> bool {
    true
}

impl ModuleTypeSpec {
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.input(name).is_some()
    }

    pub fn exported_outputs(&self) -> impl Iterator<Item = &OutputSpec> {
        self.outputs.iter().filter(|o| o.export)
    }
}

/// Terraform backend template for a cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTemplate {
    /// Backend kind, e.g. `s3`, `gcs`, `azurerm`, `local`, `kubernetes`.
    pub kind: String,
    /// Backend configuration; string values may contain interpolations.
    #[serde(default)]
    pub config: Value,
}

/// Catalog section for one cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCatalog {
    pub cloud: Cloud,
    pub backend: BackendTemplate,
    /// Provider name -> provider block template.
    #[serde(default)]
    pub providers: BTreeMap<String, Value>,
    #[serde(default)]
    pub required_providers: BTreeMap<String, Value>,
    /// Macro key -> module entries it expands to.
    #[serde(default)]
    pub macros: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub modules: Vec<ModuleTypeSpec>,
}

/// A module type looked up by name, remembering the alias used.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedModuleType<'a> {
    pub spec: &'a ModuleTypeSpec,
    /// The name the user wrote when it differs from the canonical name.
    pub aliased_type: Option<&'a str>,
}
