//! Layers: one opta YAML file plus its parent chain.
//!
//! # Loading
//!
//! [`Layer::load_from_yaml`] reads the file, loads the parent (picked from
//! `environments` or given as `parent`), merges providers, resolves input
//! variables, expands macros and binds every module entry to its catalog
//! type. Parent loading tracks visited files so a cycle fails cleanly.
//!
//! # Processing
//!
//! [`Layer::process_modules`] runs each module's processor once, in
//! declared order. Processors may read modules declared before the current
//! one; [`Layer::get_module`] refuses forward references.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use opta_iac::kubeconfig::kubeconfig_path;
use opta_iac::{StateLocation, StructuredConfig, UsedDefault};
use opta_registry::Cloud;

use crate::config::OptaConfig;
use crate::context::Context;
use crate::error::{OptaError, OptaResult};
use crate::interpolation::Scope;
use crate::kube::KubeTarget;
use crate::module::Module;
use crate::processors::ProcessorKind;

/// Provider fields a child layer may not redefine.
const CORE_PROVIDER_FIELDS: [&str; 7] = [
    "region",
    "account_id",
    "project",
    "location",
    "subscription_id",
    "tenant_id",
    "storage_account_name",
];

const LOCAL_KUBE_CONTEXT: &str = "kind-opta-local-cluster";

/// Knobs for [`Layer::load_from_yaml`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Entry of `environments` to use as parent.
    pub env: Option<String>,
    /// `--var` values; they win over everything else.
    pub input_variables: Map<String, Value>,
    /// Fail on declared variables nobody gave a value.
    pub strict_input_variables: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            env: None,
            input_variables: Map::new(),
            strict_input_variables: true,
        }
    }
}

impl LoadOptions {
    pub fn env(mut self, env: Option<String>) -> Self {
        self.env = env;
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_variables.insert(key.into(), value);
        self
    }

    pub fn lenient(mut self) -> Self {
        self.strict_input_variables = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub org_name: String,
    pub cloud: Cloud,
    /// Absolute path of the YAML file.
    pub path: PathBuf,
    pub providers: Map<String, Value>,
    pub parent: Option<Box<Layer>>,
    pub modules: Vec<Module>,
    pub variables: Map<String, Value>,
    pub original_spec: String,
    pub state_storage: String,
    /// Set once a kubeconfig has been written for the cluster.
    pub kube: Option<KubeTarget>,
    processed: bool,
}

pub fn validate_layer_name(name: &str) -> OptaResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(OptaError::InvalidName(format!(
            "Invalid layer name `{}`: use lowercase letters, digits and dashes",
            name
        )));
    }
    Ok(())
}

fn cloud_from_providers(providers: &Map<String, Value>) -> Option<Cloud> {
    providers.keys().find_map(|key| Cloud::from_str(key))
}

fn merge_providers(
    layer_name: &str,
    own: &Map<String, Value>,
    parent: &Map<String, Value>,
) -> OptaResult<Map<String, Value>> {
    let mut merged = parent.clone();
    for (provider, config) in own {
        match (merged.get_mut(provider), config) {
            (Some(Value::Object(inherited)), Value::Object(fields)) => {
                for (field, value) in fields {
                    if let Some(existing) = inherited.get(field) {
                        if CORE_PROVIDER_FIELDS.contains(&field.as_str()) && existing != value {
                            return Err(OptaError::user(format!(
                                "Layer {} sets {}.{} to {}, which conflicts with its parent ({})",
                                layer_name, provider, field, value, existing
                            )));
                        }
                    }
                    inherited.insert(field.clone(), value.clone());
                }
            }
            _ => {
                merged.insert(provider.clone(), config.clone());
            }
        }
    }
    Ok(merged)
}

/// Deep-merge `fields` into `base`, `fields` winning.
fn overlay(base: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (key, value) in fields {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => overlay(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn resolve_variables(
    raw: &Map<String, Value>,
    env_variables: Option<&Map<String, Value>>,
    options: &LoadOptions,
) -> OptaResult<Map<String, Value>> {
    let mut variables = Map::new();
    let mut declared = Vec::new();

    for entry in raw.get("input_variables").and_then(Value::as_array).into_iter().flatten() {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            return Err(OptaError::user("Every entry of `input_variables` needs a `name`"));
        };
        declared.push(name.to_string());
        if let Some(default) = entry.get("default") {
            variables.insert(name.to_string(), default.clone());
        }
    }

    if let Some(env_variables) = env_variables {
        for (key, value) in env_variables {
            variables.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in &options.input_variables {
        variables.insert(key.clone(), value.clone());
    }

    for name in declared {
        if variables.contains_key(&name) {
            continue;
        }
        if options.strict_input_variables {
            return Err(OptaError::UnboundVariable(name));
        }
        debug!("Input variable {} left unbound", name);
        variables.insert(name, Value::Null);
    }
    Ok(variables)
}

struct ParentRef {
    path: PathBuf,
    variables: Option<Map<String, Value>>,
}

fn find_parent(raw: &Map<String, Value>, dir: &Path, env: Option<&str>) -> OptaResult<Option<ParentRef>> {
    if let Some(environments) = raw.get("environments").and_then(Value::as_array) {
        let chosen = match env {
            Some(env) => environments
                .iter()
                .find(|e| e.get("name").and_then(Value::as_str) == Some(env))
                .ok_or_else(|| OptaError::user(format!("No environment named {} in `environments`", env)))?,
            None if environments.len() == 1 => &environments[0],
            None => {
                let names: Vec<&str> = environments
                    .iter()
                    .filter_map(|e| e.get("name").and_then(Value::as_str))
                    .collect();
                return Err(OptaError::user(format!(
                    "This layer has several environments ({}); pick one with --env",
                    names.join(", ")
                )));
            }
        };
        let path = chosen
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| OptaError::user("Every entry of `environments` needs a `path`"))?;
        return Ok(Some(ParentRef {
            path: dir.join(path),
            variables: chosen.get("variables").and_then(Value::as_object).cloned(),
        }));
    }

    Ok(raw.get("parent").and_then(Value::as_str).map(|path| ParentRef {
        path: dir.join(path),
        variables: None,
    }))
}

impl Layer {
    pub fn load_from_yaml(ctx: &Context, path: &Path, options: &LoadOptions) -> OptaResult<Layer> {
        let mut visited = Vec::new();
        Self::load(ctx, path, options, &mut visited)
    }

    fn load(
        ctx: &Context,
        path: &Path,
        options: &LoadOptions,
        visited: &mut Vec<PathBuf>,
    ) -> OptaResult<Layer> {
        let absolute = std::fs::canonicalize(path)
            .map_err(|_| OptaError::user(format!("Could not find config file {}", path.display())))?;
        if visited.contains(&absolute) {
            let chain: Vec<String> = visited
                .iter()
                .chain(std::iter::once(&absolute))
                .map(|p| p.display().to_string())
                .collect();
            return Err(OptaError::CycleDetected(chain.join(" -> ")));
        }
        visited.push(absolute.clone());

        let original_spec = std::fs::read_to_string(&absolute)?;
        let document: Value = serde_yaml::from_str(&original_spec)?;
        let raw = document
            .as_object()
            .cloned()
            .ok_or_else(|| OptaError::user(format!("{} is not a YAML mapping", absolute.display())))?;

        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| OptaError::user(format!("{} has no `name`", absolute.display())))?
            .to_string();
        validate_layer_name(&name)?;
        debug!("Loading layer {} from {:?}", name, absolute);

        let dir = absolute.parent().map(Path::to_path_buf).unwrap_or_default();
        let parent_ref = find_parent(&raw, &dir, options.env.as_deref())?;
        let parent = match &parent_ref {
            Some(parent_ref) => {
                let parent_options = LoadOptions::default().lenient();
                Some(Box::new(Self::load(ctx, &parent_ref.path, &parent_options, visited)?))
            }
            None => None,
        };

        if let Some(parent) = &parent {
            if parent.name == name {
                return Err(OptaError::user(format!(
                    "Layer {} has the same name as its parent",
                    name
                )));
            }
        }

        let own_providers = raw
            .get("providers")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let providers = match &parent {
            Some(parent) => merge_providers(&name, &own_providers, &parent.providers)?,
            None => own_providers,
        };

        let cloud = match &parent {
            Some(parent) => parent.cloud,
            None => cloud_from_providers(&providers).ok_or_else(|| {
                OptaError::user(format!(
                    "Layer {} configures no cloud under `providers` (aws, google, azurerm, local or helm)",
                    name
                ))
            })?,
        };

        let org_name = match (raw.get("org_name").and_then(Value::as_str), &parent) {
            (Some(org), _) => org.to_string(),
            (None, Some(parent)) => parent.org_name.clone(),
            (None, None) if cloud.has_remote_bucket() => {
                return Err(OptaError::user(format!(
                    "Environment layer {} needs an `org_name`",
                    name
                )))
            }
            (None, None) => "opta".to_string(),
        };

        let root_name = parent
            .as_ref()
            .map(|p| p.root().name.clone())
            .unwrap_or_else(|| name.clone());
        let state_storage = raw
            .get("meta")
            .and_then(|m| m.get("state_storage"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| parent.as_ref().map(|p| p.state_storage.clone()))
            .unwrap_or_else(|| StateLocation::default_storage(&org_name, &root_name));

        let env_variables = parent_ref.as_ref().and_then(|p| p.variables.as_ref());
        let variables = resolve_variables(&raw, env_variables, options)?;

        let mut layer = Layer {
            name,
            org_name,
            cloud,
            path: absolute,
            providers,
            parent,
            modules: Vec::new(),
            variables,
            original_spec,
            state_storage,
            kube: None,
            processed: false,
        };

        let entries = layer.module_entries(ctx, &raw)?;
        let scope = layer.scope(&ctx.config);
        for entry in entries {
            let hydrated = scope.hydrate(&entry)?;
            let module = Module::new(
                &ctx.registry,
                layer.cloud,
                &hydrated,
                &ctx.config.modules_dir,
                &ctx.config.workdir,
            )?;
            if layer.modules.iter().any(|m| m.name == module.name) {
                return Err(OptaError::InvalidName(format!(
                    "Module name {} is used twice in layer {}",
                    module.name, layer.name
                )));
            }
            layer.modules.push(module);
        }

        let names: BTreeSet<&str> = layer.modules.iter().map(|m| m.name.as_str()).collect();
        for module in &layer.modules {
            if let Some(missing) = module.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(OptaError::validation(
                    &module.name,
                    format!("depends_on names unknown module {}", missing),
                ));
            }
        }

        info!(
            "Loaded layer {} ({} modules, cloud {})",
            layer.name,
            layer.modules.len(),
            layer.cloud
        );
        Ok(layer)
    }

    /// Macro fragments first, then the declared `modules`.
    fn module_entries(&self, ctx: &Context, raw: &Map<String, Value>) -> OptaResult<Vec<Value>> {
        let mut entries = Vec::new();
        for key in ctx.registry.macro_keys(self.cloud) {
            let Some(value) = raw.get(key) else {
                continue;
            };
            let Some(fragment) = ctx.registry.macro_fragment(self.cloud, key) else {
                continue;
            };
            debug!("Expanding macro {} in layer {}", key, self.name);
            for template in fragment {
                let mut entry = template.as_object().cloned().unwrap_or_default();
                let module_type = entry.get("type").and_then(Value::as_str).map(str::to_string);
                if let (Some(module_type), Some(overrides)) = (module_type, value.as_object()) {
                    if let Some(fields) = overrides.get(&module_type).and_then(Value::as_object) {
                        overlay(&mut entry, fields);
                    }
                }
                entries.push(Value::Object(entry));
            }
        }

        match raw.get("modules") {
            None | Some(Value::Null) => {}
            Some(Value::Array(modules)) => entries.extend(modules.iter().cloned()),
            Some(_) => return Err(OptaError::user("`modules` must be a list")),
        }
        Ok(entries)
    }

    pub fn root(&self) -> &Layer {
        match &self.parent {
            Some(parent) => parent.root(),
            None => self,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref().map(|p| p.name.as_str())
    }

    /// Directory of the YAML file; local paths in module data are relative to it.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// The provider block of the layer's cloud.
    pub fn provider_config(&self) -> Map<String, Value> {
        self.providers
            .get(self.cloud.as_str())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    pub fn provider_str(&self, field: &str) -> Option<String> {
        self.providers
            .get(self.cloud.as_str())
            .and_then(|p| p.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn variable_str(&self, name: &str) -> Option<&str> {
        self.variables.get(name).and_then(Value::as_str)
    }

    pub fn state_location(&self, config: &OptaConfig) -> StateLocation {
        StateLocation::new(self.cloud, &self.name, &self.state_storage)
            .with_org(&self.org_name)
            .with_root(&self.root().name)
            .with_provider(self.provider_config())
            .with_opta_home(&config.opta_home)
    }

    /// Kubeconfig and context opta uses for this layer's cluster when no
    /// client has produced one yet.
    pub fn default_kube_target(&self, config: &OptaConfig) -> KubeTarget {
        if let Some(target) = &self.kube {
            return target.clone();
        }
        let root = self.root();
        match self.cloud {
            Cloud::Helm => KubeTarget {
                kubeconfig: self
                    .provider_str("kubeconfig")
                    .map(PathBuf::from)
                    .or_else(|| config.kubeconfig.clone())
                    .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".kube/config")))
                    .unwrap_or_else(|| PathBuf::from(".kube/config")),
                context: self.provider_str("kube_context").unwrap_or_default(),
            },
            Cloud::Local => KubeTarget {
                kubeconfig: kubeconfig_path(&config.kubeconfigs_dir(), &root.name, self.cloud),
                context: LOCAL_KUBE_CONTEXT.to_string(),
            },
            _ => KubeTarget {
                kubeconfig: kubeconfig_path(&config.kubeconfigs_dir(), &root.name, self.cloud),
                context: format!("opta-{}-{}-{}", self.org_name, root.name, self.cloud),
            },
        }
    }

    /// Names visible to `${{ ... }}` expressions in this layer.
    pub fn scope(&self, config: &OptaConfig) -> Scope {
        let kube = self.default_kube_target(config);
        let mut scope = Scope::new()
            .with("env", self.root().name.as_str())
            .with("layer_name", self.name.as_str())
            .with("parent_name", self.parent_name().unwrap_or_default())
            .with("state_storage", self.state_storage.as_str())
            .with("org_name", self.org_name.as_str())
            .with("opta_home", config.opta_home.display().to_string())
            .with("kubeconfig", kube.kubeconfig.display().to_string())
            .with("kube_context", kube.context)
            .with_json("variables", &Value::Object(self.variables.clone()))
            .with_json("vars", &Value::Object(self.variables.clone()))
            .with_parent(self.parent.is_some());
        for (provider, fields) in &self.providers {
            scope = scope.with_json(provider.clone(), fields);
        }
        scope
    }

    /// Look up a module processed before `current_index`.
    pub fn get_module(&self, name: &str, current_index: usize) -> OptaResult<Option<&Module>> {
        match self.modules.iter().position(|m| m.name == name) {
            Some(position) if position >= current_index => Err(OptaError::ForwardReference {
                module: self
                    .modules
                    .get(current_index)
                    .map(|m| m.name.clone())
                    .unwrap_or_default(),
                referenced: name.to_string(),
            }),
            Some(position) => Ok(self.modules.get(position)),
            None => Ok(None),
        }
    }

    /// The last module of one of `types` declared before `current_index`.
    pub fn find_module_before(&self, types: &[&str], current_index: usize) -> Option<&Module> {
        self.modules[..current_index.min(self.modules.len())]
            .iter()
            .rev()
            .find(|m| m.is_type(types))
    }

    /// Any module of one of `types` in this layer.
    pub fn find_module(&self, types: &[&str]) -> Option<&Module> {
        self.modules.iter().find(|m| m.is_type(types))
    }

    pub fn module_index(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name == name)
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Run every module's processor once, in declared order.
    pub async fn process_modules(&mut self, ctx: &Context) -> OptaResult<()> {
        if self.processed {
            return Ok(());
        }
        for index in 0..self.modules.len() {
            let kind = ProcessorKind::for_type(&self.modules[index].module_type);
            debug!(
                "Processing module [{}/{}]: {} ({:?})",
                index + 1,
                self.modules.len(),
                self.modules[index].name,
                kind
            );
            kind.process(self, index, ctx).await?;
        }
        self.processed = true;
        Ok(())
    }

    pub async fn pre_hook(&self, index: usize, ctx: &Context) -> OptaResult<()> {
        ProcessorKind::for_type(&self.modules[index].module_type)
            .pre_hook(self, index, ctx)
            .await
    }

    pub async fn post_hook(&self, index: usize, ctx: &Context, error: Option<&OptaError>) -> OptaResult<()> {
        ProcessorKind::for_type(&self.modules[index].module_type)
            .post_hook(self, index, ctx, error)
            .await
    }

    pub async fn post_delete(&self, index: usize, ctx: &Context) -> OptaResult<()> {
        ProcessorKind::for_type(&self.modules[index].module_type)
            .post_delete(self, index, ctx)
            .await
    }

    /// Structured config uploaded after a successful apply.
    pub fn structured_config(
        &self,
        config: &OptaConfig,
        defaults: std::collections::BTreeMap<String, Vec<UsedDefault>>,
    ) -> StructuredConfig {
        StructuredConfig::new(config.version.clone(), self.original_spec.clone())
            .with_parent(self.parent_name().map(str::to_string))
            .with_defaults(defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_layer_names() {
        assert!(validate_layer_name("staging-1").is_ok());
        assert!(validate_layer_name("Staging").is_err());
        assert!(validate_layer_name("-x").is_err());
        assert!(validate_layer_name("a_b").is_err());
    }

    #[test]
    fn test_provider_merge_rejects_conflicts() {
        let parent = json!({"aws": {"region": "us-east-1", "account_id": "1"}});
        let parent = parent.as_object().unwrap();

        let same = json!({"aws": {"region": "us-east-1"}});
        let merged = merge_providers("app", same.as_object().unwrap(), parent).unwrap();
        assert_eq!(merged["aws"]["account_id"], "1");

        let conflicting = json!({"aws": {"region": "eu-west-1"}});
        assert!(merge_providers("app", conflicting.as_object().unwrap(), parent).is_err());
    }

    #[test]
    fn test_variable_precedence() {
        let raw = json!({"input_variables": [{"name": "tag", "default": "latest"}, {"name": "replicas"}]});
        let raw = raw.as_object().unwrap();
        let env = json!({"replicas": 2, "tag": "env"});

        let options = LoadOptions::default().var("tag", json!("cli"));
        let vars = resolve_variables(raw, env.as_object(), &options).unwrap();
        assert_eq!(vars["tag"], "cli");
        assert_eq!(vars["replicas"], 2);

        let err = resolve_variables(raw, None, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, OptaError::UnboundVariable(ref name) if name == "replicas"));
        assert!(resolve_variables(raw, None, &LoadOptions::default().lenient()).is_ok());
    }
}
