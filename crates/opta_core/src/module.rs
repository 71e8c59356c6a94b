//! A single module block of a layer.

use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use opta_iac::UsedDefault;
use opta_registry::{Cloud, ModuleTypeSpec, Registry, RegistryError};

use crate::error::{OptaError, OptaResult};
use crate::inputs::{InjectedValues, InputResolver};

/// Keys of a module entry that steer opta and never reach Terraform.
const CONTROL_KEYS: [&str; 4] = ["type", "name", "depends_on", "links"];

/// One entry of a layer's `modules` list, bound to its catalog type.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    /// Canonical type name.
    pub module_type: String,
    /// The alias the user wrote, if any.
    pub aliased_type: Option<String>,
    pub data: Map<String, Value>,
    pub depends_on: Vec<String>,
    /// Terraform `source`, relative to the workdir.
    pub module_dir_path: Option<String>,
    pub used_defaults: Vec<UsedDefault>,
    /// Data keys forwarded to Terraform on top of the declared inputs.
    pub passthrough_inputs: Vec<String>,
    spec: ModuleTypeSpec,
}

/// `Module::render_terraform` output.
#[derive(Debug, Clone)]
pub struct RenderedModule {
    pub name: String,
    pub block: Value,
    pub outputs: Map<String, Value>,
    pub used_defaults: Vec<UsedDefault>,
}

pub fn validate_module_name(name: &str) -> OptaResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(OptaError::InvalidName(format!(
            "Invalid module name `{}`: only letters and digits are allowed",
            name
        )));
    }
    Ok(())
}

/// Name used when an entry does not set one: the type without separators.
pub fn default_module_name(module_type: &str) -> String {
    module_type.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Components of `path` with `.` dropped and `dir/..` folded away.
fn normalized(path: &Path) -> Vec<Component<'_>> {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir if matches!(parts.last(), Some(Component::Normal(_))) => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts
}

/// Express `target` relative to `base` the way Terraform expects a local
/// module source: always starting with `./` or `../`.
pub fn relative_source(target: &Path, base: &Path) -> String {
    if target.is_absolute() != base.is_absolute() {
        let display = target.to_string_lossy().replace('\\', "/");
        return if target.is_absolute() || display.starts_with("../") {
            display
        } else {
            format!("./{}", display.trim_start_matches("./"))
        };
    }

    let target = normalized(target);
    let base = normalized(base);
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = std::iter::repeat("..".to_string())
        .take(base.len() - common)
        .collect();
    parts.extend(
        target[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().to_string()),
    );

    let joined = parts.join("/");
    if joined.starts_with("..") {
        joined
    } else {
        format!("./{}", joined)
    }
}

impl Module {
    /// Bind a raw module entry to its catalog type.
    pub fn new(
        registry: &Registry,
        cloud: Cloud,
        entry: &Value,
        modules_dir: &Path,
        workdir: &Path,
    ) -> OptaResult<Self> {
        let data = entry
            .as_object()
            .cloned()
            .ok_or_else(|| OptaError::user("Every entry under `modules` must be a mapping"))?;

        let type_name = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| OptaError::user("Module entry is missing its `type`"))?
            .to_string();

        let name = match data.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(OptaError::InvalidName(format!(
                    "Module name must be a string, got {}",
                    other
                )))
            }
            None => default_module_name(&type_name),
        };
        validate_module_name(&name)?;

        let resolved = registry
            .get_module_type(cloud, &type_name)
            .map_err(|e| match e {
                RegistryError::UnknownModuleType { cloud, module_type } => {
                    OptaError::UnknownModuleType { cloud, module_type }
                }
                other => other.into(),
            })?;

        let module_dir_path = resolved
            .spec
            .module_dir
            .as_deref()
            .map(|dir| relative_source(&modules_dir.join(dir), workdir));

        let depends_on = data
            .get("depends_on")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            module_type: resolved.spec.name.clone(),
            aliased_type: resolved.aliased_type.map(str::to_string),
            data,
            depends_on,
            module_dir_path,
            used_defaults: Vec::new(),
            passthrough_inputs: Vec::new(),
            spec: resolved.spec.clone(),
        })
    }

    pub fn spec(&self) -> &ModuleTypeSpec {
        &self.spec
    }

    pub fn is_type(&self, types: &[&str]) -> bool {
        types.contains(&self.module_type.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Set `key` unless the user already did.
    pub fn set_default(&mut self, key: &str, value: Value) {
        if !self.data.contains_key(key) {
            self.data.insert(key.to_string(), value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Forward `key` from data to Terraform even though the type does not declare it.
    pub fn pass_through(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.passthrough_inputs.contains(&key) {
            self.passthrough_inputs.push(key);
        }
    }

    /// Packaged module directory on disk, when the type has one.
    pub fn module_source_dir(&self, modules_dir: &Path) -> Option<PathBuf> {
        self.spec.module_dir.as_deref().map(|dir| modules_dir.join(dir))
    }

    /// Render the `module.<name>` block and its exported outputs.
    pub fn render_terraform(
        &self,
        output_prefix: Option<&str>,
        previous: &[UsedDefault],
        injected: &InjectedValues,
    ) -> OptaResult<RenderedModule> {
        let source = self.module_dir_path.clone().ok_or_else(|| {
            OptaError::validation(&self.name, "no Terraform source is configured")
        })?;

        let resolved =
            InputResolver::resolve(&self.name, &self.spec, &self.data, previous, injected)?;

        let mut block = Map::new();
        block.insert("source".to_string(), Value::String(source));
        block.extend(resolved.inputs);
        for key in &self.passthrough_inputs {
            if CONTROL_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = self.data.get(key) {
                block.insert(key.clone(), value.clone());
            }
        }
        if !self.depends_on.is_empty() {
            block.insert(
                "depends_on".to_string(),
                Value::Array(
                    self.depends_on
                        .iter()
                        .map(|name| Value::String(format!("module.{}", name)))
                        .collect(),
                ),
            );
        }

        let mut outputs = Map::new();
        if self.spec.is_exportable {
            for output in self.spec.exported_outputs() {
                let key = match output_prefix {
                    Some(prefix) => format!("{}_{}", prefix, output.name),
                    None => output.name.clone(),
                };
                let mut entry = Map::new();
                entry.insert(
                    "value".to_string(),
                    Value::String(format!("${{module.{}.{}}}", self.name, output.name)),
                );
                if output.sensitive {
                    entry.insert("sensitive".to_string(), Value::Bool(true));
                }
                outputs.insert(key, Value::Object(entry));
            }
        }

        Ok(RenderedModule {
            name: self.name.clone(),
            block: Value::Object(block),
            outputs,
            used_defaults: resolved.used_defaults,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn injected(name: &str) -> InjectedValues {
        InjectedValues {
            module_name: name.to_string(),
            layer_name: "staging".to_string(),
            env_name: "staging".to_string(),
        }
    }

    fn module(entry: Value) -> OptaResult<Module> {
        let registry = Registry::embedded().unwrap();
        Module::new(
            &registry,
            Cloud::Aws,
            &entry,
            Path::new("/opt/opta/modules"),
            Path::new("/opt/opta/work"),
        )
    }

    #[test]
    fn test_relative_source() {
        assert_eq!(
            relative_source(Path::new("/a/modules/aws_base/tf_module"), Path::new("/a")),
            "./modules/aws_base/tf_module"
        );
        assert_eq!(
            relative_source(Path::new("/a/modules/x"), Path::new("/a/b/c")),
            "../../modules/x"
        );
        assert_eq!(relative_source(Path::new("modules/x"), Path::new("/work")), "./modules/x");
        assert_eq!(
            relative_source(Path::new("/a/work/../modules/x"), Path::new("/a/out")),
            "../modules/x"
        );
    }

    #[test]
    fn test_alias_and_source() {
        let m = module(json!({"type": "postgres", "name": "db"})).unwrap();
        assert_eq!(m.module_type, "aws-postgres");
        assert_eq!(m.aliased_type.as_deref(), Some("postgres"));
        assert_eq!(m.module_dir_path.as_deref(), Some("../modules/aws_postgres/tf_module"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            module(json!({"type": "aws-s3", "name": "my-bucket"})),
            Err(OptaError::InvalidName(_))
        ));
        assert!(matches!(
            module(json!({"type": "aws-nothing"})),
            Err(OptaError::UnknownModuleType { .. })
        ));
        assert_eq!(module(json!({"type": "aws-s3", "bucket_name": "b"})).unwrap().name, "awss3");
    }

    #[test]
    fn test_render_round_trip() {
        let m = module(json!({
            "type": "aws-s3",
            "name": "bucket",
            "bucket_name": "bucket1",
            "links": ["ignored"],
            "depends_on": ["db"]
        }))
        .unwrap();
        let previous = vec![UsedDefault {
            input_name: "block_public".into(),
            default_value: json!(false),
            force_update_default_counter: 0,
        }];
        let rendered = m.render_terraform(None, &previous, &injected("bucket")).unwrap();
        let resolved =
            InputResolver::resolve("bucket", m.spec(), &m.data, &previous, &injected("bucket")).unwrap();

        let parsed: Value = serde_json::from_str(&rendered.block.to_string()).unwrap();
        let mut expected = resolved.inputs.clone();
        expected.insert("source".into(), json!("../modules/aws_s3/tf_module"));
        expected.insert("depends_on".into(), json!(["module.db"]));
        assert_eq!(parsed, Value::Object(expected));
        assert!(parsed.get("links").is_none());
        assert_eq!(parsed["block_public"], json!(false));
        assert_eq!(rendered.outputs["bucket_arn"]["value"], json!("${module.bucket.bucket_arn}"));
    }

    #[test]
    fn test_sensitive_and_prefixed_outputs() {
        let m = module(json!({"type": "aws-redis", "name": "cache", "kms_account_key_arn": "k", "vpc_id": "v", "private_subnet_ids": []})).unwrap();
        let rendered = m.render_terraform(Some("cache"), &[], &injected("cache")).unwrap();
        assert_eq!(rendered.outputs["cache_cache_auth_token"]["sensitive"], json!(true));
        assert!(rendered.outputs["cache_cache_host"].get("sensitive").is_none());
    }
}
