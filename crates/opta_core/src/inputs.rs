//! Resolve a module's declared inputs from user data, injected layer values
//! and catalog defaults.
//!
//! Defaults are sticky: once a deployment has used a default, later runs
//! reuse the stored value until the catalog bumps that input's
//! `force_update_default_counter`.

use serde_json::{Map, Value};
use tracing::debug;

use opta_iac::UsedDefault;
use opta_registry::ModuleTypeSpec;

use crate::error::{OptaError, OptaResult};

/// Values the layer injects into every module.
#[derive(Debug, Clone)]
pub struct InjectedValues {
    pub module_name: String,
    pub layer_name: String,
    pub env_name: String,
}

impl InjectedValues {
    fn get(&self, input: &str) -> Option<&str> {
        match input {
            "module_name" => Some(&self.module_name),
            "layer_name" => Some(&self.layer_name),
            "env_name" => Some(&self.env_name),
            _ => None,
        }
    }
}

/// Output of [`InputResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInputs {
    /// Inputs in catalog order.
    pub inputs: Map<String, Value>,
    pub used_defaults: Vec<UsedDefault>,
}

pub struct InputResolver;

impl InputResolver {
    pub fn resolve(
        module_name: &str,
        spec: &ModuleTypeSpec,
        user_data: &Map<String, Value>,
        previous: &[UsedDefault],
        injected: &InjectedValues,
    ) -> OptaResult<ResolvedInputs> {
        let mut inputs = Map::new();
        let mut used_defaults = Vec::new();

        for input in &spec.inputs {
            if let Some(value) = user_data.get(&input.name) {
                inputs.insert(input.name.clone(), value.clone());
                continue;
            }

            if let Some(value) = injected.get(&input.name) {
                inputs.insert(input.name.clone(), Value::String(value.to_string()));
                continue;
            }

            if input.required {
                return Err(OptaError::MissingInput {
                    module: module_name.to_string(),
                    input: input.name.clone(),
                });
            }

            let Some(default) = &input.default else {
                continue;
            };

            let stored = previous.iter().find(|d| d.input_name == input.name);
            let used = match stored {
                Some(stored)
                    if stored.force_update_default_counter >= input.force_update_default_counter =>
                {
                    stored.clone()
                }
                _ => {
                    if stored.is_some() {
                        debug!(
                            "Default of {}.{} bumped to counter {}",
                            module_name, input.name, input.force_update_default_counter
                        );
                    }
                    UsedDefault {
                        input_name: input.name.clone(),
                        default_value: default.clone(),
                        force_update_default_counter: input.force_update_default_counter,
                    }
                }
            };
            inputs.insert(input.name.clone(), used.default_value.clone());
            used_defaults.push(used);
        }

        Ok(ResolvedInputs {
            inputs,
            used_defaults,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::InputSpec;
    use serde_json::json;

    fn input(name: &str, required: bool, default: Option<Value>, counter: u32) -> InputSpec {
        InputSpec {
            name: name.to_string(),
            required,
            user_facing: true,
            default,
            force_update_default_counter: counter,
            description: String::new(),
        }
    }

    fn spec(inputs: Vec<InputSpec>) -> ModuleTypeSpec {
        ModuleTypeSpec {
            name: "aws-test".to_string(),
            aliases: vec![],
            module_dir: Some("aws_test/tf_module".to_string()),
            halt: false,
            is_exportable: true,
            root_only: false,
            description: String::new(),
            inputs,
            outputs: vec![],
        }
    }

    fn injected() -> InjectedValues {
        InjectedValues {
            module_name: "thing".to_string(),
            layer_name: "app".to_string(),
            env_name: "staging".to_string(),
        }
    }

    #[test]
    fn test_precedence_user_then_injected_then_default() {
        let spec = spec(vec![
            input("layer_name", true, None, 0),
            input("size", false, Some(json!(1)), 0),
            input("name", true, None, 0),
            input("optional", false, None, 0),
        ]);
        let mut data = Map::new();
        data.insert("name".into(), json!("bob"));
        data.insert("layer_name".into(), json!("override"));

        let resolved = InputResolver::resolve("thing", &spec, &data, &[], &injected()).unwrap();
        assert_eq!(resolved.inputs["layer_name"], json!("override"));
        assert_eq!(resolved.inputs["size"], json!(1));
        assert_eq!(resolved.inputs["name"], json!("bob"));
        assert!(!resolved.inputs.contains_key("optional"));
        assert_eq!(resolved.used_defaults.len(), 1);
    }

    #[test]
    fn test_missing_required_input() {
        let spec = spec(vec![input("bucket_name", true, None, 0)]);
        let err = InputResolver::resolve("thing", &spec, &Map::new(), &[], &injected()).unwrap_err();
        assert!(matches!(err, OptaError::MissingInput { ref input, .. } if input == "bucket_name"));
    }

    #[test]
    fn test_stored_default_is_reused_until_bumped() {
        let spec = spec(vec![input("foo", false, Some(json!(10)), 1)]);
        let previous = vec![UsedDefault {
            input_name: "foo".into(),
            default_value: json!(5),
            force_update_default_counter: 1,
        }];
        let resolved =
            InputResolver::resolve("thing", &spec, &Map::new(), &previous, &injected()).unwrap();
        assert_eq!(resolved.inputs["foo"], json!(5));
        assert_eq!(resolved.used_defaults, previous);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let spec = spec(vec![
            input("a", false, Some(json!({"x": 1})), 0),
            input("env_name", true, None, 0),
        ]);
        let first = InputResolver::resolve("thing", &spec, &Map::new(), &[], &injected()).unwrap();
        let second = InputResolver::resolve("thing", &spec, &Map::new(), &[], &injected()).unwrap();
        assert_eq!(
            serde_json::to_string(&first.inputs).unwrap(),
            serde_json::to_string(&second.inputs).unwrap()
        );
    }
}
