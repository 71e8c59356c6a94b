//! Catalog consistency checks.

use std::collections::HashSet;

use crate::models::CloudCatalog;

/// Validation result with details.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }
}

/// Validator for catalog sections.
pub struct CatalogValidator;

impl CatalogValidator {
    /// Check names, aliases and inputs of one cloud's catalog.
    pub fn validate(catalog: &CloudCatalog) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut names = HashSet::new();

        for module in &catalog.modules {
            if !names.insert(module.name.as_str()) {
                result.add_error(format!("duplicate module type `{}`", module.name));
            }
            for alias in &module.aliases {
                if !names.insert(alias.as_str()) {
                    result.add_error(format!(
                        "alias `{}` of `{}` collides with another type",
                        alias, module.name
                    ));
                }
            }

            let mut inputs = HashSet::new();
            for input in &module.inputs {
                if !inputs.insert(input.name.as_str()) {
                    result.add_error(format!(
                        "module type `{}` declares input `{}` twice",
                        module.name, input.name
                    ));
                }
                if input.required && input.default.is_some() {
                    result.add_error(format!(
                        "required input `{}` of `{}` must not carry a default",
                        input.name, module.name
                    ));
                }
            }

            let mut outputs = HashSet::new();
            for output in &module.outputs {
                if !outputs.insert(output.name.as_str()) {
                    result.add_error(format!(
                        "module type `{}` declares output `{}` twice",
                        module.name, output.name
                    ));
                }
            }
        }

        for (key, fragment) in &catalog.macros {
            for entry in fragment {
                let module_type = entry.get("type").and_then(|t| t.as_str());
                match module_type {
                    Some(t) if names.contains(t) => {}
                    Some(t) => result.add_error(format!("macro `{}` expands to unknown type `{}`", key, t)),
                    None => result.add_error(format!("macro `{}` has an entry without a type", key)),
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cloud;
    use crate::reader::CatalogReader;

    #[test]
    fn test_embedded_catalogs_are_consistent() {
        for catalog in CatalogReader::embedded().unwrap() {
            let result = CatalogValidator::validate(&catalog);
            assert!(result.valid, "{}: {:?}", catalog.cloud, result.errors);
        }
    }

    #[test]
    fn test_duplicate_alias_detected() {
        let catalog = CatalogReader::parse(
            Cloud::Local,
            r#"
cloud: local
backend:
  kind: local
modules:
  - name: local-postgres
    aliases: [postgres]
  - name: postgres
"#,
        )
        .unwrap();
        let result = CatalogValidator::validate(&catalog);
        assert!(!result.valid);
        assert!(result.errors[0].contains("postgres"));
    }

    #[test]
    fn test_required_with_default_detected() {
        let catalog = CatalogReader::parse(
            Cloud::Local,
            r#"
cloud: local
backend:
  kind: local
modules:
  - name: local-base
    inputs:
      - name: foo
        required: true
        default: 1
"#,
        )
        .unwrap();
        assert!(!CatalogValidator::validate(&catalog).valid);
    }
}
