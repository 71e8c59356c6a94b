//! Links between modules.
//!
//! A service lists the modules it needs under `links`. Each entry is either a
//! bare module name or a one-key mapping from the name to a list of
//! permissions. Connection-style targets (databases, caches) turn into
//! `link_secrets` entries that reference the target's outputs; IAM-style
//! targets are handled by [`crate::iam::IamAssembler`].

use serde_json::{json, Map, Value};

use crate::error::{OptaError, OptaResult};
use crate::interpolation::module_ref;
use crate::module::Module;

/// One parsed entry of a module's `links`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub target: String,
    pub permissions: Vec<Value>,
}

/// Parse the `links` list of `module`.
pub fn parse_links(module: &Module) -> OptaResult<Vec<LinkRequest>> {
    let Some(links) = module.get("links") else {
        return Ok(Vec::new());
    };
    let links = links
        .as_array()
        .ok_or_else(|| OptaError::validation(&module.name, "`links` must be a list"))?;

    let mut requests = Vec::new();
    for entry in links {
        match entry {
            Value::String(target) => requests.push(LinkRequest {
                target: target.clone(),
                permissions: Vec::new(),
            }),
            Value::Object(map) if map.len() == 1 => {
                let (target, permissions) = map.iter().next().ok_or_else(|| {
                    OptaError::validation(&module.name, "empty link entry")
                })?;
                let permissions = match permissions {
                    Value::Null => Vec::new(),
                    Value::Array(items) => items.clone(),
                    Value::String(single) => vec![Value::String(single.clone())],
                    other => {
                        return Err(OptaError::validation(
                            &module.name,
                            format!("permissions for link {} must be a list, got {}", target, other),
                        ))
                    }
                };
                requests.push(LinkRequest {
                    target: target.clone(),
                    permissions,
                });
            }
            other => {
                return Err(OptaError::validation(
                    &module.name,
                    format!("invalid link entry {}", other),
                ))
            }
        }
    }
    Ok(requests)
}

/// Secret names a connection-style module type exposes to linked services,
/// or `None` if the type is not linked that way.
pub fn connection_vars(module_type: &str) -> Option<&'static [&'static str]> {
    match module_type {
        "aws-postgres" | "aws-mysql" | "gcp-postgres" | "azure-postgres" | "local-postgres"
        | "local-mysql" => Some(&["db_user", "db_name", "db_password", "db_host"]),
        "aws-redis" | "gcp-redis" | "azure-redis" | "local-redis" => {
            Some(&["cache_host", "cache_auth_token"])
        }
        "aws-documentdb" | "local-mongodb" => Some(&["db_user", "db_host", "db_password"]),
        "mongodb-atlas" => Some(&["mongodb_atlas_connection_string", "db_user", "db_password"]),
        _ => None,
    }
}

/// Add `link_secrets` entries to `source` for each of `required_vars` of the
/// linked module.
///
/// Secrets are named `<linked>_<var>` unless the last permission is a mapping
/// whose keys are exactly `required_vars`; then the mapping's values are the
/// names. Any other permission token is rejected. An entry whose name is
/// already present is left alone, so linking twice changes nothing.
pub fn handle_link(
    source: &mut Module,
    linked_module: &str,
    permissions: &[Value],
    required_vars: &[&str],
) -> OptaResult<()> {
    let mut remaining = permissions.to_vec();
    let mut renames: Map<String, Value> = Map::new();

    if let Some(Value::Object(last)) = remaining.last() {
        let mut keys: Vec<&str> = last.keys().map(String::as_str).collect();
        let mut expected = required_vars.to_vec();
        keys.sort_unstable();
        expected.sort_unstable();
        if keys == expected {
            renames = last.clone();
            remaining.pop();
        }
    }

    if !remaining.is_empty() {
        let leftover: Vec<String> = remaining.iter().map(|v| v.to_string()).collect();
        return Err(OptaError::validation(
            &source.name,
            format!(
                "link to {} takes no permissions other than a rename of {:?}, got {}",
                linked_module,
                required_vars,
                leftover.join(", ")
            ),
        ));
    }

    let mut secrets = match source.remove("link_secrets") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(OptaError::validation(
                &source.name,
                format!("`link_secrets` must be a list, got {}", other),
            ))
        }
    };

    for var in required_vars {
        let name = match renames.get(*var) {
            Some(Value::String(renamed)) => renamed.clone(),
            Some(other) => {
                return Err(OptaError::validation(
                    &source.name,
                    format!("rename of {} must be a string, got {}", var, other),
                ))
            }
            None => format!("{}_{}", linked_module, var),
        };
        let exists = secrets
            .iter()
            .any(|s| s.get("name").and_then(Value::as_str) == Some(name.as_str()));
        if !exists {
            secrets.push(json!({ "name": name, "value": module_ref(linked_module, var) }));
        }
    }

    source.set("link_secrets", Value::Array(secrets));
    Ok(())
}

/// Drop `link_secrets` entries whose name was already seen.
pub fn dedup_link_secrets(module: &mut Module) {
    if let Some(Value::Array(secrets)) = module.remove("link_secrets") {
        let mut seen: Vec<String> = Vec::new();
        let mut kept = Vec::new();
        for secret in secrets {
            let name = secret.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            kept.push(secret);
        }
        module.set("link_secrets", Value::Array(kept));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::{Cloud, Registry};
    use std::path::Path;

    fn service(links: Value) -> Module {
        let registry = Registry::embedded().unwrap();
        Module::new(
            &registry,
            Cloud::Aws,
            &json!({"type": "aws-k8s-service", "name": "app", "links": links}),
            Path::new("/opt/opta/modules"),
            Path::new("/opt/opta"),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_links() {
        let m = service(json!(["db", {"bucket": ["write"]}, {"queue": "publish"}]));
        let links = parse_links(&m).unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].target, "db");
        assert!(links[0].permissions.is_empty());
        assert_eq!(links[1].permissions, vec![json!("write")]);
        assert_eq!(links[2].permissions, vec![json!("publish")]);
    }

    #[test]
    fn test_default_secret_names() {
        let mut m = service(json!(["db"]));
        let vars = connection_vars("aws-postgres").unwrap();
        handle_link(&mut m, "db", &[], vars).unwrap();
        let secrets = m.get("link_secrets").unwrap().as_array().unwrap();
        assert_eq!(secrets.len(), 4);
        assert_eq!(secrets[0], json!({"name": "db_db_user", "value": "${{module.db.db_user}}"}));
    }

    #[test]
    fn test_rename_and_idempotence() {
        let mut m = service(json!([]));
        let vars = connection_vars("aws-redis").unwrap();
        let rename = vec![json!({"cache_host": "REDIS_HOST", "cache_auth_token": "REDIS_TOKEN"})];
        handle_link(&mut m, "cache", &rename, vars).unwrap();
        let once = m.get("link_secrets").cloned();
        handle_link(&mut m, "cache", &rename, vars).unwrap();
        assert_eq!(m.get("link_secrets").cloned(), once);
        assert_eq!(once.unwrap()[0]["name"], "REDIS_HOST");
    }

    #[test]
    fn test_leftover_permissions_rejected() {
        let mut m = service(json!([]));
        let err = handle_link(&mut m, "db", &[json!("write")], connection_vars("aws-mysql").unwrap())
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mut m = service(json!([]));
        m.set(
            "link_secrets",
            json!([{"name": "A", "value": "1"}, {"name": "A", "value": "2"}, {"name": "B", "value": "3"}]),
        );
        dedup_link_secrets(&mut m);
        assert_eq!(m.get("link_secrets").unwrap(), &json!([{"name": "A", "value": "1"}, {"name": "B", "value": "3"}]));
    }
}
