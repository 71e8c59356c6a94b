//! Port declarations of a service.
//!
//! Users either write the legacy single `port: {http: 80}` form or a list
//! of `ports`. Both are normalised to a list of [`PortSpec`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{OptaError, OptaResult};
use crate::interpolation::raw_string;
use crate::module::Module;

/// Annotation telling the ingress which service ports carry raw TCP.
pub const TCP_PORTS_ANNOTATION: &str = "nginx.opta.dev/extra-tcp-ports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Http,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Grpc,
    Websocket,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    pub port: u16,
    pub service_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tls: bool,
}

/// What users write; `service_port` and `type` are optional there.
#[derive(Debug, Deserialize)]
struct PortEntry {
    name: String,
    #[serde(rename = "type", default)]
    port_type: Option<PortType>,
    port: u16,
    #[serde(default)]
    service_port: Option<u16>,
    #[serde(default)]
    protocol: Option<Protocol>,
    #[serde(default)]
    tls: bool,
}

impl PortSpec {
    /// Kubernetes probe kind for this port.
    pub fn probe_type(&self) -> &'static str {
        match (self.port_type, self.protocol) {
            (PortType::Http, None) => "http",
            _ => "tcp",
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.port_type == PortType::Tcp
    }

    /// The port as the Terraform module expects it, probe type included.
    pub fn to_value(&self) -> OptaResult<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("probe_type".to_string(), Value::String(self.probe_type().to_string()));
        }
        Ok(value)
    }

    fn from_entry(entry: PortEntry) -> Self {
        let port_type = entry.port_type.unwrap_or(PortType::Http);
        let service_port = entry.service_port.unwrap_or(match port_type {
            PortType::Http => 80,
            PortType::Tcp => entry.port,
        });
        Self {
            name: entry.name,
            port_type,
            port: entry.port,
            service_port,
            protocol: entry.protocol,
            tls: entry.tls,
        }
    }
}

/// Translate the legacy `port` mapping.
fn from_legacy(module: &Module, port: &Value) -> OptaResult<PortSpec> {
    let map = port
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| OptaError::validation(&module.name, "`port` must map exactly one of http, grpc or tcp to a port"))?;
    let (kind, number) = map
        .iter()
        .next()
        .ok_or_else(|| OptaError::validation(&module.name, "`port` is empty"))?;
    let number = number
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| OptaError::validation(&module.name, format!("invalid port {}", number)))?;

    let protocol = match kind.as_str() {
        "http" => None,
        "grpc" => Some(Protocol::Grpc),
        "tcp" => {
            warn!(
                "Module {}: `port: {{tcp: ...}}` is deprecated and is now served as http with websocket support",
                module.name
            );
            Some(Protocol::Websocket)
        }
        other => {
            return Err(OptaError::validation(
                &module.name,
                format!("unknown port kind `{}`; use http, grpc or tcp", other),
            ))
        }
    };
    Ok(PortSpec {
        name: "main".to_string(),
        port_type: PortType::Http,
        port: number,
        service_port: 80,
        protocol,
        tls: false,
    })
}

/// Read and validate the ports of `module`.
pub fn normalize(module: &Module, multiple_ports_supported: bool) -> OptaResult<Vec<PortSpec>> {
    let ports = match (module.get("port"), module.get("ports")) {
        (Some(_), Some(_)) => {
            return Err(OptaError::validation(
                &module.name,
                "cannot specify both `port` and `ports`",
            ))
        }
        (Some(port), None) => vec![from_legacy(module, port)?],
        (None, Some(list)) => {
            let entries: Vec<PortEntry> = serde_json::from_value(list.clone()).map_err(|e| {
                OptaError::validation(&module.name, format!("invalid `ports`: {}", e))
            })?;
            entries.into_iter().map(PortSpec::from_entry).collect()
        }
        (None, None) => Vec::new(),
    };

    if ports.iter().filter(|p| p.port_type == PortType::Http).count() > 1 {
        return Err(OptaError::validation(&module.name, "at most one http port is allowed"));
    }

    let mut names: Vec<&str> = Vec::new();
    let mut numbers: Vec<u16> = Vec::new();
    let mut service_ports: Vec<u16> = Vec::new();
    for port in &ports {
        if port.is_tcp() && port.protocol.is_some() {
            return Err(OptaError::validation(
                &module.name,
                format!("tcp port {} cannot use an application protocol", port.name),
            ));
        }
        if names.contains(&port.name.as_str()) {
            return Err(OptaError::validation(
                &module.name,
                format!("port name {} is used more than once", port.name),
            ));
        }
        if numbers.contains(&port.port) {
            return Err(OptaError::validation(
                &module.name,
                format!("port {} is used more than once", port.port),
            ));
        }
        if service_ports.contains(&port.service_port) {
            return Err(OptaError::validation(
                &module.name,
                format!("service port {} is used more than once", port.service_port),
            ));
        }
        names.push(&port.name);
        numbers.push(port.port);
        service_ports.push(port.service_port);
    }

    if !multiple_ports_supported {
        let http_count = ports.iter().filter(|p| !p.is_tcp()).count();
        if ports.len() > 1 || http_count != ports.len() {
            return Err(OptaError::validation(
                &module.name,
                "multiple ports and tcp ports need OPTA_MULTIPLE_PORTS to be enabled",
            ));
        }
    }

    Ok(ports)
}

/// Store `ports` on the module together with the derived `http_port`,
/// `probe_port` and TCP service annotation.
pub fn apply(module: &mut Module, ports: &[PortSpec]) -> OptaResult<()> {
    let probe_name = module.get_str("probe_port").map(str::to_string);
    let probe = match &probe_name {
        Some(name) => Some(ports.iter().find(|p| &p.name == name).ok_or_else(|| {
            OptaError::validation(&module.name, format!("probe_port {} does not name a port", name))
        })?),
        None => ports.first(),
    };
    let http = ports.iter().find(|p| p.port_type == PortType::Http);

    let values = ports
        .iter()
        .map(PortSpec::to_value)
        .collect::<OptaResult<Vec<_>>>()?;
    let http_value = http.map(PortSpec::to_value).transpose()?.unwrap_or(Value::Null);
    let probe_value = probe.map(PortSpec::to_value).transpose()?.unwrap_or(Value::Null);

    module.remove("port");
    module.set("ports", Value::Array(values));
    module.set("http_port", http_value);
    module.set("probe_port", probe_value);

    let tcp: Map<String, Value> = ports
        .iter()
        .filter(|p| p.is_tcp())
        .map(|p| (p.service_port.to_string(), Value::String(p.name.clone())))
        .collect();
    if !tcp.is_empty() {
        let mut annotations = match module.remove("service_annotations") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        annotations.insert(
            TCP_PORTS_ANNOTATION.to_string(),
            raw_string(Value::Object(tcp).to_string()),
        );
        module.set("service_annotations", Value::Object(annotations));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opta_registry::{Cloud, Registry};
    use serde_json::json;
    use std::path::Path;

    fn service(extra: Value) -> Module {
        let mut entry = json!({"type": "k8s-service", "name": "app", "image": "nginx"});
        if let (Value::Object(entry), Value::Object(extra)) = (&mut entry, extra) {
            entry.extend(extra);
        }
        let registry = Registry::embedded().unwrap();
        Module::new(&registry, Cloud::Aws, &entry, Path::new("/m"), Path::new("/")).unwrap()
    }

    #[test]
    fn test_legacy_grpc_port() {
        let m = service(json!({"port": {"grpc": 5678}}));
        let ports = normalize(&m, false).unwrap();
        assert_eq!(
            serde_json::to_value(&ports[0]).unwrap(),
            json!({"name": "main", "type": "http", "port": 5678, "service_port": 80, "protocol": "grpc"})
        );
        assert_eq!(ports[0].probe_type(), "tcp");
    }

    #[test]
    fn test_two_http_ports_rejected() {
        let m = service(json!({"ports": [
            {"name": "a", "type": "http", "port": 8080},
            {"name": "b", "type": "http", "port": 8081, "service_port": 81},
        ]}));
        assert!(normalize(&m, true).is_err());
    }

    #[test]
    fn test_legacy_tcp_becomes_websocket() {
        let m = service(json!({"port": {"tcp": 9000}}));
        let ports = normalize(&m, false).unwrap();
        assert_eq!(ports[0].port_type, PortType::Http);
        assert_eq!(ports[0].protocol, Some(Protocol::Websocket));
        assert_eq!(ports[0].probe_type(), "tcp");
    }

    #[test]
    fn test_both_forms_rejected() {
        let m = service(json!({"port": {"http": 80}, "ports": []}));
        assert!(normalize(&m, true).is_err());
    }

    #[test]
    fn test_tcp_with_protocol_rejected() {
        let m = service(json!({"ports": [{"name": "db", "type": "tcp", "port": 5432, "protocol": "grpc"}]}));
        assert!(normalize(&m, true).is_err());
    }

    #[test]
    fn test_duplicate_port_name_rejected() {
        let m = service(json!({"ports": [
            {"name": "main", "type": "http", "port": 8080},
            {"name": "main", "type": "tcp", "port": 9000},
        ]}));
        let err = normalize(&m, true).unwrap_err();
        assert!(err.to_string().contains("port name main is used more than once"));
    }

    #[test]
    fn test_duplicate_port_number_rejected() {
        let m = service(json!({"ports": [
            {"name": "main", "type": "http", "port": 8080},
            {"name": "raw", "type": "tcp", "port": 8080, "service_port": 9000},
        ]}));
        let err = normalize(&m, true).unwrap_err();
        assert!(err.to_string().contains("port 8080 is used more than once"));
    }

    #[test]
    fn test_duplicate_service_port_rejected() {
        // An http port defaults to service port 80.
        let m = service(json!({"ports": [
            {"name": "main", "type": "http", "port": 8080},
            {"name": "raw", "type": "tcp", "port": 9000, "service_port": 80},
        ]}));
        let err = normalize(&m, true).unwrap_err();
        assert!(err.to_string().contains("service port 80 is used more than once"));
    }

    #[test]
    fn test_multiple_ports_need_flag() {
        let m = service(json!({"ports": [
            {"name": "a", "type": "http", "port": 8080},
            {"name": "b", "type": "tcp", "port": 9000},
        ]}));
        assert!(normalize(&m, false).is_err());
        assert_eq!(normalize(&m, true).unwrap().len(), 2);
    }

    #[test]
    fn test_apply_sets_derived_fields() {
        let mut m = service(json!({"ports": [
            {"name": "main", "type": "http", "port": 8080, "protocol": "grpc"},
            {"name": "raw", "type": "tcp", "port": 9000},
        ]}));
        let ports = normalize(&m, true).unwrap();
        apply(&mut m, &ports).unwrap();
        assert_eq!(m.get("http_port").unwrap()["port"], 8080);
        assert_eq!(m.get("probe_port").unwrap()["probe_type"], "tcp");
        assert_eq!(m.get("ports").unwrap()[1]["service_port"], 9000);
        let annotation = &m.get("service_annotations").unwrap()[TCP_PORTS_ANNOTATION];
        assert_eq!(crate::interpolation::as_raw(annotation), Some(r#"{"9000":"raw"}"#));
    }
}
