//! `${{ ... }}` interpolation.
//!
//! Layer files and catalog templates refer to layer facts and to other
//! modules with `${{ expr }}`. Hydration rewrites those against a [`Scope`]:
//!
//! - `module.x.y`, `data.*`, `var.*` and `local.*` become plain Terraform
//!   references (`${module.x.y}`)
//! - `parent.y` becomes a read from the parent layer's remote state
//! - anything else is looked up in the scope (`env`, `layer_name`,
//!   `aws.region`, `vars.image_tag`, ...)
//!
//! Values wrapped with [`raw_string`] are emitted verbatim and never hydrated,
//! which keeps embedded JSON blobs intact.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{OptaError, OptaResult};

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Key of the single-entry object that marks a raw string.
pub const RAW_TAG: &str = "$raw";

/// Terraform reference heads passed through untouched.
const TERRAFORM_HEADS: [&str; 4] = ["module", "data", "var", "local"];

/// Wrap a string so hydration leaves it alone.
pub fn raw_string(content: impl Into<String>) -> Value {
    let mut map = Map::new();
    map.insert(RAW_TAG.to_string(), Value::String(content.into()));
    Value::Object(map)
}

pub fn as_raw(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(RAW_TAG).and_then(Value::as_str),
        _ => None,
    }
}

/// A value reachable from an interpolation expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeValue {
    Text(String),
    /// A boolean or number; it keeps its JSON type when it is the whole value.
    Scalar(Value),
    List(Vec<ScopeValue>),
    Namespace(BTreeMap<String, ScopeValue>),
}

impl ScopeValue {
    pub fn to_value(&self) -> Value {
        match self {
            ScopeValue::Text(text) => Value::String(text.clone()),
            ScopeValue::Scalar(value) => value.clone(),
            ScopeValue::List(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            ScopeValue::Namespace(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }

    /// How the value reads when spliced into a longer string.
    fn render(&self) -> String {
        match self {
            ScopeValue::Text(text) => text.clone(),
            other => other.to_value().to_string(),
        }
    }
}

impl From<&Value> for ScopeValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ScopeValue::Text(String::new()),
            Value::String(s) => ScopeValue::Text(s.clone()),
            Value::Bool(_) | Value::Number(_) => ScopeValue::Scalar(value.clone()),
            Value::Array(items) => ScopeValue::List(items.iter().map(ScopeValue::from).collect()),
            Value::Object(map) => match as_raw(value) {
                Some(raw) => ScopeValue::Text(raw.to_string()),
                None => ScopeValue::Namespace(
                    map.iter()
                        .map(|(k, v)| (k.clone(), ScopeValue::from(v)))
                        .collect(),
                ),
            },
        }
    }
}

impl From<&str> for ScopeValue {
    fn from(text: &str) -> Self {
        ScopeValue::Text(text.to_string())
    }
}

impl From<String> for ScopeValue {
    fn from(text: String) -> Self {
        ScopeValue::Text(text)
    }
}

/// The names an expression can resolve against.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    entries: BTreeMap<String, ScopeValue>,
    has_parent: bool,
}

enum Resolved {
    Reference(String),
    Value(ScopeValue),
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ScopeValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with_json(self, key: impl Into<String>, value: &Value) -> Self {
        self.with(key, ScopeValue::from(value))
    }

    /// Allow `parent.*` references.
    pub fn with_parent(mut self, has_parent: bool) -> Self {
        self.has_parent = has_parent;
        self
    }

    pub fn has_parent(&self) -> bool {
        self.has_parent
    }

    pub fn lookup(&self, path: &str) -> Option<&ScopeValue> {
        let mut parts = path.split('.');
        let mut current = self.entries.get(parts.next()?)?;
        for part in parts {
            current = match current {
                ScopeValue::Namespace(entries) => entries.get(part)?,
                ScopeValue::List(items) => items.get(part.parse::<usize>().ok()?)?,
                ScopeValue::Text(_) | ScopeValue::Scalar(_) => return None,
            };
        }
        Some(current)
    }

    fn resolve(&self, expr: &str) -> OptaResult<Resolved> {
        let head = expr.split('.').next().unwrap_or_default();
        if TERRAFORM_HEADS.contains(&head) && expr.contains('.') {
            return Ok(Resolved::Reference(format!("${{{}}}", expr)));
        }
        if let Some(output) = expr.strip_prefix("parent.") {
            if !self.has_parent {
                return Err(OptaError::user(format!(
                    "`${{{{{}}}}}` refers to a parent layer, but this layer has none",
                    expr
                )));
            }
            return Ok(Resolved::Reference(format!(
                "${{data.terraform_remote_state.parent.outputs.{}}}",
                output
            )));
        }
        self.lookup(expr)
            .cloned()
            .map(Resolved::Value)
            .ok_or_else(|| OptaError::user(format!("Could not find a value for `${{{{{}}}}}`", expr)))
    }

    /// Hydrate one string. A string made of a single expression keeps the
    /// type of what it resolves to.
    pub fn hydrate_str(&self, input: &str) -> OptaResult<Value> {
        let trimmed = input.trim();
        if let Some(expr) = single_expression(trimmed) {
            return Ok(match self.resolve(expr)? {
                Resolved::Reference(reference) => Value::String(reference),
                Resolved::Value(value) => value.to_value(),
            });
        }

        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find(OPEN) {
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                break;
            };
            output.push_str(&rest[..start]);
            match self.resolve(after_open[..end].trim())? {
                Resolved::Reference(reference) => output.push_str(&reference),
                Resolved::Value(value) => output.push_str(&value.render()),
            }
            rest = &after_open[end + CLOSE.len()..];
        }
        output.push_str(rest);
        Ok(Value::String(output))
    }

    /// Hydrate a value recursively. Object keys are left alone.
    pub fn hydrate(&self, value: &Value) -> OptaResult<Value> {
        match value {
            Value::String(s) if s.contains(OPEN) => self.hydrate_str(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.hydrate(item))
                .collect::<OptaResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                if let Some(raw) = as_raw(value) {
                    return Ok(Value::String(raw.to_string()));
                }
                let mut hydrated = Map::with_capacity(map.len());
                for (key, item) in map {
                    hydrated.insert(key.clone(), self.hydrate(item)?);
                }
                Ok(Value::Object(hydrated))
            }
            other => Ok(other.clone()),
        }
    }
}

/// `Some(expr)` when the whole string is exactly `${{ expr }}`.
fn single_expression(input: &str) -> Option<&str> {
    let inner = input.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    (!inner.contains(OPEN) && !inner.contains(CLOSE)).then(|| inner.trim())
}

/// Shorthand for the `${{module.<name>.<output>}}` reference processors inject.
pub fn module_ref(module_name: &str, output: &str) -> Value {
    Value::String(format!("${{{{module.{}.{}}}}}", module_name, output))
}

pub fn parent_ref(output: &str) -> Value {
    Value::String(format!("${{{{parent.{}}}}}", output))
}
