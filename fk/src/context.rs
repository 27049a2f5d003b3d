//! Per-step execution context
//!
//! A context carries variables, the latest response, and metadata across
//! the pre/main/post phases of a step and across the steps of one
//! iteration. Writers are single-threaded per step, but the command plane
//! may read concurrently, so all access goes through a lock.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex"));

/// The request actually sent by a request-shaped step, for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// The latest response captured by a request-shaped step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponseData {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Raw response body
    pub body: String,
    /// Body parsed as JSON when the content type admits it
    #[serde(default)]
    pub json: Option<Value>,
    pub duration_ms: u64,
    #[serde(default)]
    pub request: Option<RequestRecord>,
}

impl ResponseData {
    /// The JSON shape exposed under the `response` variable
    ///
    /// `code` aliases `status`, and `body` is the parsed form when the
    /// body was JSON (the raw text stays reachable as `text`).
    pub fn to_value(&self) -> Value {
        let body = self
            .json
            .clone()
            .unwrap_or_else(|| Value::String(self.body.clone()));
        serde_json::json!({
            "status": self.status,
            "code": self.status,
            "headers": self.headers,
            "body": body,
            "text": self.body,
            "duration-ms": self.duration_ms,
            "request": self.request,
        })
    }
}

#[derive(Debug, Default)]
struct CtxInner {
    variables: HashMap<String, Value>,
    metadata: HashMap<String, String>,
    response: Option<ResponseData>,
}

/// Shared, thread-safe variable/response/metadata bag
///
/// Cloning an `ExecutionContext` clones the handle (both point at the
/// same data); [`ExecutionContext::fork`] makes an independent copy.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    inner: Arc<RwLock<CtxInner>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context pre-seeded with initial variables
    pub fn seeded(variables: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CtxInner {
                variables,
                ..Default::default()
            })),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CtxInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CtxInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.write().variables.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().variables.get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.write().variables.remove(name).is_some()
    }

    /// Snapshot of all variables
    pub fn variables(&self) -> HashMap<String, Value> {
        self.read().variables.clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.write().metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.read().metadata.get(key).cloned()
    }

    /// Store the latest response; also binds the `response` variable
    pub fn set_response(&self, response: ResponseData) {
        let mut inner = self.write();
        inner.variables.insert("response".to_string(), response.to_value());
        inner.response = Some(response);
    }

    pub fn response(&self) -> Option<ResponseData> {
        self.read().response.clone()
    }

    /// Independent shallow copy; later writes are not shared
    pub fn fork(&self) -> ExecutionContext {
        let inner = self.read();
        ExecutionContext {
            inner: Arc::new(RwLock::new(CtxInner {
                variables: inner.variables.clone(),
                metadata: inner.metadata.clone(),
                response: inner.response.clone(),
            })),
        }
    }

    /// Overwrite this context with the other's entries, key by key
    pub fn merge(&self, other: &ExecutionContext) {
        let theirs = other.read();
        let mut inner = self.write();
        for (k, v) in &theirs.variables {
            inner.variables.insert(k.clone(), v.clone());
        }
        for (k, v) in &theirs.metadata {
            inner.metadata.insert(k.clone(), v.clone());
        }
        if let Some(resp) = &theirs.response {
            inner.response = Some(resp.clone());
        }
    }

    /// Resolve a dotted path: the first segment names a variable, the
    /// rest descend into its JSON value (object keys or array indices).
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;
        let inner = self.read();
        let mut current = inner.variables.get(root)?.clone();
        for seg in segments {
            current = match &current {
                Value::Object(map) => map.get(seg)?.clone(),
                Value::Array(items) => {
                    let idx: usize = seg.parse().ok()?;
                    items.get(idx)?.clone()
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Replace `${path}` placeholders in a string
    ///
    /// Unresolvable placeholders are left verbatim.
    pub fn interpolate(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &regex::Captures<'_>| {
                match self.resolve_path(&caps[1]) {
                    Some(Value::String(s)) => s,
                    Some(v) => v.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Interpolate string leaves of a JSON value
    ///
    /// A string that is exactly one placeholder resolves to the referenced
    /// value itself (keeping numbers numbers); mixed strings interpolate
    /// textually. Objects and arrays are walked recursively.
    pub fn interpolate_value(&self, input: &Value) -> Value {
        match input {
            Value::String(s) => {
                if let Some(caps) = PLACEHOLDER.captures(s)
                    && caps.get(0).map(|m| m.len()) == Some(s.len())
                    && let Some(resolved) = self.resolve_path(&caps[1])
                {
                    return resolved;
                }
                Value::String(self.interpolate(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.interpolate_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.interpolate_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
