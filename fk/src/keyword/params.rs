//! Structured keyword parameters
//!
//! Parameters are a string-keyed mapping of JSON values. Each keyword
//! declares the keys it expects and validates at entry; typed accessors
//! fail with `InvalidParams` naming the offending key.

use serde_json::{Map, Value};

use super::error::KeywordError;

/// Parameter bag passed to a keyword
#[derive(Debug, Clone, Default)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; must be an object or null
    pub fn from_value(value: &Value) -> Result<Self, KeywordError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map.clone())),
            other => Err(KeywordError::invalid(
                "params",
                format!("expected an object, got {other}"),
            )),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Any value, required
    pub fn require(&self, key: &str) -> Result<&Value, KeywordError> {
        self.get(key).ok_or_else(|| KeywordError::invalid(key, "required"))
    }

    /// Required string
    pub fn string(&self, key: &str) -> Result<&str, KeywordError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| KeywordError::invalid(key, "expected a string"))
    }

    /// Optional string
    pub fn opt_string(&self, key: &str) -> Result<Option<&str>, KeywordError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| KeywordError::invalid(key, "expected a string")),
        }
    }

    /// Required number; numeric strings coerce
    pub fn number(&self, key: &str) -> Result<f64, KeywordError> {
        let value = self.require(key)?;
        as_f64(value).ok_or_else(|| KeywordError::invalid(key, "expected a number"))
    }

    /// Required non-negative integer
    pub fn integer(&self, key: &str) -> Result<u64, KeywordError> {
        let value = self.require(key)?;
        match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| KeywordError::invalid(key, "expected a non-negative integer"))
    }

    /// Optional boolean, defaulting
    pub fn boolean_or(&self, key: &str, default: bool) -> Result<bool, KeywordError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(KeywordError::invalid(key, "expected a boolean")),
        }
    }

    /// Reject keys outside the allowed set
    pub fn allow_only(&self, allowed: &[&str]) -> Result<(), KeywordError> {
        for key in self.keys() {
            if !allowed.contains(&key) {
                return Err(KeywordError::invalid(key, "unknown parameter"));
            }
        }
        Ok(())
    }
}

/// Numeric coercion shared by comparison keywords
pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
