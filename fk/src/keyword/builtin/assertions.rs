//! Assertion keywords
//!
//! An assertion succeeds iff its predicate holds on the given values.
//! Comparisons coerce numeric strings; `equals` falls back to canonical
//! text when the sides are of mixed types.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::keyword::params::as_f64;
use crate::keyword::{Category, Keyword, KeywordError, KeywordResult, Params};

fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose equality: numeric when both sides are numeric, canonical text otherwise
fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x == y;
    }
    if a == b {
        return true;
    }
    canonical(a) == canonical(b)
}

fn validate_actual_expected(params: &Params) -> Result<(), KeywordError> {
    params.allow_only(&["actual", "expected"])?;
    params.require("actual")?;
    params.require("expected")?;
    Ok(())
}

/// `equals(actual, expected)`
pub struct Equals;

#[async_trait]
impl Keyword for Equals {
    fn name(&self) -> &'static str {
        "equals"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual equals expected"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        validate_actual_expected(params)
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let (actual, expected) = match (params.require("actual"), params.require("expected")) {
            (Ok(a), Ok(e)) => (a, e),
            (Err(e), _) | (_, Err(e)) => return KeywordResult::fail(e.to_string()),
        };
        if loose_eq(actual, expected) {
            KeywordResult::pass(format!("{} == {}", canonical(actual), canonical(expected)))
        } else {
            KeywordResult::fail(format!(
                "expected {} but got {}",
                canonical(expected),
                canonical(actual)
            ))
        }
    }
}

/// `not_equals(actual, expected)`
pub struct NotEquals;

#[async_trait]
impl Keyword for NotEquals {
    fn name(&self) -> &'static str {
        "not_equals"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual differs from expected"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        validate_actual_expected(params)
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let (actual, expected) = match (params.require("actual"), params.require("expected")) {
            (Ok(a), Ok(e)) => (a, e),
            (Err(e), _) | (_, Err(e)) => return KeywordResult::fail(e.to_string()),
        };
        if !loose_eq(actual, expected) {
            KeywordResult::pass(format!("{} != {}", canonical(actual), canonical(expected)))
        } else {
            KeywordResult::fail(format!("both sides are {}", canonical(actual)))
        }
    }
}

fn contains_impl(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(&canonical(needle)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}

/// `contains(actual, expected)` over strings, arrays, and object keys
pub struct Contains;

#[async_trait]
impl Keyword for Contains {
    fn name(&self) -> &'static str {
        "contains"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual contains expected"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        validate_actual_expected(params)
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let (actual, expected) = match (params.require("actual"), params.require("expected")) {
            (Ok(a), Ok(e)) => (a, e),
            (Err(e), _) | (_, Err(e)) => return KeywordResult::fail(e.to_string()),
        };
        if contains_impl(actual, expected) {
            KeywordResult::pass(format!("contains {}", canonical(expected)))
        } else {
            KeywordResult::fail(format!("{} does not contain {}", canonical(actual), canonical(expected)))
        }
    }
}

/// `not_contains(actual, expected)`
pub struct NotContains;

#[async_trait]
impl Keyword for NotContains {
    fn name(&self) -> &'static str {
        "not_contains"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual does not contain expected"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        validate_actual_expected(params)
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let (actual, expected) = match (params.require("actual"), params.require("expected")) {
            (Ok(a), Ok(e)) => (a, e),
            (Err(e), _) | (_, Err(e)) => return KeywordResult::fail(e.to_string()),
        };
        if !contains_impl(actual, expected) {
            KeywordResult::pass(format!("does not contain {}", canonical(expected)))
        } else {
            KeywordResult::fail(format!("{} contains {}", canonical(actual), canonical(expected)))
        }
    }
}

fn numeric_pair(params: &Params) -> Result<(f64, f64), KeywordError> {
    let actual = params.number("actual")?;
    let expected = params.number("expected")?;
    Ok((actual, expected))
}

/// `greater_than(actual, expected)`
pub struct GreaterThan;

#[async_trait]
impl Keyword for GreaterThan {
    fn name(&self) -> &'static str {
        "greater_than"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual > expected numerically"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        validate_actual_expected(params)
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        match numeric_pair(params) {
            Ok((a, e)) if a > e => KeywordResult::pass(format!("{a} > {e}")),
            Ok((a, e)) => KeywordResult::fail(format!("{a} is not greater than {e}")),
            Err(err) => KeywordResult::fail(err.to_string()),
        }
    }
}

/// `less_than(actual, expected)`
pub struct LessThan;

#[async_trait]
impl Keyword for LessThan {
    fn name(&self) -> &'static str {
        "less_than"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual < expected numerically"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        validate_actual_expected(params)
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        match numeric_pair(params) {
            Ok((a, e)) if a < e => KeywordResult::pass(format!("{a} < {e}")),
            Ok((a, e)) => KeywordResult::fail(format!("{a} is not less than {e}")),
            Err(err) => KeywordResult::fail(err.to_string()),
        }
    }
}

/// `matches(actual, pattern)` regex match over the canonical text
pub struct Matches;

#[async_trait]
impl Keyword for Matches {
    fn name(&self) -> &'static str {
        "matches"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert that actual matches a regex pattern"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["actual", "pattern"])?;
        params.require("actual")?;
        let pattern = params.string("pattern")?;
        Regex::new(pattern).map_err(|e| KeywordError::invalid("pattern", e.to_string()))?;
        Ok(())
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let actual = match params.require("actual") {
            Ok(v) => canonical(v),
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        let pattern = match params.string("pattern") {
            Ok(p) => p,
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        match Regex::new(pattern) {
            Ok(re) if re.is_match(&actual) => KeywordResult::pass(format!("matches /{pattern}/")),
            Ok(_) => KeywordResult::fail(format!("'{actual}' does not match /{pattern}/")),
            Err(e) => KeywordResult::fail(format!("invalid pattern: {e}")),
        }
    }
}

/// `status_code(expected)` against the latest response
pub struct StatusCode;

#[async_trait]
impl Keyword for StatusCode {
    fn name(&self) -> &'static str {
        "status_code"
    }
    fn category(&self) -> Category {
        Category::Assertion
    }
    fn description(&self) -> &'static str {
        "Assert the status of the latest response"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["expected"])?;
        params.integer("expected")?;
        Ok(())
    }
    async fn execute(&self, ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let expected = match params.integer("expected") {
            Ok(v) => v,
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        match ctx.response() {
            Some(resp) if u64::from(resp.status) == expected => KeywordResult::pass(format!("status {expected}")),
            Some(resp) => KeywordResult::fail(format!("expected status {expected} but got {}", resp.status)),
            None => KeywordResult::fail("no response in context"),
        }
    }
}
