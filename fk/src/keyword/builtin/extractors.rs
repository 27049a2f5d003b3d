//! Extractor keywords: pull data out of the latest response into variables

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::keyword::{Category, Keyword, KeywordError, KeywordResult, Params};

/// `json_extract(var, path, from?)` — dotted-path extraction
///
/// `from` defaults to `response.body`; `path` descends further. An empty
/// path stores the source value itself.
pub struct JsonExtract;

#[async_trait]
impl Keyword for JsonExtract {
    fn name(&self) -> &'static str {
        "json_extract"
    }
    fn category(&self) -> Category {
        Category::Extractor
    }
    fn description(&self) -> &'static str {
        "Extract a JSON value by dotted path into a variable"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["var", "path", "from"])?;
        params.string("var")?;
        params.opt_string("path")?;
        params.opt_string("from")?;
        Ok(())
    }
    async fn execute(&self, ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let var = match params.string("var") {
            Ok(v) => v.to_string(),
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        let from = params.opt_string("from").ok().flatten().unwrap_or("response.body");
        let path = params.opt_string("path").ok().flatten().unwrap_or("");
        let full = if path.is_empty() {
            from.to_string()
        } else {
            format!("{from}.{path}")
        };
        match ctx.resolve_path(&full) {
            Some(value) => {
                ctx.set(var.clone(), value.clone());
                KeywordResult::pass_with(format!("{var} <- {full}"), value)
            }
            None => KeywordResult::fail(format!("path not found: {full}")),
        }
    }
}

/// `regex_extract(var, pattern, source?)` — first capture group, or the
/// whole match when the pattern has no groups
pub struct RegexExtract;

#[async_trait]
impl Keyword for RegexExtract {
    fn name(&self) -> &'static str {
        "regex_extract"
    }
    fn category(&self) -> Category {
        Category::Extractor
    }
    fn description(&self) -> &'static str {
        "Extract a regex capture into a variable"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["var", "pattern", "source"])?;
        params.string("var")?;
        let pattern = params.string("pattern")?;
        Regex::new(pattern).map_err(|e| KeywordError::invalid("pattern", e.to_string()))?;
        params.opt_string("source")?;
        Ok(())
    }
    async fn execute(&self, ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let var = match params.string("var") {
            Ok(v) => v.to_string(),
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        let pattern = match params.string("pattern") {
            Ok(p) => p,
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        let source = match params.opt_string("source").ok().flatten() {
            Some(s) => s.to_string(),
            None => match ctx.response() {
                Some(resp) => resp.body,
                None => return KeywordResult::fail("no source given and no response in context"),
            },
        };
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => return KeywordResult::fail(format!("invalid pattern: {e}")),
        };
        match re.captures(&source) {
            Some(caps) => {
                let captured = caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str().to_string());
                match captured {
                    Some(text) => {
                        ctx.set(var.clone(), serde_json::Value::String(text.clone()));
                        KeywordResult::pass_with(format!("{var} <- /{pattern}/"), serde_json::Value::String(text))
                    }
                    None => KeywordResult::fail(format!("empty capture for /{pattern}/")),
                }
            }
            None => KeywordResult::fail(format!("no match for /{pattern}/")),
        }
    }
}

/// `header_extract(var, header)` — case-insensitive response header lookup
pub struct HeaderExtract;

#[async_trait]
impl Keyword for HeaderExtract {
    fn name(&self) -> &'static str {
        "header_extract"
    }
    fn category(&self) -> Category {
        Category::Extractor
    }
    fn description(&self) -> &'static str {
        "Extract a response header into a variable"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["var", "header"])?;
        params.string("var")?;
        params.string("header")?;
        Ok(())
    }
    async fn execute(&self, ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let (var, header) = match (params.string("var"), params.string("header")) {
            (Ok(v), Ok(h)) => (v.to_string(), h.to_string()),
            (Err(e), _) | (_, Err(e)) => return KeywordResult::fail(e.to_string()),
        };
        let Some(resp) = ctx.response() else {
            return KeywordResult::fail("no response in context");
        };
        let value = resp
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&header))
            .map(|(_, v)| v.clone());
        match value {
            Some(v) => {
                ctx.set(var.clone(), serde_json::Value::String(v.clone()));
                KeywordResult::pass_with(format!("{var} <- header {header}"), serde_json::Value::String(v))
            }
            None => KeywordResult::fail(format!("header not present: {header}")),
        }
    }
}
