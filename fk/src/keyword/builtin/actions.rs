//! Action keywords: mutate the execution context

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::keyword::{Category, Keyword, KeywordError, KeywordResult, Params};

/// `set_variable(name, value)`
pub struct SetVariable;

#[async_trait]
impl Keyword for SetVariable {
    fn name(&self) -> &'static str {
        "set_variable"
    }
    fn category(&self) -> Category {
        Category::Action
    }
    fn description(&self) -> &'static str {
        "Set a context variable"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["name", "value"])?;
        params.string("name")?;
        params.require("value")?;
        Ok(())
    }
    async fn execute(&self, ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let (name, value) = match (params.string("name"), params.require("value")) {
            (Ok(n), Ok(v)) => (n.to_string(), v.clone()),
            (Err(e), _) | (_, Err(e)) => return KeywordResult::fail(e.to_string()),
        };
        ctx.set(name.clone(), value);
        KeywordResult::pass(format!("set {name}"))
    }
}

/// `delete_variable(name)`
pub struct DeleteVariable;

#[async_trait]
impl Keyword for DeleteVariable {
    fn name(&self) -> &'static str {
        "delete_variable"
    }
    fn category(&self) -> Category {
        Category::Action
    }
    fn description(&self) -> &'static str {
        "Remove a context variable"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["name"])?;
        params.string("name")?;
        Ok(())
    }
    async fn execute(&self, ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let name = match params.string("name") {
            Ok(n) => n.to_string(),
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        if ctx.delete(&name) {
            KeywordResult::pass(format!("deleted {name}"))
        } else {
            // deleting a missing variable is not a failure
            KeywordResult::pass(format!("{name} was not set"))
        }
    }
}

/// `log(message, level?)`
pub struct Log;

#[async_trait]
impl Keyword for Log {
    fn name(&self) -> &'static str {
        "log"
    }
    fn category(&self) -> Category {
        Category::Action
    }
    fn description(&self) -> &'static str {
        "Emit a log line from the workflow"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["message", "level"])?;
        params.string("message")?;
        if let Some(level) = params.opt_string("level")?
            && !["debug", "info", "warn"].contains(&level)
        {
            return Err(KeywordError::invalid("level", "expected debug, info, or warn"));
        }
        Ok(())
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let message = match params.string("message") {
            Ok(m) => m,
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        match params.opt_string("level").ok().flatten().unwrap_or("info") {
            "debug" => debug!(target: "workflow", "{message}"),
            "warn" => warn!(target: "workflow", "{message}"),
            _ => info!(target: "workflow", "{message}"),
        }
        KeywordResult::pass("logged")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: serde_json::Value) -> Params {
        Params::from_value(&v).unwrap()
    }

    #[tokio::test]
    async fn test_set_variable() {
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let res = SetVariable
            .execute(&ctx, &params(json!({"name": "x", "value": "1"})), &cancel)
            .await;
        assert!(res.success);
        assert_eq!(ctx.get("x"), Some(json!("1")));
    }

    #[tokio::test]
    async fn test_delete_variable_idempotent() {
        let ctx = ExecutionContext::new();
        ctx.set("x", json!(1));
        let cancel = CancellationToken::new();
        let res = DeleteVariable
            .execute(&ctx, &params(json!({"name": "x"})), &cancel)
            .await;
        assert!(res.success);
        // second delete still succeeds
        let res = DeleteVariable
            .execute(&ctx, &params(json!({"name": "x"})), &cancel)
            .await;
        assert!(res.success);
    }

    #[test]
    fn test_log_validates_level() {
        assert!(Log.validate(&params(json!({"message": "hi"}))).is_ok());
        assert!(Log.validate(&params(json!({"message": "hi", "level": "warn"}))).is_ok());
        assert!(Log.validate(&params(json!({"message": "hi", "level": "fatal"}))).is_err());
    }
}
