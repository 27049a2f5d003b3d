//! Control keywords: pacing and deliberate failure

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::keyword::{Category, Keyword, KeywordError, KeywordResult, Params};

/// `wait(duration_ms)` — blocks until the duration elapses or cancellation fires
pub struct Wait;

#[async_trait]
impl Keyword for Wait {
    fn name(&self) -> &'static str {
        "wait"
    }
    fn category(&self) -> Category {
        Category::Control
    }
    fn description(&self) -> &'static str {
        "Pause the pipeline for a duration"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["duration_ms"])?;
        params.integer("duration_ms")?;
        Ok(())
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, cancel: &CancellationToken) -> KeywordResult {
        let ms = match params.integer("duration_ms") {
            Ok(ms) => ms,
            Err(e) => return KeywordResult::fail(e.to_string()),
        };
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => KeywordResult::pass(format!("waited {ms}ms")),
            () = cancel.cancelled() => KeywordResult::fail("cancelled"),
        }
    }
}

/// `fail(message?)` — unconditional failure, useful for exercising pipelines
pub struct Fail;

#[async_trait]
impl Keyword for Fail {
    fn name(&self) -> &'static str {
        "fail"
    }
    fn category(&self) -> Category {
        Category::Control
    }
    fn description(&self) -> &'static str {
        "Fail the step unconditionally"
    }
    fn validate(&self, params: &Params) -> Result<(), KeywordError> {
        params.allow_only(&["message"])?;
        params.opt_string("message")?;
        Ok(())
    }
    async fn execute(&self, _ctx: &ExecutionContext, params: &Params, _cancel: &CancellationToken) -> KeywordResult {
        let message = params
            .opt_string("message")
            .ok()
            .flatten()
            .unwrap_or("failed by keyword");
        KeywordResult::fail(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn params(v: serde_json::Value) -> Params {
        Params::from_value(&v).unwrap()
    }

    #[tokio::test]
    async fn test_wait_elapses() {
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let res = Wait
            .execute(&ctx, &params(json!({"duration_ms": 20})), &cancel)
            .await;
        assert!(res.success);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_cancelled_early() {
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let start = Instant::now();
        let res = Wait
            .execute(&ctx, &params(json!({"duration_ms": 10_000})), &child)
            .await;
        assert!(!res.success);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_fail_keyword() {
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let res = Fail
            .execute(&ctx, &params(json!({"message": "boom"})), &cancel)
            .await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("boom"));
    }
}
