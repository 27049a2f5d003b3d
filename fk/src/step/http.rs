//! HTTP step executor
//!
//! Interpolates `${...}` placeholders into URL, headers, and body, applies
//! the configured redirect policy by hand (so the final URL is observable),
//! captures the request actually sent, and parses JSON bodies. A non-2xx
//! response is not an executor error; assertions inspect
//! `${response.status}`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::StepError;
use super::traits::{StepExecutor, StepResult};
use crate::context::{ExecutionContext, RequestRecord, ResponseData};
use crate::domain::Step;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct HttpConfig {
    url: String,
    method: String,
    headers: HashMap<String, String>,
    body: Option<Value>,
    timeout_ms: Option<u64>,
    follow_redirects: bool,
    max_redirects: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout_ms: None,
            follow_redirects: true,
            max_redirects: 5,
        }
    }
}

/// Executor for `http` steps
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        // redirects are followed manually so the final URL is captured
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<&str>,
        timeout_ms: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, StepError> {
        let mut builder = self.client.request(method.clone(), url).headers(headers.clone());
        if let Some(body) = body {
            builder = builder.body(body.to_string());
        }
        if let Some(ms) = timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        tokio::select! {
            result = builder.send() => result.map_err(StepError::from),
            () = cancel.cancelled() => Err(StepError::Cancelled),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn build_headers(config: &HashMap<String, String>, ctx: &ExecutionContext) -> Result<HeaderMap, StepError> {
    let mut headers = HeaderMap::new();
    for (name, value) in config {
        let value = ctx.interpolate(value);
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StepError::invalid_config(format!("header name {name}: {e}")))?;
        let value =
            HeaderValue::from_str(&value).map_err(|e| StepError::invalid_config(format!("header value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl StepExecutor for HttpExecutor {
    fn type_name(&self) -> &'static str {
        "http"
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let config: HttpConfig = serde_json::from_value(step.config.clone())
            .map_err(|e| StepError::invalid_config(e.to_string()))?;
        if config.url.is_empty() {
            return Err(StepError::invalid_config("url is required"));
        }

        let mut url = ctx.interpolate(&config.url);
        let mut method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| StepError::invalid_config(format!("bad method {}", config.method)))?;
        let headers = build_headers(&config.headers, ctx)?;
        let mut body = match &config.body {
            Some(Value::String(s)) => Some(ctx.interpolate(s)),
            Some(other) => Some(ctx.interpolate_value(other).to_string()),
            None => None,
        };

        let start = Instant::now();
        let mut redirects = 0u32;
        let response = loop {
            let response = self
                .send_once(&method, &url, &headers, body.as_deref(), config.timeout_ms, cancel)
                .await?;

            if !config.follow_redirects || !is_redirect(response.status()) {
                break response;
            }
            if redirects >= config.max_redirects {
                break response;
            }
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                break response;
            };

            url = match response.url().join(location) {
                Ok(joined) => joined.to_string(),
                Err(_) => location.to_string(),
            };
            // 303 (and historical 301/302) demote to GET; 307/308 keep the method
            if matches!(response.status().as_u16(), 301 | 302 | 303) {
                method = Method::GET;
                body = None;
            }
            redirects += 1;
            debug!(step_id = %step.id, %url, redirects, "following redirect");
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let content_type = response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        let text = tokio::select! {
            result = response.text() => result.map_err(StepError::from)?,
            () = cancel.cancelled() => return Err(StepError::Cancelled),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let json = if content_type.contains("json") {
            serde_json::from_str(&text).ok()
        } else {
            None
        };

        let request = RequestRecord {
            url: final_url,
            method: method.to_string(),
            headers: headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect(),
            body,
        };

        ctx.set_response(ResponseData {
            status,
            headers: response_headers,
            body: text,
            json,
            duration_ms,
            request: Some(request),
        });

        Ok(StepResult::success(serde_json::json!({
            "status": status,
            "duration-ms": duration_ms,
            "redirects": redirects,
        })))
    }
}
