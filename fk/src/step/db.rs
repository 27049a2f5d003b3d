//! Database query step executor (SQLite)
//!
//! Runs a query against a SQLite database file and captures the rows as a
//! JSON array in the response, so post-processors can assert over them.
//! The blocking driver runs under `spawn_blocking`.

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::StepError;
use super::traits::{StepExecutor, StepResult};
use crate::context::{ExecutionContext, ResponseData};
use crate::domain::Step;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DbConfig {
    path: String,
    query: String,
    #[serde(default)]
    params: Vec<Value>,
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).to_string()),
    }
}

fn run_query(path: &str, query: &str, params: &[Value]) -> Result<Vec<Value>, rusqlite::Error> {
    let conn = Connection::open(path)?;
    let mut stmt = conn.prepare(query)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let sql_params: Vec<SqlValue> = params.iter().map(to_sql).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(sql_params))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::new();
        for (i, name) in columns.iter().enumerate() {
            object.insert(name.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(Value::Object(object));
    }
    Ok(out)
}

/// Executor for `db_query` steps
pub struct DbQueryExecutor;

#[async_trait]
impl StepExecutor for DbQueryExecutor {
    fn type_name(&self) -> &'static str {
        "db_query"
    }

    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let config: DbConfig = serde_json::from_value(step.config.clone())
            .map_err(|e| StepError::invalid_config(e.to_string()))?;

        let path = ctx.interpolate(&config.path);
        let query = ctx.interpolate(&config.query);
        let params: Vec<Value> = config.params.iter().map(|p| ctx.interpolate_value(p)).collect();

        debug!(step_id = %step.id, %path, "running db_query step");
        let start = std::time::Instant::now();
        let handle = tokio::task::spawn_blocking(move || run_query(&path, &query, &params));

        let rows = tokio::select! {
            joined = handle => match joined {
                Ok(result) => result?,
                Err(e) => return Err(StepError::invalid_config(format!("query task failed: {e}"))),
            },
            () = cancel.cancelled() => return Err(StepError::Cancelled),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let body = Value::Array(rows);
        ctx.set_response(ResponseData {
            status: 200,
            headers: Default::default(),
            body: body.to_string(),
            json: Some(body.clone()),
            duration_ms,
            request: None,
        });

        Ok(StepResult::success(serde_json::json!({
            "rows": body.as_array().map(Vec::len).unwrap_or(0),
            "duration-ms": duration_ms,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn step(config: serde_json::Value) -> Step {
        Step {
            id: "s1".to_string(),
            name: None,
            step_type: "db_query".to_string(),
            config,
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
            timeout_ms: None,
            on_failure: Default::default(),
        }
    }

    fn seed_db(path: &std::path::Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER, name TEXT);
             INSERT INTO users VALUES (1, 'ada'), (2, 'grace');",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_db_query_rows() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        seed_db(&db);

        let exec = DbQueryExecutor;
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let result = exec
            .execute(
                &step(json!({
                    "path": db.to_str().unwrap(),
                    "query": "SELECT id, name FROM users ORDER BY id",
                })),
                &ctx,
                &cancel,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output["rows"], json!(2));
        // rows land in the response for post-processors
        assert_eq!(ctx.resolve_path("response.body.0.name"), Some(json!("ada")));
        assert_eq!(ctx.resolve_path("response.body.1.id"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_db_query_with_params() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        seed_db(&db);

        let exec = DbQueryExecutor;
        let ctx = ExecutionContext::new();
        ctx.set("uid", json!(2));
        let cancel = CancellationToken::new();
        let result = exec
            .execute(
                &step(json!({
                    "path": db.to_str().unwrap(),
                    "query": "SELECT name FROM users WHERE id = ?",
                    "params": ["${uid}"],
                })),
                &ctx,
                &cancel,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(ctx.resolve_path("response.body.0.name"), Some(json!("grace")));
    }

    #[tokio::test]
    async fn test_db_query_bad_sql_is_error() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        seed_db(&db);

        let exec = DbQueryExecutor;
        let ctx = ExecutionContext::new();
        let cancel = CancellationToken::new();
        let err = exec
            .execute(
                &step(json!({"path": db.to_str().unwrap(), "query": "SELEC nope"})),
                &ctx,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Db(_)));
    }
}
