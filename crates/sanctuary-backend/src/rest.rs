//! PostgREST client for the hosted backend (`{url}/rest/v1/{table}`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::{debug, warn};

use sanctuary_shared::constants::COLUMN_ID;

use crate::backend::Backend;
use crate::error::{BackendError, Result};
use crate::query::Query;

const REQUEST_TIMEOUT_SECS: u64 = 15;

pub struct RestBackend {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::transport(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token: None,
        })
    }

    /// Act as the signed-in user instead of the anonymous role.
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token;
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.http
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Value> {
        let resp = request
            .send()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;

        if !status.is_success() {
            let err = BackendError::from_response(status.as_u16(), &body);
            warn!(status = status.as_u16(), code = ?err.code, "Backend request failed");
            return Err(err);
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| {
            BackendError::new(Some(status.as_u16()), None, format!("Invalid JSON response: {e}"))
        })
    }
}

/// Writes with `return=representation` answer with a one-element array.
fn single_row(value: Value, table: &str) -> Result<Value> {
    match value {
        Value::Array(mut rows) if !rows.is_empty() => Ok(rows.swap_remove(0)),
        Value::Object(_) => Ok(value),
        _ => Err(BackendError::new(
            Some(404),
            None,
            format!("No row returned from {table}"),
        )),
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let params = query.to_params();
        debug!(table, params = ?params, "Select");

        match self.execute(self.request(Method::GET, table).query(&params)).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(BackendError::new(
                None,
                None,
                format!("Expected an array of rows, got {other}"),
            )),
        }
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        debug!(table, "Insert");
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row);
        single_row(self.execute(request).await?, table)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        debug!(table, id, "Update");
        let request = self
            .request(Method::PATCH, table)
            .query(&[(COLUMN_ID, format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&patch);
        single_row(self.execute(request).await?, table)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        debug!(table, id, "Delete");
        let request = self
            .request(Method::DELETE, table)
            .query(&[(COLUMN_ID, format!("eq.{id}"))]);
        self.execute(request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::{Path, Query as QueryParams};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use sanctuary_shared::SendError;
    use serde_json::json;

    use crate::query::Direction;

    async fn list_rows(
        Path(table): Path<String>,
        QueryParams(params): QueryParams<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        if headers.get("apikey").and_then(|v| v.to_str().ok()) != Some("anon") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"message": "no api key"})));
        }
        if table == "broken" {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"message": "down"})));
        }
        // Echo the query so the test can inspect what was sent.
        (StatusCode::OK, Json(json!([{"id": "m1", "params": params}])))
    }

    async fn insert_row(
        Path(table): Path<String>,
        headers: HeaderMap,
        Json(mut row): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        if table == "locked" {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "code": "42501",
                    "message": "new row violates row-level security policy",
                    "details": null,
                    "hint": null
                })),
            );
        }
        let prefer = headers
            .get("prefer")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        row["id"] = json!("new-1");
        row["prefer"] = json!(prefer);
        (StatusCode::CREATED, Json(json!([row])))
    }

    async fn spawn_mock() -> String {
        let app = Router::new().route("/rest/v1/:table", get(list_rows).post(insert_row));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_select_sends_postgrest_params() {
        let url = spawn_mock().await;
        let backend = RestBackend::new(&url, "anon").unwrap();

        let query = Query::new()
            .eq("stream_id", "s1")
            .order_by("created_at", Direction::Descending)
            .limit(50);
        let rows = backend.select("stream_chat", &query).await.unwrap();

        assert_eq!(rows.len(), 1);
        let params = &rows[0]["params"];
        assert_eq!(params["stream_id"], "eq.s1");
        assert_eq!(params["order"], "created_at.desc");
        assert_eq!(params["limit"], "50");
        assert_eq!(params["select"], "*");
    }

    #[tokio::test]
    async fn test_insert_returns_representation() {
        let url = spawn_mock().await;
        let backend = RestBackend::new(&url, "anon").unwrap();

        let row = backend
            .insert("stream_chat", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(row["id"], "new-1");
        assert_eq!(row["prefer"], "return=representation");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let url = spawn_mock().await;
        let backend = RestBackend::new(&url, "anon").unwrap();

        let denied = backend.insert("locked", json!({})).await.unwrap_err();
        assert!(denied.is_permission_denied());
        assert!(matches!(SendError::from(denied), SendError::Forbidden(_)));

        let down = backend.select("broken", &Query::new()).await.unwrap_err();
        assert_eq!(down.status, Some(503));
        assert!(down.is_transient());

        let wrong_key = RestBackend::new(&url, "other").unwrap();
        let err = wrong_key.select("stream_chat", &Query::new()).await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = RestBackend::new(&format!("http://{addr}"), "anon").unwrap();
        let err = backend.select("stream_chat", &Query::new()).await.unwrap_err();
        assert_eq!(err.status, None);
        assert!(matches!(SendError::from(err), SendError::Transient(_)));
    }
}
