use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::query::Query;

/// Row-level data operations on the backend's tables.
///
/// Rows are JSON objects exactly as the backend stores them. Writes return
/// the committed row, including server-assigned columns.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>>;

    async fn insert(&self, table: &str, row: Value) -> Result<Value>;

    /// Merge `patch` into the row whose `id` is `id`.
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value>;

    /// Deleting a row that does not exist succeeds.
    async fn delete(&self, table: &str, id: &str) -> Result<()>;
}
