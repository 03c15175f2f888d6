//! Status-port endpoints of the SQL layer.
//!
//! - `GET /test/gc/resolvelock?safepoint=N&physical=B` runs lock resolution and
//!   answers `{"physicalUsed": bool}`
//! - `GET /schema/{db}/{table}` answers the table's schema, of which only
//!   `{"id": int}` is read

use std::time::Duration;

use gcprobe_types::{TableId, Timestamp};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{GcTrigger, KvError, Result, SchemaResolver};

/// Lock resolution can scan the whole key space.
const GC_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const SCHEMA_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveLockResponse {
    physical_used: bool,
}

#[derive(Debug, Deserialize)]
struct SchemaResponse {
    id: i64,
}

/// Triggers GC through the status port.
#[derive(Debug, Clone)]
pub struct HttpGcTrigger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGcTrigger {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, safe_point: Timestamp, physical: bool) -> String {
        format!(
            "{}/test/gc/resolvelock?safepoint={}&physical={}",
            self.base_url, safe_point, physical
        )
    }
}

impl GcTrigger for HttpGcTrigger {
    async fn resolve_locks(&self, safe_point: Timestamp, physical: bool) -> Result<bool> {
        let url = self.url(safe_point, physical);
        let body: ResolveLockResponse = get_json(&self.client, url, GC_REQUEST_TIMEOUT).await?;
        Ok(body.physical_used)
    }
}

/// Resolves table ids through the status port.
#[derive(Debug, Clone)]
pub struct HttpSchemaResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl SchemaResolver for HttpSchemaResolver {
    async fn table_id(&self, db: &str, table: &str) -> Result<TableId> {
        let url = format!("{}/schema/{}/{}", self.base_url, db, table);
        let body: SchemaResponse = get_json(&self.client, url, SCHEMA_REQUEST_TIMEOUT).await?;
        Ok(TableId::new(body.id))
    }
}

async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: String,
    timeout: Duration,
) -> Result<T> {
    debug!(%url, "GET");
    let response = match client.get(&url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(source) => return Err(KvError::Http { url, source }),
    };
    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(source) => return Err(KvError::Http { url, source }),
    };
    if !status.is_success() {
        return Err(KvError::HttpStatus {
            url,
            status: status.as_u16(),
            message: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }
    if body.is_empty() {
        return Err(KvError::MissingBody);
    }
    serde_json::from_slice(&body).map_err(|source| KvError::Decode { url, source })
}
