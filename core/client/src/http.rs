//! HTTP client for 1C-style REST publication endpoints.

use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use async_trait::async_trait;
use tradesync_common::{Error, Result};

use crate::client::{Connection, ErpClient, ProgressSink, SyncContext, SyncOutcome};

/// Header carrying the publication API key.
const API_KEY_HEADER: &str = "X-API-Key";

/// Records fetched per nomenclature page.
const DEFAULT_PAGE_SIZE: u32 = 100;

/// A nomenclature record as published by the external system.
///
/// Only identity and bookkeeping fields are typed; the platform-side
/// mapping of the payload is outside this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NomenclatureItem {
    /// External record identifier.
    pub id: String,
    /// External record code.
    pub code: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub article: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Opaque record attributes, passed through untouched.
    #[serde(default)]
    pub characteristics: Option<serde_json::Value>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// One page of nomenclature records.
#[derive(Debug, Deserialize)]
struct NomenclaturePage {
    items: Vec<NomenclatureItem>,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    has_more: bool,
}

/// Health probe response.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// HTTP implementation of [`ErpClient`] for 1C-style endpoints.
pub struct HttpErpClient {
    http: Client,
    page_size: u32,
}

impl HttpErpClient {
    /// Create a new HTTP client.
    pub fn new() -> Self {
        let http = Client::builder()
            .user_agent("TradeSync/0.1")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the nomenclature page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn endpoint(conn: &Connection, path: &str) -> Result<Url> {
        let base = conn.base_url.trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path))
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint: {}", e)))
    }

    fn request(&self, conn: &Connection, url: Url, deadline: std::time::Duration) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .get(url)
            .timeout(deadline)
            .header(header::ACCEPT, "application/json");

        if let Some(key) = &conn.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }

        builder
    }

    /// Map a transport-level failure to the orchestrator taxonomy.
    fn transport_error(e: reqwest::Error) -> Error {
        // Timeouts and connection failures are worth retrying; anything
        // the client itself got wrong (bad request construction) is not.
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Error::transient(format!("Transport failure: {}", e))
        } else {
            Error::permanent(format!("Request failed: {}", e))
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::permanent(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(Error::permanent(format!(
                "Rejected by external system: {}",
                status
            )))
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(Error::permanent(format!("API error: {} - {}", status, body)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::transient(format!("API error: {} - {}", status, body)))
        }
    }
}

impl Default for HttpErpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ErpClient for HttpErpClient {
    fn name(&self) -> &str {
        "onec-http"
    }

    async fn health_check(&self, conn: &Connection) -> Result<bool> {
        let url = Self::endpoint(conn, "/hs/api/health")?;
        let response = self
            .request(conn, url, std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(Self::transport_error)?;

        let health: HealthResponse = self.handle_response(response).await?;
        Ok(health.status == "ok")
    }

    async fn execute_sync(
        &self,
        conn: &Connection,
        ctx: &SyncContext,
        progress: ProgressSink<'_>,
    ) -> Result<SyncOutcome> {
        let mut offset: u64 = 0;
        let mut records: u64 = 0;

        debug!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            "Fetching nomenclature from {}",
            conn.base_url
        );

        loop {
            let url = Self::endpoint(conn, "/hs/api/nomenclature")?;
            let mut builder = self.request(conn, url, ctx.deadline).query(&[
                ("limit", self.page_size.to_string()),
                ("offset", offset.to_string()),
            ]);

            if let Some(since) = &ctx.updated_since {
                builder = builder.query(&[("updated_since", since.to_rfc3339())]);
            }

            let response = builder.send().await.map_err(Self::transport_error)?;
            let page: NomenclaturePage = self.handle_response(response).await?;

            records += page.items.len() as u64;
            offset += page.items.len() as u64;
            progress(records);

            if !page.has_more || page.items.is_empty() {
                debug!(
                    run_id = %ctx.run_id,
                    "Nomenclature fetch complete: {} of {} records",
                    records,
                    page.total
                );
                break;
            }
        }

        info!(run_id = %ctx.run_id, records, "Sync protocol completed");

        Ok(SyncOutcome {
            records_processed: records,
        })
    }
}

/// Parse an external-system timestamp, tolerating missing offsets.
pub fn parse_updated_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nomenclature_page_deserializes() {
        let json = r#"{
            "items": [
                {"id": "PROD-0001", "code": "CODE-0001", "name": "Item 1", "price": 99.5},
                {"id": "PROD-0002", "code": "CODE-0002", "name": "Item 2", "quantity": 3.0}
            ],
            "total": 2,
            "limit": 100,
            "offset": 0,
            "has_more": false
        }"#;

        let page: NomenclaturePage = serde_json::from_str(json).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 2);
        assert!(!page.has_more);
        assert_eq!(page.items[0].price, Some(99.5));
        assert!(page.items[0].manufacturer.is_none());
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let conn = Connection::new("http://erp.local:8080", None);
        let url = HttpErpClient::endpoint(&conn, "/hs/api/health").unwrap();
        assert_eq!(url.as_str(), "http://erp.local:8080/hs/api/health");
    }

    #[test]
    fn parse_updated_at_accepts_naive_timestamps() {
        assert!(parse_updated_at("2025-11-03T10:15:30.123456").is_some());
        assert!(parse_updated_at("2025-11-03T10:15:30+00:00").is_some());
        assert!(parse_updated_at("not a timestamp").is_none());
    }
}
