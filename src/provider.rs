//! Client for the hosted chat-history table.
//!
//! The table lives in a managed backend-as-a-service and is read over its
//! REST interface:
//!
//! GET {base}/rest/v1/{table}?select=id,session_id,message
//!     &order=session_id.asc,id.asc&limit={row_limit}
//!
//! Rows arrive ordered (session_id asc, id asc) with a row cap, so the
//! grouping stage can rely on upstream ordering. Authentication is
//! delegated entirely to the provider: requests carry the project anon key.
//!
//! The client is constructed explicitly in main and shared through
//! AppState. There is no module-level singleton.

use crate::normalize::RawRow;
use tracing::debug;

/// Default upstream table
const DEFAULT_TABLE: &str = "chat_histories";

/// Default row cap per fetch
const DEFAULT_ROW_LIMIT: usize = 500;

/// Connection settings for the hosted table
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub table: String,
    pub row_limit: usize,
}

impl ProviderConfig {
    /// Read settings from the environment.
    /// HERON_PROVIDER_URL and HERON_PROVIDER_KEY are required; table name
    /// and row cap have defaults.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let base_url =
            std::env::var("HERON_PROVIDER_URL").map_err(|_| "HERON_PROVIDER_URL not set")?;
        let api_key =
            std::env::var("HERON_PROVIDER_KEY").map_err(|_| "HERON_PROVIDER_KEY not set")?;
        let table =
            std::env::var("HERON_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.to_string());
        let row_limit = std::env::var("HERON_ROW_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ROW_LIMIT);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            table,
            row_limit,
        })
    }
}

/// Handle to the hosted table
pub struct TableClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl TableClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// REST endpoint for the configured table
    fn rows_url(&self) -> String {
        format!("{}/rest/v1/{}", self.config.base_url, self.config.table)
    }

    /// Fetch one batch of rows ordered (session_id asc, id asc).
    /// A failed fetch is the caller's to handle; the previous snapshot
    /// stays in place.
    pub async fn fetch_rows(&self) -> Result<Vec<RawRow>, Box<dyn std::error::Error + Send + Sync>> {
        let limit = self.config.row_limit.to_string();

        let response = self
            .http
            .get(self.rows_url())
            .query(&[
                ("select", "id,session_id,message"),
                ("order", "session_id.asc,id.asc"),
                ("limit", limit.as_str()),
            ])
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("table fetch failed with {}: {}", status, body).into());
        }

        let rows: Vec<RawRow> = response.json().await?;
        debug!("Fetched {} rows from {}", rows.len(), self.config.table);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            base_url: "https://example.test".to_string(),
            api_key: "anon-key".to_string(),
            table: "chat_histories".to_string(),
            row_limit: 500,
        }
    }

    #[test]
    fn test_rows_url() {
        let client = TableClient::new(config());
        assert_eq!(client.rows_url(), "https://example.test/rest/v1/chat_histories");
    }

    #[test]
    fn test_rows_url_custom_table() {
        let mut cfg = config();
        cfg.table = "wp_chat".to_string();
        let client = TableClient::new(cfg);
        assert_eq!(client.rows_url(), "https://example.test/rest/v1/wp_chat");
    }

    #[test]
    fn test_response_body_deserializes() {
        let body = r#"[
            {"id": 1, "session_id": "s1", "message": "hello"},
            {"id": "msg-2", "session_id": null, "message": {"content": "hi"}}
        ]"#;
        let rows: Vec<RawRow> = serde_json::from_str(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].session_id.is_none());
    }
}
