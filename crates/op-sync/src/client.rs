//! HTTP client for the op-sync server REST API.

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

use crate::error::{OpSyncError, Result};
use crate::types::*;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the op-sync server API.
#[derive(Debug, Clone)]
pub struct OpSyncClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpSyncClient {
    /// Create a new client against `base_url`
    /// (e.g. `https://sync.daystack.app`).
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(OpSyncError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[OpSync] API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[OpSync] API response error ({}): {}", status, preview);
    }

    /// Create headers for an API request.
    fn headers(&self, token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| OpSyncError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(headers)
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(OpSyncError::api(
                    status.as_u16(),
                    format!("{}: {}", error.code, error.message),
                ));
            }
            return Err(OpSyncError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[OpSync] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            OpSyncError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// Pull ops after a sequence number.
    ///
    /// GET /api/sync/ops?sinceSeq={n}
    pub async fn get_ops(&self, token: &str, since_seq: i64) -> Result<OpsPullResponse> {
        let url = format!("{}/api/sync/ops", self.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .query(&[("sinceSeq", since_seq.to_string())])
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Push local ops.
    ///
    /// POST /api/sync/ops
    pub async fn post_ops(&self, token: &str, req: &OpsPushRequest) -> Result<OpsPushResponse> {
        let url = format!("{}/api/sync/ops", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(token)?)
            .json(req)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Upload a full-state snapshot.
    ///
    /// POST /api/sync/snapshot
    pub async fn post_snapshot(
        &self,
        token: &str,
        req: &SnapshotUploadRequest,
    ) -> Result<SnapshotUploadResponse> {
        let url = format!("{}/api/sync/snapshot", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers(token)?)
            .json(req)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Server-side wipe for the clean-slate flow.
    ///
    /// DELETE /api/sync/all
    pub async fn delete_all(&self, token: &str) -> Result<SuccessResponse> {
        let url = format!("{}/api/sync/all", self.base_url);
        let response = self
            .client
            .delete(&url)
            .headers(self.headers(token)?)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// List admin restore points.
    ///
    /// GET /api/sync/restore-points
    pub async fn get_restore_points(&self, token: &str) -> Result<Vec<RestorePoint>> {
        let url = format!("{}/api/sync/restore-points", self.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// Reconstructed state at a historic sequence number.
    ///
    /// GET /api/sync/state/{serverSeq}
    pub async fn get_state_at(&self, token: &str, server_seq: i64) -> Result<serde_json::Value> {
        let url = format!("{}/api/sync/state/{}", self.base_url, server_seq);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(token)?)
            .send()
            .await?;
        Self::parse_response(response).await
    }
}
