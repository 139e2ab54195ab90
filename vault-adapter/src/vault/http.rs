use super::VaultClient;
use crate::config::{SecretValue, StorageConfig};
use crate::error::{VaultError, VaultResult};
use crate::types::{ArchiveEntry, ArchiveId};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    archive_id: ArchiveId,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    entries: &'a [ArchiveEntry],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    archive_ids: Vec<ArchiveId>,
}

#[derive(Debug, Serialize)]
struct RetentionRequest<'a> {
    policy_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// JSON-over-HTTP vault client.
///
/// Routes, relative to the endpoint:
/// - `POST /api/v1/archives` → `{"archive_id"}`
/// - `POST /api/v1/archives/batch` with `{"entries"}` → `{"archive_ids"}`
/// - `GET|DELETE /api/v1/archives/{id}`
/// - `POST /api/v1/archives/{id}/retention` with `{"policy_id"}`
/// - `GET /health` → `{"status"}`
pub struct HttpVaultClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretValue,
    timeout_seconds: u64,
}

impl std::fmt::Debug for HttpVaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVaultClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl HttpVaultClient {
    pub fn new(endpoint: &str, api_key: SecretValue, timeout_seconds: u64) -> VaultResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| VaultError::ConnectionError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            timeout_seconds,
        })
    }

    pub fn from_config(config: &StorageConfig) -> VaultResult<Self> {
        Self::new(
            &config.remote_endpoint,
            config.api_key.clone(),
            config.performance.timeout_seconds,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// URL of one archive; the id is percent-encoded into a single path segment.
    fn archive_url(&self, archive_id: &str, suffix: &str) -> String {
        self.url(&format!(
            "/api/v1/archives/{}{}",
            urlencoding::encode(archive_id),
            suffix
        ))
    }

    fn send_error(&self, e: reqwest::Error) -> VaultError {
        if e.is_timeout() {
            VaultError::Timeout {
                seconds: self.timeout_seconds,
            }
        } else {
            VaultError::ConnectionError(e.to_string())
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> VaultResult<Response> {
        let response = request
            .bearer_auth(self.api_key.expose())
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                VaultError::AuthenticationError(format!("vault returned {}", status))
            }
            StatusCode::NOT_FOUND => VaultError::NotFound(message),
            _ => VaultError::ApiError {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> VaultResult<T> {
        let body = response.bytes().await.map_err(|e| self.send_error(e))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn archive(&self, entry: &ArchiveEntry) -> VaultResult<ArchiveId> {
        let response = self
            .send(self.client.post(self.url("/api/v1/archives")).json(entry))
            .await?;
        let body: ArchiveResponse = self.decode(response).await?;
        tracing::debug!(
            "[VaultClient] archived session {} as {}",
            entry.session_id,
            body.archive_id
        );
        Ok(body.archive_id)
    }

    async fn batch_archive(&self, entries: &[ArchiveEntry]) -> VaultResult<Vec<ArchiveId>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .send(
                self.client
                    .post(self.url("/api/v1/archives/batch"))
                    .json(&BatchRequest { entries }),
            )
            .await?;
        let body: BatchResponse = self.decode(response).await?;
        if body.archive_ids.len() != entries.len() {
            return Err(VaultError::Serialization(format!(
                "batch archive returned {} ids for {} entries",
                body.archive_ids.len(),
                entries.len()
            )));
        }
        Ok(body.archive_ids)
    }

    async fn retrieve(&self, archive_id: &str) -> VaultResult<ArchiveEntry> {
        let response = self
            .send(self.client.get(self.archive_url(archive_id, "")))
            .await
            .map_err(|e| match e {
                VaultError::NotFound(_) => VaultError::NotFound(archive_id.to_string()),
                other => other,
            })?;
        self.decode(response).await
    }

    async fn delete(&self, archive_id: &str) -> VaultResult<()> {
        self.send(self.client.delete(self.archive_url(archive_id, "")))
            .await
            .map_err(|e| match e {
                VaultError::NotFound(_) => VaultError::NotFound(archive_id.to_string()),
                other => other,
            })?;
        Ok(())
    }

    async fn apply_retention_policy(&self, archive_id: &str, policy_id: &str) -> VaultResult<()> {
        self.send(
            self.client
                .post(self.archive_url(archive_id, "/retention"))
                .json(&RetentionRequest { policy_id }),
        )
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> VaultResult<bool> {
        match self.send(self.client.get(self.url("/health"))).await {
            Ok(response) => {
                let body: HealthResponse = self.decode(response).await?;
                Ok(matches!(body.status.as_str(), "ok" | "healthy"))
            }
            Err(VaultError::ApiError { status, .. }) if status >= 500 => Ok(false),
            Err(e) => Err(e),
        }
    }
}
