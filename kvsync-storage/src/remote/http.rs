//! REST document store over HTTP.
//!
//! Documents live at `{base_url}/documents/{key}`:
//!
//! | Operation | Request | Success |
//! |---|---|---|
//! | get | `GET` | 200 with JSON body, 404 means not found |
//! | set | `PUT` with JSON body | any 2xx |
//! | delete | `DELETE` | any 2xx or 404 |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvsync_core::{Document, KvResult, RemoteOperation, StoreError};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{RemoteConnector, RemoteStore};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a REST document store.
///
/// The connection is probed with a `HEAD` request against the base URL. A
/// transport failure marks the remote unavailable; any HTTP response, even
/// an error status, proves the server is reachable.
#[derive(Debug, Clone)]
pub struct HttpRemoteConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl HttpRemoteConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the TCP connect timeout used by the probe and every later call.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RemoteConnector for HttpRemoteConnector {
    async fn connect(&self) -> KvResult<Arc<dyn RemoteStore>> {
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| StoreError::RemoteUnavailable {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        let probe = client.head(&self.base_url).send().await.map_err(|e| {
            StoreError::RemoteUnavailable {
                reason: format!("Failed to reach {}: {}", self.base_url, e),
            }
        })?;
        debug!(base_url = %self.base_url, status = %probe.status(), "Remote store probe answered");

        Ok(Arc::new(HttpRemoteStore::with_client(
            client,
            self.base_url.clone(),
        )))
    }
}

/// REST document store client.
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
}

impl HttpRemoteStore {
    /// Create a client without probing the server.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url.into())
    }

    fn with_client(client: Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// URL of the document for `key`.
    pub fn document_url(&self, key: &str) -> String {
        format!("{}/documents/{}", self.base_url, urlencoding::encode(key))
    }
}

fn request_failed(operation: RemoteOperation, key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::RemoteOperationFailed {
        operation,
        key: key.to_string(),
        reason: reason.into(),
    }
}

async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    format!("HTTP {}: {}", status.as_u16(), text)
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(&self, key: &str) -> KvResult<Option<Document>> {
        let response = self
            .client
            .get(self.document_url(key))
            .send()
            .await
            .map_err(|e| request_failed(RemoteOperation::Get, key, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let reason = error_body(response).await;
            return Err(request_failed(RemoteOperation::Get, key, reason).into());
        }

        let document: Document = response.json().await.map_err(|e| {
            request_failed(
                RemoteOperation::Get,
                key,
                format!("Failed to parse document: {}", e),
            )
        })?;
        Ok(Some(document))
    }

    async fn set(&self, key: &str, document: &Document) -> KvResult<()> {
        let response = self
            .client
            .put(self.document_url(key))
            .json(document)
            .send()
            .await
            .map_err(|e| request_failed(RemoteOperation::Set, key, e.to_string()))?;

        if !response.status().is_success() {
            let reason = error_body(response).await;
            return Err(request_failed(RemoteOperation::Set, key, reason).into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let response = self
            .client
            .delete(self.document_url(key))
            .send()
            .await
            .map_err(|e| request_failed(RemoteOperation::Delete, key, e.to_string()))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let reason = error_body(response).await;
        Err(request_failed(RemoteOperation::Delete, key, reason).into())
    }
}
