//! Client for the IGSN minting authority (MDS).
//!
//! The client never retries; the task queue decides whether a failure is
//! worth another attempt based on [`RegistrarError::is_retryable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::error::{IgsnError, RegistrarError, Result};
use crate::types::Allocation;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations against the minting authority for one allocation.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register `identifier` pointing at `landing_page`. Outside test mode the
    /// registration metadata is attached afterwards.
    async fn mint_identifier(
        &self,
        identifier: &str,
        landing_page: &str,
        metadata: &str,
        test_mode: bool,
    ) -> std::result::Result<(), RegistrarError>;

    async fn attach_metadata(&self, metadata: &str) -> std::result::Result<(), RegistrarError>;

    async fn fetch_metadata(&self, identifier: &str) -> std::result::Result<String, RegistrarError>;

    async fn fetch_landing_page(
        &self,
        identifier: &str,
    ) -> std::result::Result<String, RegistrarError>;
}

/// Produces the registrar for an allocation.
pub trait RegistrarFactory: Send + Sync {
    fn for_allocation(&self, allocation: &Allocation) -> Result<Arc<dyn Registrar>>;
}

// ─── HTTP client ──────────────────────────────────────────────

pub struct MdsClient {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
}

impl std::fmt::Debug for MdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdsClient")
            .field("base", &self.base.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl MdsClient {
    pub fn new(allocation: &Allocation, timeout: Duration) -> Result<Self> {
        let missing = |what: &str| {
            IgsnError::Configuration(format!("allocation '{}' has no {what}", allocation.id))
        };
        let base = allocation
            .mds_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| missing("registrar URL"))?;
        let base = Url::parse(base).map_err(|e| {
            IgsnError::Configuration(format!(
                "allocation '{}' registrar URL '{base}' is invalid: {e}",
                allocation.id
            ))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(IgsnError::Configuration(format!(
                "allocation '{}' registrar URL must be http(s)",
                allocation.id
            )));
        }
        let username = allocation
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| missing("registrar username"))?;
        let password = allocation
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| missing("registrar password"))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IgsnError::Configuration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            username,
            password,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> std::result::Result<String, RegistrarError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        let body = response.text().await.map_err(classify)?;
        if status == expected {
            return Ok(body);
        }
        let status = status.as_u16();
        Err(match status {
            502..=504 => RegistrarError::Unavailable { status, body },
            _ => RegistrarError::Rejected { status, body },
        })
    }
}

fn classify(e: reqwest::Error) -> RegistrarError {
    if e.is_timeout() {
        RegistrarError::Timeout(e.to_string())
    } else {
        RegistrarError::Transport(e.to_string())
    }
}

#[async_trait]
impl Registrar for MdsClient {
    async fn mint_identifier(
        &self,
        identifier: &str,
        landing_page: &str,
        metadata: &str,
        test_mode: bool,
    ) -> std::result::Result<(), RegistrarError> {
        let body = format!("igsn={identifier}\nurl={landing_page}");
        let request = self
            .http
            .post(self.endpoint("igsn"))
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(body);
        self.send(request, StatusCode::CREATED).await?;
        info!(identifier, test_mode, "Identifier registered with MDS");

        if !test_mode {
            self.attach_metadata(metadata).await?;
        }
        Ok(())
    }

    async fn attach_metadata(&self, metadata: &str) -> std::result::Result<(), RegistrarError> {
        let request = self
            .http
            .post(self.endpoint("metadata"))
            .header(CONTENT_TYPE, "application/xml;charset=UTF-8")
            .body(metadata.to_string());
        self.send(request, StatusCode::CREATED).await?;
        debug!(bytes = metadata.len(), "Metadata attached");
        Ok(())
    }

    async fn fetch_metadata(&self, identifier: &str) -> std::result::Result<String, RegistrarError> {
        let request = self.http.get(self.endpoint(&format!("metadata/{identifier}")));
        self.send(request, StatusCode::OK).await
    }

    async fn fetch_landing_page(
        &self,
        identifier: &str,
    ) -> std::result::Result<String, RegistrarError> {
        let request = self.http.get(self.endpoint(&format!("igsn/{identifier}")));
        self.send(request, StatusCode::OK).await
    }
}

/// Builds one [`MdsClient`] per allocation and reuses it.
pub struct MdsClientFactory {
    timeout: Duration,
    clients: Mutex<HashMap<String, Arc<dyn Registrar>>>,
}

impl MdsClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MdsClientFactory {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl RegistrarFactory for MdsClientFactory {
    fn for_allocation(&self, allocation: &Allocation) -> Result<Arc<dyn Registrar>> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| IgsnError::Internal(anyhow::anyhow!("registrar cache lock poisoned")))?;
        if let Some(client) = clients.get(&allocation.id) {
            return Ok(client.clone());
        }
        let client: Arc<dyn Registrar> = Arc::new(MdsClient::new(allocation, self.timeout)?);
        clients.insert(allocation.id.clone(), client.clone());
        Ok(client)
    }
}
