//! Remex Agent Client
//!
//! HTTPS client used by the orchestrator to drive remote run agents.
//!
//! Every request is authenticated in both directions: the agent must present
//! a certificate issued by the executor CA and the orchestrator presents its
//! own client certificate. Calls use a short fixed timeout so that a dead
//! agent never stalls the caller.

pub mod error;

pub use error::{ClientError, Result};

use remex_core::dto::agent::{AgentRunRequest, RemoteRunStatus};
use reqwest::{Certificate, Client, Identity};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// PEM-encoded certificate material for mutual TLS
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

/// HTTP client for remote run agents
///
/// One client serves every agent; the base URL is passed per call because it
/// depends on the executor the run belongs to.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
}

impl AgentClient {
    /// Build a client presenting `tls` and trusting only its CA
    pub fn new(tls: &TlsMaterial, timeout: Duration) -> Result<Self> {
        let mut identity_pem = tls.client_cert.clone();
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&tls.client_key);

        let identity = Identity::from_pem(&identity_pem)
            .map_err(|e| ClientError::Tls(format!("client identity: {}", e)))?;
        let ca = Certificate::from_pem(&tls.ca_cert)
            .map_err(|e| ClientError::Tls(format!("CA certificate: {}", e)))?;

        let client = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    /// Create a client around a preconfigured reqwest client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// POST {base}/run/{runId}
    pub async fn start_run(&self, base_url: &str, request: &AgentRunRequest) -> Result<()> {
        let url = run_url(base_url, request.run_id);
        tracing::debug!("Starting run {} at {}", request.run_id, url);
        let response = self.client.post(&url).json(request).send().await?;
        self.handle_empty_response(response).await
    }

    /// POST {base}/run/{runId}/stop
    pub async fn stop_run(&self, base_url: &str, run_id: i64) -> Result<()> {
        let url = format!("{}/stop", run_url(base_url, run_id));
        let response = self.client.post(&url).send().await?;
        self.handle_empty_response(response).await
    }

    /// GET {base}/run/{runId}
    pub async fn run_status(&self, base_url: &str, run_id: i64) -> Result<RemoteRunStatus> {
        let response = self.client.get(run_url(base_url, run_id)).send().await?;
        self.handle_response(response).await
    }

    /// DELETE {base}/run/{runId}
    pub async fn remove_run(&self, base_url: &str, run_id: i64) -> Result<()> {
        let response = self.client.delete(run_url(base_url, run_id)).send().await?;
        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

fn run_url(base_url: &str, run_id: i64) -> String {
    format!("{}/run/{}", base_url.trim_end_matches('/'), run_id)
}
