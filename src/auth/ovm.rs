//! Credential validation against the OVM manager.
//!
//! The exporter does not keep its own user database. On login, the
//! supplied credentials are used for an authenticated request against the
//! OVM manager REST API; if the manager accepts them, the exporter issues
//! its own token.

use std::time::Duration;

use crate::error::{ExporterError, ExporterResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Helper client used to validate authentication data against the OVM
/// manager.
pub struct OvmClient {
    endpoint: String,
    client: reqwest::Client,
}

impl OvmClient {
    pub fn new(endpoint: &str) -> ExporterResult<Self> {
        // OVM managers ship self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExporterError::io("building OVM client", std::io::Error::other(e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Makes an authenticated request to the OVM API endpoint to validate
    /// that the supplied username and password are correct. Listing
    /// repository ids is the cheapest call that requires auth.
    pub async fn validate_credentials(&self, username: &str, password: &str) -> ExporterResult<()> {
        let url = format!("{}/ovm/core/wsapi/rest/Repository/id", self.endpoint);
        let response = self
            .client
            .get(&url)
            .basic_auth(username, Some(password))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ExporterError::Unauthorized(format!("failed to login: {e}")))?;

        if !response.status().is_success() {
            return Err(ExporterError::Unauthorized(format!(
                "failed to login: upstream returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
