use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::provider::{ProviderError, Result};

const API_URL: &str = "https://api.digitalocean.com/v2";

/// Thin authenticated JSON client for the DigitalOcean v2 API.
///
/// Every non-2xx response is turned into a [`ProviderError`] classified by
/// status code, so callers only ever see retryable vs fatal.
pub struct DigitalOceanClient {
    token: SecretString,
    client: Client,
    base_url: String,
}

impl DigitalOceanClient {
    pub fn new(token: SecretString) -> Result<Self> {
        Self::with_base_url(token, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(token: SecretString, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            token,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        Ok(response.json::<T>().await?)
    }

    /// POST or PUT whose response body is irrelevant.
    pub async fn send_json<B: Serialize>(&self, method: Method, path: &str, body: &B) -> Result<()> {
        self.send(method, path, Some(body)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "DigitalOcean API call");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(self.token.expose_secret())
            .header("content-type", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(classify(status, &message))
    }
}

fn classify(status: StatusCode, body: &str) -> ProviderError {
    ProviderError::from_status(
        status.as_u16(),
        format!("DigitalOcean API error {}: {}", status.as_u16(), body),
    )
}
