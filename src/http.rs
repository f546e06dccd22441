//! Plain-text HTTP fetches used by the public IP lookup and blacklist sources.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::{Error, Result};

/// Timeout for blacklist downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the shared HTTP client.
pub fn client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// GET `url` and return its body as text, treating non-2xx statuses as errors.
pub async fn fetch_text(client: &Client, url: &str, timeout: Duration) -> Result<String> {
    debug!(url, "GET request");
    let to_error = |source: reqwest::Error| Error::Http {
        url: url.to_string(),
        source,
    };

    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(to_error)?
        .error_for_status()
        .map_err(to_error)?;

    response.text().await.map_err(to_error)
}
