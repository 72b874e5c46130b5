//! Identity provider abstraction
//!
//! A provider knows its endpoints and how to turn an authorization code into
//! a verified `ExternalIdentity`. The exchange engine owns state, PKCE and
//! timeouts; providers only speak HTTP to their own endpoints.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).

use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::ExternalIdentity;

/// Future returned by provider network calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// OAuth endpoints of one provider. Overridable so tests can stand up a
/// local mock provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize: String,
    pub token: String,
    pub userinfo: String,
}

/// Token endpoint response. Only the access token is required.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the provider access token expires
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

pub trait Provider: Send + Sync {
    /// Stable identifier used in routes and the user directory, e.g. "google"
    fn id(&self) -> &str;

    /// Authorization URL carrying `client_id`, `redirect_uri`, `scope`,
    /// `state` and the S256 PKCE challenge.
    fn authorization_url(&self, state: &str, challenge: &str, redirect_uri: &str)
    -> Result<String>;

    /// Exchange an authorization code (plus PKCE verifier) for provider tokens.
    fn exchange_code<'a>(
        &'a self,
        client: &'a reqwest::Client,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> ProviderFuture<'a, ProviderTokens>;

    /// Fetch the user profile with the provider access token.
    fn fetch_identity<'a>(
        &'a self,
        client: &'a reqwest::Client,
        tokens: &'a ProviderTokens,
    ) -> ProviderFuture<'a, ExternalIdentity>;
}

/// Send a provider request and sort failures into retryable and terminal.
///
/// Transport errors, 429 and 5xx mean the provider is unavailable; any other
/// non-success status is a rejection of this particular request.
pub(crate) async fn send(request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::ProviderUnavailable(format!("{what} request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        debug!(what, %status, "provider call succeeded");
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    warn!(what, %status, body = %body, "provider call failed");

    if status.is_server_error() || status.as_u16() == 429 {
        return Err(Error::ProviderUnavailable(format!("{what} returned {status}")));
    }
    Err(Error::ProviderRejected(format!("{what} returned {status}")))
}

/// Decode a successful provider response body.
pub(crate) async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| Error::ProviderRejected(format!("invalid {what} response: {e}")))
}
