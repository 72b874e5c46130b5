//! Google sign-in (OpenID Connect authorization-code flow)

use common::Secret;
use reqwest::Url;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identity::ExternalIdentity;
use crate::provider::{self, Provider, ProviderEndpoints, ProviderFuture, ProviderTokens};

pub const GOOGLE_PROVIDER_ID: &str = "google";

const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const DEFAULT_SCOPES: &[&str] = &["openid", "email"];

impl ProviderEndpoints {
    pub fn google() -> Self {
        Self {
            authorize: AUTHORIZE_ENDPOINT.into(),
            token: TOKEN_ENDPOINT.into(),
            userinfo: USERINFO_ENDPOINT.into(),
        }
    }
}

/// Google as an identity provider.
pub struct GoogleProvider {
    client_id: String,
    client_secret: Secret<String>,
    endpoints: ProviderEndpoints,
}

impl GoogleProvider {
    pub fn new(client_id: impl Into<String>, client_secret: Secret<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            endpoints: ProviderEndpoints::google(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

impl Provider for GoogleProvider {
    fn id(&self) -> &str {
        GOOGLE_PROVIDER_ID
    }

    fn authorization_url(
        &self,
        state: &str,
        challenge: &str,
        redirect_uri: &str,
    ) -> Result<String> {
        let scope = DEFAULT_SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.endpoints.authorize,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
                ("access_type", "online"),
                ("include_granted_scopes", "true"),
            ],
        )
        .map_err(|e| {
            Error::InvalidConfig(format!(
                "authorize endpoint {}: {e}",
                self.endpoints.authorize
            ))
        })?;
        Ok(url.into())
    }

    fn exchange_code<'a>(
        &'a self,
        client: &'a reqwest::Client,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> ProviderFuture<'a, ProviderTokens> {
        Box::pin(async move {
            let request = client.post(&self.endpoints.token).form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", verifier),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose().as_str()),
                ("redirect_uri", redirect_uri),
            ]);
            let response = provider::send(request, "google token exchange").await?;
            provider::decode(response, "google token").await
        })
    }

    fn fetch_identity<'a>(
        &'a self,
        client: &'a reqwest::Client,
        tokens: &'a ProviderTokens,
    ) -> ProviderFuture<'a, ExternalIdentity> {
        Box::pin(async move {
            let request = client
                .get(&self.endpoints.userinfo)
                .bearer_auth(&tokens.access_token);
            let response = provider::send(request, "google userinfo").await?;
            let profile: Value = provider::decode(response, "google userinfo").await?;
            identity_from_profile(profile)
        })
    }
}

/// Pull the stable subject and email out of a Google userinfo document.
///
/// The OIDC endpoint reports `sub`; the legacy v2 endpoint reports `id`.
fn identity_from_profile(profile: Value) -> Result<ExternalIdentity> {
    let subject = profile
        .get("sub")
        .or_else(|| profile.get("id"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| Error::ProviderRejected("google profile has no subject".into()))?;

    let email = profile
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string);
    let email_verified = profile
        .get("email_verified")
        .or_else(|| profile.get("verified_email"))
        .and_then(|v| match v {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(s == "true"),
            _ => None,
        })
        .unwrap_or(false);

    Ok(ExternalIdentity {
        provider_id: GOOGLE_PROVIDER_ID.to_string(),
        subject,
        email,
        email_verified,
        raw_profile: profile,
    })
}
