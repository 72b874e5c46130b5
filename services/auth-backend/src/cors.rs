//! CORS for the front-end origin
//!
//! Exactly one origin is allowed: the configured website domain. Credentials
//! (cookies) are allowed, so methods and headers are listed explicitly.

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::CorsLayer;

/// Headers front-end session SDKs send alongside the standard ones.
const SDK_HEADERS: [&str; 3] = ["rid", "fdi-version", "st-auth-mode"];

pub fn layer(website_domain: &str) -> common::Result<CorsLayer> {
    let origin = HeaderValue::from_str(website_domain).map_err(|e| {
        common::Error::Config(format!("WEBSITE_DOMAIN is not a valid origin: {e}"))
    })?;

    let mut headers = vec![CONTENT_TYPE, AUTHORIZATION];
    headers.extend(SDK_HEADERS.map(HeaderName::from_static));

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
        .allow_headers(headers))
}
