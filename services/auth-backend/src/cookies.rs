//! Session credentials on the wire
//!
//! Credentials travel in two HttpOnly cookies. The access credential may
//! also arrive as `Authorization: Bearer <token>`, which wins over the cookie.
//!
//! A third cookie carries the OAuth `state` of a sign-in in progress, so a
//! callback only completes in the browser that started it.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::config::CookieSettings;

pub const ACCESS_COOKIE: &str = "sAccessToken";
pub const REFRESH_COOKIE: &str = "sRefreshToken";
pub const STATE_COOKIE: &str = "sAuthState";
const STATE_COOKIE_PATH: &str = "/auth/callback";

/// Credentials presented with a request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Presented {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

pub fn read_credentials(headers: &HeaderMap) -> Presented {
    let jar = CookieJar::from_headers(headers);
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());

    Presented {
        access: bearer.or_else(|| jar.get(ACCESS_COOKIE).map(|c| c.value().to_owned())),
        refresh: jar.get(REFRESH_COOKIE).map(|c| c.value().to_owned()),
    }
}

fn build(settings: &CookieSettings, name: &'static str, value: String, max_age: Duration) -> Cookie<'static> {
    let mut builder = Cookie::build((name, value))
        .http_only(true)
        .secure(settings.secure)
        .same_site(settings.same_site)
        .path("/")
        .max_age(max_age);
    if let Some(domain) = &settings.domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

/// Add both session cookies. They live as long as the session; the access
/// token inside carries its own shorter expiry.
pub fn set_session_cookies(
    jar: CookieJar,
    settings: &CookieSettings,
    access_token: String,
    refresh_credential: String,
    max_age: std::time::Duration,
) -> CookieJar {
    let max_age = to_cookie_age(max_age);
    jar.add(build(settings, ACCESS_COOKIE, access_token, max_age))
        .add(build(settings, REFRESH_COOKIE, refresh_credential, max_age))
}

/// Expire both session cookies.
pub fn clear_session_cookies(jar: CookieJar, settings: &CookieSettings) -> CookieJar {
    jar.add(build(settings, ACCESS_COOKIE, String::new(), Duration::ZERO))
        .add(build(settings, REFRESH_COOKIE, String::new(), Duration::ZERO))
}

fn build_state(settings: &CookieSettings, value: String, max_age: Duration) -> Cookie<'static> {
    // The provider redirect is a cross-site navigation; Strict would drop it.
    let same_site = match settings.same_site {
        SameSite::None => SameSite::None,
        _ => SameSite::Lax,
    };
    let mut builder = Cookie::build((STATE_COOKIE, value))
        .http_only(true)
        .secure(settings.secure)
        .same_site(same_site)
        .path(STATE_COOKIE_PATH)
        .max_age(max_age);
    if let Some(domain) = &settings.domain {
        builder = builder.domain(domain.clone());
    }
    builder.build()
}

/// Remember the `state` of a sign-in this browser started.
pub fn set_state_cookie(
    jar: CookieJar,
    settings: &CookieSettings,
    state: String,
    max_age: std::time::Duration,
) -> CookieJar {
    jar.add(build_state(settings, state, to_cookie_age(max_age)))
}

pub fn clear_state_cookie(jar: CookieJar, settings: &CookieSettings) -> CookieJar {
    jar.add(build_state(settings, String::new(), Duration::ZERO))
}

/// Whether the browser holds the state cookie for `state`.
pub fn state_matches(jar: &CookieJar, state: &str) -> bool {
    jar.get(STATE_COOKIE)
        .is_some_and(|c| !c.value().is_empty() && c.value() == state)
}

fn to_cookie_age(age: std::time::Duration) -> Duration {
    Duration::seconds(i64::try_from(age.as_secs()).unwrap_or(i64::MAX))
}
