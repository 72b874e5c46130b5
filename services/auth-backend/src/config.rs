//! Configuration types and loading
//!
//! Environment first: a `.env` file is loaded by `main` before this runs.
//! Every missing required variable is collected and reported in one error.
//! Tunables (TTLs, sweep interval, provider timeout, endpoint overrides) come
//! from an optional TOML file named by `AUTH_CONFIG_PATH`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum_extra::extract::cookie::SameSite;
use common::Secret;
use serde::Deserialize;
use session::StoreBackend;
use thirdparty::ProviderEndpoints;

const REQUIRED: [&str; 5] = [
    "SESSION_STORE_URI",
    "API_DOMAIN",
    "WEBSITE_DOMAIN",
    "GOOGLE_CLIENT_ID",
    "GOOGLE_CLIENT_SECRET",
];

/// Ten years. Longer durations are treated as configuration mistakes.
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Immutable configuration, built once at startup.
#[derive(Debug)]
pub struct AppConfig {
    pub app_name: String,
    pub listen_addr: SocketAddr,
    /// Origin of this backend, e.g. `https://api.example.com`
    pub api_domain: String,
    /// Origin of the front-end; the only origin CORS allows
    pub website_domain: String,
    pub store_backend: StoreBackend,
    pub google: GoogleConfig,
    /// Raw `kid:secret,...` list; `None` means an ephemeral key
    pub signing_keys: Option<Secret<String>>,
    pub cookies: CookieSettings,
    pub max_concurrent_requests: usize,
    pub tunables: Tunables,
}

#[derive(Debug)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub secure: bool,
    pub same_site: SameSite,
    pub domain: Option<String>,
}

/// `[session]` and `[oauth]` tables of the tunables file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    pub session: SessionTunables,
    pub oauth: OAuthTunables,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionTunables {
    pub access_token_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub revoked_grace_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: 3600,
            session_ttl_secs: 100 * 24 * 60 * 60,
            revoked_grace_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OAuthTunables {
    pub state_ttl_secs: u64,
    pub provider_timeout_secs: u64,
    /// Cap on sign-in attempts awaiting their callback
    pub max_pending: usize,
    pub google: GoogleEndpointOverrides,
}

impl Default for OAuthTunables {
    fn default() -> Self {
        Self {
            state_ttl_secs: 600,
            provider_timeout_secs: 10,
            max_pending: 10_000,
            google: GoogleEndpointOverrides::default(),
        }
    }
}

/// Replacement Google endpoints, for staging or a local mock.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GoogleEndpointOverrides {
    pub authorize: Option<String>,
    pub token: Option<String>,
    pub userinfo: Option<String>,
}

impl Tunables {
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let tunables: Tunables = toml::from_str(&contents)?;
        tunables.validate()?;
        Ok(tunables)
    }

    fn validate(&self) -> common::Result<()> {
        let durations = [
            ("session.access_token_ttl_secs", self.session.access_token_ttl_secs),
            ("session.session_ttl_secs", self.session.session_ttl_secs),
            ("session.sweep_interval_secs", self.session.sweep_interval_secs),
            ("oauth.state_ttl_secs", self.oauth.state_ttl_secs),
            ("oauth.provider_timeout_secs", self.oauth.provider_timeout_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        let bounded = durations
            .into_iter()
            .chain([("session.revoked_grace_secs", self.session.revoked_grace_secs)]);
        for (name, value) in bounded {
            if value > MAX_DURATION_SECS {
                return Err(common::Error::Config(format!(
                    "{name} must be at most {MAX_DURATION_SECS}, got: {value}"
                )));
            }
        }
        if self.oauth.max_pending == 0 {
            return Err(common::Error::Config(
                "oauth.max_pending must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.session.access_token_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.session_ttl_secs)
    }

    pub fn revoked_grace(&self) -> Duration {
        Duration::from_secs(self.session.revoked_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.oauth.state_ttl_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.provider_timeout_secs)
    }

    /// Google endpoints with any overrides applied.
    pub fn google_endpoints(&self) -> ProviderEndpoints {
        let defaults = ProviderEndpoints::google();
        let overrides = &self.oauth.google;
        ProviderEndpoints {
            authorize: overrides.authorize.clone().unwrap_or(defaults.authorize),
            token: overrides.token.clone().unwrap_or(defaults.token),
            userinfo: overrides.userinfo.clone().unwrap_or(defaults.userinfo),
        }
    }
}

fn parse_origin(key: &str, value: String) -> common::Result<String> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{key} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

fn parse_bool(key: &str, value: &str) -> common::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(common::Error::Config(format!(
            "{key} must be true or false, got: {other}"
        ))),
    }
}

fn parse_same_site(value: &str) -> common::Result<SameSite> {
    match value.to_ascii_lowercase().as_str() {
        "lax" => Ok(SameSite::Lax),
        "strict" => Ok(SameSite::Strict),
        "none" => Ok(SameSite::None),
        other => Err(common::Error::Config(format!(
            "COOKIE_SAME_SITE must be lax, strict or none, got: {other}"
        ))),
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> common::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Blank values count as
    /// missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> common::Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<String> = REQUIRED
            .iter()
            .filter(|key| get(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(common::Error::MissingEnv(missing));
        }
        let require = |key: &str| get(key).ok_or_else(|| common::Error::MissingEnv(vec![key.into()]));

        let store_uri = require("SESSION_STORE_URI")?;
        let store_backend = StoreBackend::parse(&store_uri)
            .map_err(|e| common::Error::Config(format!("SESSION_STORE_URI: {e}")))?;

        let host = get("LISTEN_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = match get("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| common::Error::Config(format!("PORT must be a port number, got: {p}")))?,
            None => 3000,
        };
        let listen_addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
            common::Error::Config(format!("invalid listen address {host}:{port}: {e}"))
        })?;

        let secure = match get("COOKIE_SECURE") {
            Some(v) => parse_bool("COOKIE_SECURE", &v)?,
            None => true,
        };
        let same_site = match get("COOKIE_SAME_SITE") {
            Some(v) => parse_same_site(&v)?,
            None => SameSite::Lax,
        };
        if same_site == SameSite::None && !secure {
            return Err(common::Error::Config(
                "COOKIE_SAME_SITE=none requires COOKIE_SECURE=true".into(),
            ));
        }

        let max_concurrent_requests = match get("MAX_CONCURRENT_REQUESTS") {
            Some(v) => v.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                common::Error::Config(format!(
                    "MAX_CONCURRENT_REQUESTS must be a positive integer, got: {v}"
                ))
            })?,
            None => 1000,
        };

        let tunables = match get("AUTH_CONFIG_PATH") {
            Some(path) => Tunables::load(Path::new(&path))?,
            None => Tunables::default(),
        };

        Ok(Self {
            app_name: get("APP_NAME").unwrap_or_else(|| "auth-backend".into()),
            listen_addr,
            api_domain: parse_origin("API_DOMAIN", require("API_DOMAIN")?)?,
            website_domain: parse_origin("WEBSITE_DOMAIN", require("WEBSITE_DOMAIN")?)?,
            store_backend,
            google: GoogleConfig {
                client_id: require("GOOGLE_CLIENT_ID")?,
                client_secret: Secret::new(require("GOOGLE_CLIENT_SECRET")?),
            },
            signing_keys: get("SESSION_SIGNING_KEYS").map(Secret::new),
            cookies: CookieSettings {
                secure,
                same_site,
                domain: get("COOKIE_DOMAIN"),
            },
            max_concurrent_requests,
            tunables,
        })
    }

    /// Provider callbacks land on `{api_domain}/auth/callback/{provider}`.
    pub fn callback_base(&self) -> String {
        format!("{}/auth/callback", self.api_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serializes tests that mutate the process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn base_env() -> HashMap<&'static str, String> {
        HashMap::from([
            ("SESSION_STORE_URI", "memory://".to_string()),
            ("API_DOMAIN", "http://localhost:3001".to_string()),
            ("WEBSITE_DOMAIN", "http://localhost:3000".to_string()),
            ("GOOGLE_CLIENT_ID", "client-id".to_string()),
            ("GOOGLE_CLIENT_SECRET", "client-secret".to_string()),
        ])
    }

    fn load(env: &HashMap<&'static str, String>) -> common::Result<AppConfig> {
        AppConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn minimal_env_uses_defaults() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.app_name, "auth-backend");
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(config.cookies.secure);
        assert_eq!(config.cookies.same_site, SameSite::Lax);
        assert!(config.cookies.domain.is_none());
        assert!(config.signing_keys.is_none());
        assert_eq!(config.max_concurrent_requests, 1000);
        assert_eq!(config.tunables.access_token_ttl(), Duration::from_secs(3600));
        assert_eq!(config.tunables.provider_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.callback_base(),
            "http://localhost:3001/auth/callback"
        );
    }

    #[test]
    fn every_missing_key_is_reported() {
        let err = load(&HashMap::new()).unwrap_err();
        match err {
            common::Error::MissingEnv(keys) => assert_eq!(keys, REQUIRED.to_vec()),
            other => panic!("expected MissingEnv, got {other:?}"),
        }
    }

    #[test]
    fn missing_client_id_is_the_only_key_reported() {
        let mut env = base_env();
        env.remove("GOOGLE_CLIENT_ID");
        match load(&env).unwrap_err() {
            common::Error::MissingEnv(keys) => assert_eq!(keys, vec!["GOOGLE_CLIENT_ID"]),
            other => panic!("expected MissingEnv, got {other:?}"),
        }
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let mut env = base_env();
        env.insert("API_DOMAIN", "   ".into());
        assert!(matches!(load(&env), Err(common::Error::MissingEnv(k)) if k == ["API_DOMAIN"]));
    }

    #[test]
    fn domains_must_be_http_origins() {
        let mut env = base_env();
        env.insert("WEBSITE_DOMAIN", "example.com".into());
        assert!(matches!(load(&env), Err(common::Error::Config(_))));
    }

    #[test]
    fn trailing_slash_is_trimmed_from_origins() {
        let mut env = base_env();
        env.insert("WEBSITE_DOMAIN", "https://app.example.com/".into());
        let config = load(&env).unwrap();
        assert_eq!(config.website_domain, "https://app.example.com");
    }

    #[test]
    fn same_site_none_requires_secure() {
        let mut env = base_env();
        env.insert("COOKIE_SAME_SITE", "none".into());
        env.insert("COOKIE_SECURE", "false".into());
        assert!(matches!(load(&env), Err(common::Error::Config(_))));

        env.insert("COOKIE_SECURE", "true".into());
        assert_eq!(load(&env).unwrap().cookies.same_site, SameSite::None);
    }

    #[test]
    fn bad_store_uri_is_config_error() {
        let mut env = base_env();
        env.insert("SESSION_STORE_URI", "redis://localhost".into());
        assert!(matches!(load(&env), Err(common::Error::Config(_))));
    }

    #[test]
    fn port_and_host_are_parsed() {
        let mut env = base_env();
        env.insert("PORT", "8081".into());
        env.insert("LISTEN_HOST", "127.0.0.1".into());
        assert_eq!(
            load(&env).unwrap().listen_addr,
            "127.0.0.1:8081".parse().unwrap()
        );

        env.insert("PORT", "eighty".into());
        assert!(matches!(load(&env), Err(common::Error::Config(_))));
    }

    #[test]
    fn tunables_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.toml");
        std::fs::write(
            &path,
            r#"
[session]
access_token_ttl_secs = 900
sweep_interval_secs = 5

[oauth]
provider_timeout_secs = 3

[oauth.google]
token = "http://127.0.0.1:9999/token"
"#,
        )
        .unwrap();

        let mut env = base_env();
        env.insert("AUTH_CONFIG_PATH", path.display().to_string());
        let config = load(&env).unwrap();

        assert_eq!(config.tunables.access_token_ttl(), Duration::from_secs(900));
        assert_eq!(config.tunables.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.tunables.provider_timeout(), Duration::from_secs(3));
        // Untouched values keep their defaults
        assert_eq!(config.tunables.state_ttl(), Duration::from_secs(600));

        let endpoints = config.tunables.google_endpoints();
        assert_eq!(endpoints.token, "http://127.0.0.1:9999/token");
        assert_eq!(endpoints.authorize, ProviderEndpoints::google().authorize);
    }

    #[test]
    fn zero_ttl_in_tunables_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.toml");
        std::fs::write(&path, "[session]\nsession_ttl_secs = 0\n").unwrap();
        assert!(matches!(Tunables::load(&path), Err(common::Error::Config(_))));
    }

    #[test]
    fn oversized_ttl_in_tunables_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.toml");
        std::fs::write(
            &path,
            format!("[session]\nsession_ttl_secs = {}\n", u64::MAX / 1000),
        )
        .unwrap();
        assert!(matches!(Tunables::load(&path), Err(common::Error::Config(_))));

        std::fs::write(&path, "[oauth]\nmax_pending = 0\n").unwrap();
        assert!(matches!(Tunables::load(&path), Err(common::Error::Config(_))));

        std::fs::write(&path, "[oauth]\nmax_pending = 50\n").unwrap();
        assert_eq!(Tunables::load(&path).unwrap().oauth.max_pending, 50);
    }

    #[test]
    fn unknown_tunable_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.toml");
        std::fs::write(&path, "[session]\naccess_ttl = 5\n").unwrap();
        assert!(matches!(Tunables::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn from_env_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        for (key, value) in base_env() {
            unsafe { set_env(key, &value) };
        }
        unsafe { set_env("SESSION_SIGNING_KEYS", "k1:0123456789abcdef0123456789abcdef") };

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.google.client_id, "client-id");
        assert_eq!(config.google.client_secret.expose(), "client-secret");
        assert!(config.signing_keys.is_some());

        for key in base_env().keys() {
            unsafe { remove_env(key) };
        }
        unsafe { remove_env("SESSION_SIGNING_KEYS") };
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let config = load(&base_env()).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("client-secret"));
    }
}
