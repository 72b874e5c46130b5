//! Authorization-code exchange engine
//!
//! One sign-in attempt moves through these phases, never backwards:
//!
//! - `Initiated`: state + PKCE verifier stored with a TTL, URL returned
//! - `CallbackReceived`: `(code, state)` matched against the stored state,
//!   which is consumed whether or not the rest succeeds
//! - `TokenExchanged`: provider token endpoint returned an access token
//! - `IdentityFetched`: provider profile turned into an `ExternalIdentity`
//! - `Resolved`: identity mapped to a user (done by the caller via
//!   `IdentityDirectory`)
//!
//! Abandoned attempts are removed by `sweep_expired()` once their TTL passes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::identity::ExternalIdentity;
use crate::pkce;
use crate::provider::Provider;

/// Phase of a sign-in attempt, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Initiated,
    CallbackReceived,
    TokenExchanged,
    IdentityFetched,
    Resolved,
}

impl ExchangePhase {
    pub fn label(&self) -> &'static str {
        match self {
            ExchangePhase::Initiated => "initiated",
            ExchangePhase::CallbackReceived => "callback_received",
            ExchangePhase::TokenExchanged => "token_exchanged",
            ExchangePhase::IdentityFetched => "identity_fetched",
            ExchangePhase::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    /// Lifetime of a pending sign-in attempt
    pub state_ttl: Duration,
    /// Upper bound on each provider call
    pub provider_timeout: Duration,
    /// Most attempts kept at once; further `initiate` calls fail until
    /// callbacks or the sweep free a slot
    pub max_pending: usize,
    /// Callback URL prefix; the provider id is appended, e.g.
    /// `https://api.example.com/auth/callback` + `/google`
    pub callback_base: String,
}

impl ExchangeSettings {
    pub fn redirect_uri(&self, provider_id: &str) -> String {
        format!("{}/{provider_id}", self.callback_base.trim_end_matches('/'))
    }
}

/// Result of starting a sign-in.
#[derive(Debug, Clone)]
pub struct Initiated {
    pub state: String,
    pub authorization_url: String,
}

/// Server-side record of a started sign-in.
struct PendingExchange {
    provider_id: String,
    verifier: String,
    expires_at: u64,
}

pub struct ExchangeEngine {
    providers: HashMap<String, Arc<dyn Provider>>,
    pending: Mutex<HashMap<String, PendingExchange>>,
    client: reqwest::Client,
    settings: ExchangeSettings,
}

impl ExchangeEngine {
    pub fn new(client: reqwest::Client, settings: ExchangeSettings) -> Self {
        Self {
            providers: HashMap::new(),
            pending: Mutex::new(HashMap::new()),
            client,
            settings,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    fn provider(&self, provider_id: &str) -> Result<&Arc<dyn Provider>> {
        self.providers
            .get(provider_id)
            .ok_or_else(|| Error::UnknownProvider(provider_id.to_string()))
    }

    /// Start a sign-in with `provider_id`.
    pub async fn initiate(&self, provider_id: &str) -> Result<Initiated> {
        self.initiate_at(provider_id, common::now_millis()).await
    }

    pub async fn initiate_at(&self, provider_id: &str, now_millis: u64) -> Result<Initiated> {
        let provider = self.provider(provider_id)?;

        let state = pkce::generate_state();
        let verifier = pkce::generate_verifier();
        let challenge = pkce::compute_challenge(&verifier);
        let redirect_uri = self.settings.redirect_uri(provider_id);
        let authorization_url = provider.authorization_url(&state, &challenge, &redirect_uri)?;

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.settings.max_pending {
            pending.retain(|_, p| now_millis < p.expires_at);
            if pending.len() >= self.settings.max_pending {
                warn!(
                    provider = provider_id,
                    max_pending = self.settings.max_pending,
                    "too many sign-in attempts in flight"
                );
                return Err(Error::ProviderUnavailable(
                    "too many sign-in attempts in flight".into(),
                ));
            }
        }
        pending.insert(
            state.clone(),
            PendingExchange {
                provider_id: provider_id.to_string(),
                verifier,
                expires_at: common::clock::deadline(now_millis, self.settings.state_ttl),
            },
        );
        drop(pending);

        info!(
            provider = provider_id,
            phase = ExchangePhase::Initiated.label(),
            "sign-in initiated"
        );
        Ok(Initiated {
            state,
            authorization_url,
        })
    }

    pub async fn complete(
        &self,
        provider_id: &str,
        code: &str,
        state: &str,
    ) -> Result<ExternalIdentity> {
        self.complete_at(provider_id, code, state, common::now_millis())
            .await
    }

    /// Finish a sign-in from the provider callback.
    ///
    /// The stored state is removed before any network call, so a second
    /// callback with the same state fails with `InvalidState` no matter how
    /// the first one ended.
    #[instrument(skip_all, fields(provider = provider_id))]
    pub async fn complete_at(
        &self,
        provider_id: &str,
        code: &str,
        state: &str,
        now_millis: u64,
    ) -> Result<ExternalIdentity> {
        let provider = self.provider(provider_id)?.clone();

        let pending = self
            .pending
            .lock()
            .await
            .remove(state)
            .ok_or_else(|| Error::InvalidState("unknown or already used state".into()))?;

        if pending.provider_id != provider_id {
            warn!(
                expected = %pending.provider_id,
                "callback state belongs to a different provider"
            );
            return Err(Error::InvalidState("state issued for another provider".into()));
        }
        if now_millis >= pending.expires_at {
            return Err(Error::InvalidState("sign-in attempt expired".into()));
        }
        if code.is_empty() {
            return Err(Error::ProviderRejected("callback carried no code".into()));
        }
        debug!(phase = ExchangePhase::CallbackReceived.label(), "state matched");

        let redirect_uri = self.settings.redirect_uri(provider_id);
        let tokens = self
            .bounded(
                "token exchange",
                provider.exchange_code(&self.client, code, &pending.verifier, &redirect_uri),
            )
            .await?;
        debug!(phase = ExchangePhase::TokenExchanged.label(), "provider token received");

        let identity = self
            .bounded("user info", provider.fetch_identity(&self.client, &tokens))
            .await?;
        info!(
            phase = ExchangePhase::IdentityFetched.label(),
            email_verified = identity.email_verified,
            "provider identity fetched"
        );
        Ok(identity)
    }

    /// Run a provider call under the configured timeout.
    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    what,
                    timeout_ms = common::clock::millis(self.settings.provider_timeout),
                    "provider call timed out"
                );
                Err(Error::ProviderUnavailable(format!("{what} timed out")))
            }
        }
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(common::now_millis()).await
    }

    /// Drop pending attempts whose TTL has passed.
    pub async fn sweep_expired_at(&self, now_millis: u64) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| now_millis < p.expires_at);
        let removed = before - pending.len();
        if removed > 0 {
            debug!(removed, "swept expired sign-in attempts");
        }
        removed
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderFuture, ProviderTokens};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider double that records exchanges and can stall.
    struct FakeProvider {
        id: &'static str,
        exchanges: AtomicUsize,
        stall: Option<Duration>,
    }

    impl FakeProvider {
        fn new(id: &'static str) -> Self {
            Self {
                id,
                exchanges: AtomicUsize::new(0),
                stall: None,
            }
        }
    }

    impl Provider for FakeProvider {
        fn id(&self) -> &str {
            self.id
        }

        fn authorization_url(&self, state: &str, challenge: &str, redirect_uri: &str) -> Result<String> {
            Ok(format!(
                "https://idp.test/authorize?state={state}&code_challenge={challenge}&redirect_uri={redirect_uri}"
            ))
        }

        fn exchange_code<'a>(
            &'a self,
            _client: &'a reqwest::Client,
            code: &'a str,
            verifier: &'a str,
            _redirect_uri: &'a str,
        ) -> ProviderFuture<'a, ProviderTokens> {
            Box::pin(async move {
                self.exchanges.fetch_add(1, Ordering::SeqCst);
                if let Some(stall) = self.stall {
                    tokio::time::sleep(stall).await;
                }
                assert_eq!(verifier.len(), 86);
                Ok(ProviderTokens {
                    access_token: format!("at-for-{code}"),
                    token_type: None,
                    expires_in: None,
                    id_token: None,
                    scope: None,
                })
            })
        }

        fn fetch_identity<'a>(
            &'a self,
            _client: &'a reqwest::Client,
            tokens: &'a ProviderTokens,
        ) -> ProviderFuture<'a, ExternalIdentity> {
            Box::pin(async move {
                Ok(ExternalIdentity {
                    provider_id: self.id.to_string(),
                    subject: tokens.access_token.clone(),
                    email: Some("user@example.com".into()),
                    email_verified: true,
                    raw_profile: serde_json::Value::Null,
                })
            })
        }
    }

    fn settings() -> ExchangeSettings {
        ExchangeSettings {
            state_ttl: Duration::from_secs(600),
            provider_timeout: Duration::from_secs(5),
            max_pending: 1_000,
            callback_base: "https://api.example.com/auth/callback/".into(),
        }
    }

    fn engine_with(provider: Arc<FakeProvider>) -> ExchangeEngine {
        ExchangeEngine::new(reqwest::Client::new(), settings()).with_provider(provider)
    }

    #[test]
    fn redirect_uri_joins_provider_id() {
        assert_eq!(
            settings().redirect_uri("google"),
            "https://api.example.com/auth/callback/google"
        );
    }

    #[tokio::test]
    async fn initiate_then_complete_yields_identity() {
        let fake = Arc::new(FakeProvider::new("fake"));
        let engine = engine_with(fake.clone());

        let started = engine.initiate("fake").await.unwrap();
        assert!(started.authorization_url.contains(&started.state));
        assert!(
            started
                .authorization_url
                .contains("redirect_uri=https://api.example.com/auth/callback/fake")
        );
        assert_eq!(engine.pending_count().await, 1);

        let identity = engine.complete("fake", "code-1", &started.state).await.unwrap();
        assert_eq!(identity.subject, "at-for-code-1");
        assert_eq!(fake.exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn replayed_state_is_invalid() {
        let fake = Arc::new(FakeProvider::new("fake"));
        let engine = engine_with(fake.clone());

        let started = engine.initiate("fake").await.unwrap();
        engine.complete("fake", "code-1", &started.state).await.unwrap();

        let replay = engine.complete("fake", "code-1", &started.state).await;
        assert!(matches!(replay, Err(Error::InvalidState(_))));
        assert_eq!(fake.exchanges.load(Ordering::SeqCst), 1, "replay must not reach provider");
    }

    #[tokio::test]
    async fn unknown_state_is_invalid() {
        let engine = engine_with(Arc::new(FakeProvider::new("fake")));
        let result = engine.complete("fake", "code", "never-issued").await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn expired_state_is_invalid_and_consumed() {
        let engine = engine_with(Arc::new(FakeProvider::new("fake")));
        let started = engine.initiate_at("fake", 0).await.unwrap();

        let late = engine
            .complete_at("fake", "code", &started.state, 600_000)
            .await;
        assert!(matches!(late, Err(Error::InvalidState(_))));
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn state_from_other_provider_is_invalid() {
        let engine = ExchangeEngine::new(reqwest::Client::new(), settings())
            .with_provider(Arc::new(FakeProvider::new("one")))
            .with_provider(Arc::new(FakeProvider::new("two")));

        let started = engine.initiate("one").await.unwrap();
        let result = engine.complete("two", "code", &started.state).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let engine = engine_with(Arc::new(FakeProvider::new("fake")));
        assert!(matches!(
            engine.initiate("github").await,
            Err(Error::UnknownProvider(_))
        ));
        assert!(matches!(
            engine.complete("github", "c", "s").await,
            Err(Error::UnknownProvider(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_provider_times_out_as_unavailable() {
        let fake = Arc::new(FakeProvider {
            id: "slow",
            exchanges: AtomicUsize::new(0),
            stall: Some(Duration::from_secs(60)),
        });
        let engine = engine_with(fake);

        let started = engine.initiate("slow").await.unwrap();
        let result = engine.complete("slow", "code", &started.state).await;
        match result {
            Err(e @ Error::ProviderUnavailable(_)) => assert!(e.is_retryable()),
            other => panic!("expected ProviderUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_attempts() {
        let engine = engine_with(Arc::new(FakeProvider::new("fake")));
        engine.initiate_at("fake", 0).await.unwrap();
        engine.initiate_at("fake", 500_000).await.unwrap();

        assert_eq!(engine.sweep_expired_at(599_999).await, 0);
        assert_eq!(engine.sweep_expired_at(600_000).await, 1);
        assert_eq!(engine.pending_count().await, 1);
    }

    #[tokio::test]
    async fn pending_attempts_are_capped() {
        let engine = ExchangeEngine::new(
            reqwest::Client::new(),
            ExchangeSettings {
                max_pending: 3,
                ..settings()
            },
        )
        .with_provider(Arc::new(FakeProvider::new("fake")));

        for _ in 0..3 {
            engine.initiate_at("fake", 0).await.unwrap();
        }
        for _ in 0..100 {
            let result = engine.initiate_at("fake", 1_000).await;
            match result {
                Err(e @ Error::ProviderUnavailable(_)) => assert!(e.is_retryable()),
                other => panic!("expected ProviderUnavailable, got {other:?}"),
            }
        }
        assert_eq!(engine.pending_count().await, 3);
    }

    #[tokio::test]
    async fn full_map_makes_room_by_dropping_expired_attempts() {
        let engine = ExchangeEngine::new(
            reqwest::Client::new(),
            ExchangeSettings {
                max_pending: 2,
                ..settings()
            },
        )
        .with_provider(Arc::new(FakeProvider::new("fake")));

        engine.initiate_at("fake", 0).await.unwrap();
        engine.initiate_at("fake", 300_000).await.unwrap();

        // The first attempt has expired by now; the second has not
        let fresh = engine.initiate_at("fake", 600_000).await.unwrap();
        assert_eq!(engine.pending_count().await, 2);
        assert!(engine.complete_at("fake", "c", &fresh.state, 600_001).await.is_ok());
    }
}
