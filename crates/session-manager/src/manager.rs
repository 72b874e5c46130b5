//! The session manager
//!
//! Holds the immutable pieces built at startup (codec keys, settings) and the
//! shared stores, and exposes the four session operations: sign in,
//! authenticate, refresh, sign out.

use std::time::Duration;

use session::{
    RefreshCredential, RefreshTokenRecord, Session, SessionMetadata, SessionStore, TokenCodec,
};
use thirdparty::{
    ExchangeEngine, ExchangePhase, ExternalIdentity, IdentityDirectory, Initiated, UserRecord,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub access_token_ttl: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::from_secs(3600),
        }
    }
}

/// Who is calling, as established by a validated access credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub session_handle: String,
}

/// Outcome of a successful sign-in.
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub session: Session,
    pub user: UserRecord,
    pub created_new_user: bool,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: RefreshTokenRecord,
}

impl SignedIn {
    /// Refresh credential in its client-held form.
    pub fn refresh_credential(&self) -> String {
        self.refresh_token.credential().to_string()
    }
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone)]
pub struct Refreshed {
    pub context: AuthContext,
    pub access_token: String,
    pub refresh_token: RefreshTokenRecord,
}

impl Refreshed {
    pub fn refresh_credential(&self) -> String {
        self.refresh_token.credential().to_string()
    }
}

/// What one sweep pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub sign_in_attempts: usize,
}

pub struct SessionManager {
    codec: TokenCodec,
    store: SessionStore,
    directory: IdentityDirectory,
    exchange: ExchangeEngine,
    settings: ManagerSettings,
}

/// Log why a credential was refused and collapse it to `Unauthenticated`.
fn reject(reason: session::Error) -> Error {
    match reason {
        session::Error::TokenReused => {
            warn!(
                security_event = "refresh_token_reuse",
                "refresh token replay detected, session revoked"
            );
            metrics::counter!("auth_security_events_total", "kind" => "refresh_token_reuse")
                .increment(1);
        }
        session::Error::InvalidSignature => {
            debug!(reason = %reason, "credential rejected");
            metrics::counter!("auth_security_events_total", "kind" => "invalid_signature")
                .increment(1);
        }
        other => debug!(reason = %other, "credential rejected"),
    }
    Error::Unauthenticated
}

impl SessionManager {
    pub fn new(
        codec: TokenCodec,
        store: SessionStore,
        directory: IdentityDirectory,
        exchange: ExchangeEngine,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            codec,
            store,
            directory,
            exchange,
            settings,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Start a third-party sign-in.
    pub async fn initiate_sign_in(&self, provider_id: &str) -> Result<Initiated> {
        Ok(self.exchange.initiate(provider_id).await?)
    }

    /// Finish a third-party sign-in from the provider callback.
    pub async fn complete_sign_in(
        &self,
        provider_id: &str,
        code: &str,
        state: &str,
        metadata: SessionMetadata,
    ) -> Result<SignedIn> {
        let identity = match self.exchange.complete(provider_id, code, state).await {
            Ok(identity) => identity,
            Err(e) => {
                let outcome = if e.is_retryable() { "unavailable" } else { "rejected" };
                metrics::counter!(
                    "auth_sign_ins_total",
                    "provider" => provider_id.to_string(),
                    "outcome" => outcome
                )
                .increment(1);
                return Err(e.into());
            }
        };
        self.sign_in(&identity, metadata).await
    }

    /// Create a session for a verified external identity.
    pub async fn sign_in(
        &self,
        identity: &ExternalIdentity,
        metadata: SessionMetadata,
    ) -> Result<SignedIn> {
        let (user, created_new_user) = self
            .directory
            .resolve(identity)
            .await
            .map_err(|e| Error::Internal(format!("resolving user: {e}")))?;
        debug!(
            user_id = %user.user_id,
            created_new_user,
            phase = ExchangePhase::Resolved.label(),
            "identity resolved"
        );

        let (session, refresh_token) = self.store.create(&user.user_id, metadata).await;
        let access_token = self.issue_access(&session)?;

        metrics::counter!(
            "auth_sign_ins_total",
            "provider" => identity.provider_id.clone(),
            "outcome" => "success"
        )
        .increment(1);
        info!(
            user_id = %user.user_id,
            session_handle = %session.handle,
            provider = %identity.provider_id,
            "signed in"
        );

        Ok(SignedIn {
            session,
            user,
            created_new_user,
            email: identity.email.clone(),
            access_token,
            refresh_token,
        })
    }

    /// Access tokens never outlive their session.
    fn issue_access(&self, session: &Session) -> Result<String> {
        let expires_at =
            common::clock::deadline(session::now_millis(), self.settings.access_token_ttl)
                .min(session.expires_at);
        self.codec
            .issue(&session.user_id, &session.handle, expires_at)
            .map_err(|e| Error::Internal(format!("issuing access token: {e}")))
    }

    /// Validate an access credential and check its session is still live.
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthContext> {
        let claims = self.codec.verify(access_token).map_err(reject)?;
        let session = self
            .store
            .lookup(&claims.session_handle)
            .await
            .map_err(reject)?;

        if session.revoked {
            return Err(reject(session::Error::Revoked));
        }
        if !session.is_live(session::now_millis()) {
            return Err(reject(session::Error::Expired));
        }
        if session.user_id != claims.user_id {
            warn!(
                session_handle = %session.handle,
                "access token user does not match session owner"
            );
            return Err(Error::Unauthenticated);
        }

        Ok(AuthContext {
            user_id: session.user_id,
            session_handle: session.handle,
        })
    }

    /// Validate the access credential, rotating the refresh credential when
    /// the access credential has expired and a refresh credential is present.
    pub async fn authenticate_or_refresh(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<(AuthContext, Option<Refreshed>)> {
        let Some(access_token) = access_token else {
            debug!("no access credential presented");
            return Err(Error::Unauthenticated);
        };

        match self.codec.verify(access_token) {
            Err(session::Error::Expired) => {
                let Some(refresh_token) = refresh_token else {
                    return Err(reject(session::Error::Expired));
                };
                debug!("access credential expired, refreshing");
                let refreshed = self.refresh(refresh_token).await?;
                Ok((refreshed.context.clone(), Some(refreshed)))
            }
            Err(other) => Err(reject(other)),
            Ok(_) => Ok((self.authenticate(access_token).await?, None)),
        }
    }

    /// Exchange a refresh credential for a new access and refresh credential.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Refreshed> {
        let result = self.try_refresh(refresh_token).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(_) => "rejected",
        };
        metrics::counter!("auth_refresh_total", "outcome" => outcome).increment(1);
        result
    }

    async fn try_refresh(&self, refresh_token: &str) -> Result<Refreshed> {
        let presented = RefreshCredential::parse(refresh_token).map_err(reject)?;
        let next = self
            .store
            .rotate_refresh_token(&presented.session_handle, &presented.token_id)
            .await
            .map_err(reject)?;
        let session = self
            .store
            .lookup(&presented.session_handle)
            .await
            .map_err(reject)?;
        let access_token = self.issue_access(&session)?;

        debug!(session_handle = %session.handle, "session refreshed");
        Ok(Refreshed {
            context: AuthContext {
                user_id: session.user_id,
                session_handle: session.handle,
            },
            access_token,
            refresh_token: next,
        })
    }

    /// Revoke a session. Safe to call repeatedly.
    pub async fn sign_out(&self, session_handle: &str) {
        if self.store.revoke(session_handle).await {
            info!(session_handle, "signed out");
        } else {
            debug!(session_handle, "sign-out of inactive session");
        }
    }

    /// One sweep pass over sessions and pending sign-in attempts.
    pub async fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            sessions: self.store.sweep_expired().await,
            sign_in_attempts: self.exchange.sweep_expired().await,
        };
        metrics::counter!("auth_sessions_swept_total").increment(report.sessions as u64);
        report
    }

    /// Persist the session store snapshot (file-backed stores only).
    pub async fn save(&self) -> Result<()> {
        self.store
            .save()
            .await
            .map_err(|e| Error::Internal(format!("saving session snapshot: {e}")))
    }
}
