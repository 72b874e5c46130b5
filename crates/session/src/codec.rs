//! Signed access tokens
//!
//! Wire format: `v1.<kid>.<payload>.<signature>` where `payload` is URL-safe
//! base64 of the JSON claims and `signature` is URL-safe base64 of
//! `HMAC-SHA256(key[kid], "v1.<kid>.<payload>")`.
//!
//! Tokens are signed with the current key only. Verification accepts the
//! current key and any key still listed as accepted, which lets operators
//! rotate keys without logging everyone out: add the new key in front, keep
//! the old one until its tokens have expired, then drop it.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const VERSION: &str = "v1";

/// Shortest secret accepted for a signing key.
const MIN_SECRET_LEN: usize = 32;

/// Claims carried by an access token. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "sub")]
    pub user_id: String,
    #[serde(rename = "sid")]
    pub session_handle: String,
    #[serde(rename = "exp")]
    pub expires_at: u64,
    #[serde(rename = "iat")]
    pub issued_at: u64,
}

/// A named HMAC key.
#[derive(Clone)]
pub struct SigningKey {
    id: String,
    secret: Secret<String>,
}

impl SigningKey {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let secret = Secret::new(secret.into());
        if id.is_empty() || id.contains(['.', ':', ',']) {
            return Err(Error::InvalidKey(format!(
                "key id {id:?} must be non-empty and free of '.', ':' and ','"
            )));
        }
        if secret.expose().len() < MIN_SECRET_LEN {
            return Err(Error::InvalidKey(format!(
                "key {id} must be at least {MIN_SECRET_LEN} characters"
            )));
        }
        Ok(Self { id, secret })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"))
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("secret", &self.secret)
            .finish()
    }
}

/// The current signing key plus keys still accepted for verification.
#[derive(Debug, Clone)]
pub struct KeySet {
    current: SigningKey,
    accepted: Vec<SigningKey>,
}

impl KeySet {
    pub fn new(current: SigningKey) -> Self {
        Self {
            current,
            accepted: Vec::new(),
        }
    }

    /// Keep verifying tokens signed with `key` without signing new ones.
    pub fn accept(mut self, key: SigningKey) -> Self {
        self.accepted.push(key);
        self
    }

    /// Random single-key set. Tokens do not survive a restart.
    pub fn ephemeral() -> Self {
        let secret = format!("{}{}", crate::ids::random_id(), crate::ids::random_id());
        let key = SigningKey {
            id: "ephemeral".into(),
            secret: Secret::new(secret),
        };
        Self::new(key)
    }

    /// Parse `kid:secret[,kid:secret...]`. The first entry signs.
    pub fn parse(list: &str) -> Result<Self> {
        let mut keys = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (id, secret) = entry.split_once(':').ok_or_else(|| {
                    Error::InvalidKey("expected kid:secret entries separated by commas".into())
                })?;
                SigningKey::new(id.trim(), secret.trim())
            });

        let current = keys
            .next()
            .ok_or_else(|| Error::InvalidKey("no signing keys given".into()))??;
        let mut set = KeySet::new(current);
        for key in keys {
            let key = key?;
            if set.find(key.id()).is_some() {
                return Err(Error::InvalidKey(format!("duplicate key id {}", key.id())));
            }
            set = set.accept(key);
        }
        Ok(set)
    }

    pub fn current_id(&self) -> &str {
        self.current.id()
    }

    fn find(&self, id: &str) -> Option<&SigningKey> {
        std::iter::once(&self.current)
            .chain(self.accepted.iter())
            .find(|k| k.id == id)
    }
}

/// Issues and verifies access tokens. Pure over its key material.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    keys: KeySet,
}

impl TokenCodec {
    pub fn new(keys: KeySet) -> Self {
        Self { keys }
    }

    /// Sign an access token for `session_handle` valid until `expires_at` (unix ms).
    pub fn issue(&self, user_id: &str, session_handle: &str, expires_at: u64) -> Result<String> {
        let claims = Claims {
            user_id: user_id.to_string(),
            session_handle: session_handle.to_string(),
            expires_at,
            issued_at: crate::now_millis(),
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| Error::Malformed(format!("encoding claims: {e}")))?;
        let signed_part = format!(
            "{VERSION}.{}.{}",
            self.keys.current.id,
            URL_SAFE_NO_PAD.encode(payload)
        );

        let mut mac = self.keys.current.mac();
        mac.update(signed_part.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signed_part}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        self.verify_at(token, crate::now_millis())
    }

    /// Verify against an explicit clock. The signature is checked before
    /// anything in the payload is trusted.
    pub fn verify_at(&self, token: &str, now_millis: u64) -> Result<Claims> {
        let (signed_part, signature_b64) = token
            .rsplit_once('.')
            .ok_or_else(|| Error::Malformed("missing signature".into()))?;

        let mut parts = signed_part.splitn(3, '.');
        let (Some(version), Some(kid), Some(payload_b64)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Malformed("expected four dot-separated parts".into()));
        };
        if version != VERSION {
            return Err(Error::Malformed(format!("unsupported token version {version}")));
        }

        let key = self.keys.find(kid).ok_or(Error::InvalidSignature)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| Error::InvalidSignature)?;
        let mut mac = key.mac();
        mac.update(signed_part.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::InvalidSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| Error::Malformed(format!("payload encoding: {e}")))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|e| Error::Malformed(format!("payload json: {e}")))?;

        if now_millis >= claims.expires_at {
            return Err(Error::Expired);
        }
        Ok(claims)
    }
}
