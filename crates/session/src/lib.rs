//! Session core: signed access tokens and the server-side session store
//!
//! Lifecycle:
//! 1. `SessionStore::create()` allocates a handle and the first refresh token
//! 2. `TokenCodec::issue()` signs a short-lived access token for the handle
//! 3. Requests present the access token; `TokenCodec::verify()` checks it
//! 4. Expired access tokens are replaced by presenting the refresh token to
//!    `SessionStore::rotate_refresh_token()`, which consumes it exactly once
//! 5. `SessionStore::revoke()` on sign-out or replay; `sweep_expired()` cleans up

pub mod codec;
pub mod error;
mod ids;
pub mod store;

pub use codec::{Claims, KeySet, SigningKey, TokenCodec};
pub use error::{Error, Result};
pub use store::{
    RefreshCredential, RefreshTokenRecord, Session, SessionMetadata, SessionStore, StoreBackend,
    StoreSettings,
};

pub use common::now_millis;
