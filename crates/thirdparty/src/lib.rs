//! Third-party sign-in: OAuth authorization-code exchange with PKCE
//!
//! Sign-in flow:
//! 1. `ExchangeEngine::initiate()` stores state + PKCE verifier, returns the
//!    provider authorization URL
//! 2. The provider redirects back with `code` and `state`
//! 3. `ExchangeEngine::complete()` consumes the state, exchanges the code at
//!    the provider token endpoint and fetches the user profile
//! 4. `IdentityDirectory::resolve()` maps `(provider, subject)` to a stable
//!    internal user id
//!
//! No step retries on its own. On any error the caller starts over at 1.

pub mod error;
pub mod exchange;
pub mod google;
pub mod identity;
pub mod pkce;
pub mod provider;

pub use error::{Error, Result};
pub use exchange::{ExchangeEngine, ExchangePhase, ExchangeSettings, Initiated};
pub use google::GoogleProvider;
pub use identity::{ExternalIdentity, IdentityDirectory, UserRecord};
pub use provider::{Provider, ProviderEndpoints, ProviderTokens};
