//! Session orchestration on top of the token codec, session store and
//! third-party sign-in
//!
//! - `SessionManager::complete_sign_in()` turns a provider callback into a
//!   session with access and refresh credentials
//! - `SessionManager::authenticate()` validates an access credential
//! - `SessionManager::refresh()` rotates a refresh credential
//! - `SessionManager::sign_out()` revokes
//! - `spawn_sweep_task()` removes expired sessions and sign-in attempts
//!
//! Every credential failure surfaces as `Error::Unauthenticated`. The precise
//! reason only reaches the logs.

pub mod error;
pub mod manager;
pub mod sweep;

pub use error::{Error, Result};
pub use manager::{AuthContext, ManagerSettings, Refreshed, SessionManager, SignedIn, SweepReport};
pub use sweep::spawn_sweep_task;
