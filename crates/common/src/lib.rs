//! Types shared by the session and sign-in crates

pub mod clock;
mod error;
mod secret;
pub mod snapshot;

pub use clock::now_millis;
pub use error::{Error, Result};
pub use secret::Secret;
