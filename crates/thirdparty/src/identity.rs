//! External identities and their stable internal user ids
//!
//! The first sign-in with a `(provider, subject)` pair creates a user record
//! with a fresh UUID. Later sign-ins with the same pair get the same user id;
//! records are never rewritten, even if the provider reports a new email.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;

const USERS_FILE: &str = "users.json";

/// Profile produced by a provider after a successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalIdentity {
    pub provider_id: String,
    /// Provider-side subject identifier
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: bool,
    /// Full profile JSON as returned by the provider
    pub raw_profile: serde_json::Value,
}

/// Association of one external identity with an internal user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub provider_id: String,
    pub subject: String,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: u64,
}

fn key(provider_id: &str, subject: &str) -> String {
    format!("{provider_id}|{subject}")
}

/// `(provider, subject) → user` directory.
pub struct IdentityDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
    snapshot_path: Option<PathBuf>,
}

impl IdentityDirectory {
    pub fn in_memory() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Load the directory from `<dir>/users.json`, or start empty.
    pub async fn open(dir: Option<PathBuf>) -> Result<Self> {
        let Some(dir) = dir else {
            return Ok(Self::in_memory());
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(common::Error::from)?;
        let path = dir.join(USERS_FILE);

        let records: Vec<UserRecord> = common::snapshot::read(&path).await?.unwrap_or_default();
        info!(path = %path.display(), users = records.len(), "user directory loaded");

        let users = records
            .into_iter()
            .map(|r| (key(&r.provider_id, &r.subject), r))
            .collect();
        Ok(Self {
            users: RwLock::new(users),
            snapshot_path: Some(path),
        })
    }

    /// Map `identity` to its user, creating the user on first sight.
    ///
    /// Returns the record and whether it was created by this call.
    pub async fn resolve(&self, identity: &ExternalIdentity) -> Result<(UserRecord, bool)> {
        let key = key(&identity.provider_id, &identity.subject);

        if let Some(existing) = self.users.read().await.get(&key) {
            return Ok((existing.clone(), false));
        }

        let mut users = self.users.write().await;
        // Another sign-in for the same identity may have won the race
        if let Some(existing) = users.get(&key) {
            return Ok((existing.clone(), false));
        }

        let record = UserRecord {
            user_id: uuid::Uuid::new_v4().to_string(),
            provider_id: identity.provider_id.clone(),
            subject: identity.subject.clone(),
            email: identity.email.clone(),
            created_at: common::now_millis(),
        };
        users.insert(key, record.clone());
        info!(
            user_id = %record.user_id,
            provider = %record.provider_id,
            "new user created"
        );

        if let Some(path) = &self.snapshot_path {
            let records: Vec<&UserRecord> = users.values().collect();
            common::snapshot::write_atomic(path, &records).await?;
        }

        Ok((record, true))
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
