//! Server-side session records and refresh-token families
//!
//! Each session owns a family of refresh tokens. A refresh token can be
//! exchanged exactly once; exchanging it yields a child token in the same
//! family. Presenting an already-used token means two parties hold the same
//! family, so the whole session is revoked.
//!
//! Locking: the outer `RwLock` guards only the handle → entry map and is held
//! for map lookups and inserts. Every mutation of one session happens under
//! that session's own `Mutex`, which makes check-and-consume of a refresh
//! token atomic without serializing unrelated sessions.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::clock::{self, deadline};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ids::random_id;

const SESSIONS_FILE: &str = "sessions.json";

/// Consumed refresh tokens remembered per session for reuse detection.
/// Older ancestors are forgotten; presenting one yields `NotFound`.
const USED_TOKENS_KEPT: usize = 8;

/// Where session records live, parsed from `SESSION_STORE_URI`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// `memory://`: nothing survives a restart
    Memory,
    /// `file://<dir>`: in-memory with JSON snapshots in `<dir>`
    File(PathBuf),
}

impl StoreBackend {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri == "memory://" || uri == "memory:" {
            return Ok(Self::Memory);
        }
        if let Some(dir) = uri.strip_prefix("file://") {
            if dir.is_empty() {
                return Err(common::Error::Config("file:// store needs a directory".into()).into());
            }
            return Ok(Self::File(PathBuf::from(dir)));
        }
        Err(common::Error::Config(format!(
            "unsupported session store uri {uri:?} (expected memory:// or file://<dir>)"
        ))
        .into())
    }

    /// Path of a named snapshot file, for file-backed stores.
    pub fn snapshot_path(&self, file_name: &str) -> Option<PathBuf> {
        match self {
            Self::Memory => None,
            Self::File(dir) => Some(dir.join(file_name)),
        }
    }
}

/// Lifetimes applied by the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Session lifetime, extended on every successful refresh
    pub session_ttl: Duration,
    /// How long a revoked session lingers before the sweep removes it
    pub revoked_grace: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(100 * 24 * 60 * 60),
            revoked_grace: Duration::from_secs(60),
        }
    }
}

/// Client details captured at sign-in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// A server-side session. Times are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub handle: String,
    pub user_id: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub family_id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
}

impl Session {
    /// Not revoked and not past expiry.
    pub fn is_live(&self, now_millis: u64) -> bool {
        !self.revoked && now_millis < self.expires_at
    }
}

/// One member of a session's refresh-token family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub session_handle: String,
    pub parent: Option<String>,
    pub issued_at: u64,
    /// Flips false → true once and never back
    pub used: bool,
}

impl RefreshTokenRecord {
    /// The value handed to the client.
    pub fn credential(&self) -> RefreshCredential {
        RefreshCredential {
            session_handle: self.session_handle.clone(),
            token_id: self.token_id.clone(),
        }
    }
}

/// Client-held form of a refresh token: `<session_handle>.<token_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCredential {
    pub session_handle: String,
    pub token_id: String,
}

impl RefreshCredential {
    pub fn parse(value: &str) -> Result<Self> {
        let (handle, token_id) = value
            .split_once('.')
            .ok_or_else(|| Error::Malformed("refresh token must be <handle>.<id>".into()))?;
        if handle.is_empty() || token_id.is_empty() || token_id.contains('.') {
            return Err(Error::Malformed("refresh token must be <handle>.<id>".into()));
        }
        Ok(Self {
            session_handle: handle.to_string(),
            token_id: token_id.to_string(),
        })
    }
}

impl std::fmt::Display for RefreshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.session_handle, self.token_id)
    }
}

/// A session together with its refresh-token family. Also the snapshot format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionEntry {
    session: Session,
    tokens: HashMap<String, RefreshTokenRecord>,
}

/// Concurrent session store.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    settings: StoreSettings,
    snapshot_path: Option<PathBuf>,
}

impl SessionStore {
    pub fn in_memory(settings: StoreSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            snapshot_path: None,
        }
    }

    /// Open the store for `backend`, loading the last snapshot when file-backed.
    pub async fn open(backend: &StoreBackend, settings: StoreSettings) -> Result<Self> {
        let Some(path) = backend.snapshot_path(SESSIONS_FILE) else {
            info!("session store: in-memory");
            return Ok(Self::in_memory(settings));
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(common::Error::from)?;
        }

        let loaded: HashMap<String, SessionEntry> =
            common::snapshot::read(&path).await?.unwrap_or_default();
        info!(path = %path.display(), sessions = loaded.len(), "session store: loaded snapshot");

        let sessions = loaded
            .into_iter()
            .map(|(handle, entry)| (handle, Arc::new(Mutex::new(entry))))
            .collect();

        Ok(Self {
            sessions: RwLock::new(sessions),
            settings,
            snapshot_path: Some(path),
        })
    }

    /// Create a session for `user_id` with a fresh handle and refresh family.
    pub async fn create(
        &self,
        user_id: &str,
        metadata: SessionMetadata,
    ) -> (Session, RefreshTokenRecord) {
        self.create_at(user_id, metadata, crate::now_millis()).await
    }

    pub async fn create_at(
        &self,
        user_id: &str,
        metadata: SessionMetadata,
        now_millis: u64,
    ) -> (Session, RefreshTokenRecord) {
        let mut sessions = self.sessions.write().await;

        let mut handle = random_id();
        while sessions.contains_key(&handle) {
            warn!("session handle collision, drawing again");
            handle = random_id();
        }

        let session = Session {
            handle: handle.clone(),
            user_id: user_id.to_string(),
            created_at: now_millis,
            expires_at: deadline(now_millis, self.settings.session_ttl),
            family_id: random_id(),
            metadata,
            revoked: false,
            revoked_at: None,
        };
        let token = RefreshTokenRecord {
            token_id: random_id(),
            session_handle: handle.clone(),
            parent: None,
            issued_at: now_millis,
            used: false,
        };

        let mut tokens = HashMap::new();
        tokens.insert(token.token_id.clone(), token.clone());
        sessions.insert(
            handle.clone(),
            Arc::new(Mutex::new(SessionEntry {
                session: session.clone(),
                tokens,
            })),
        );

        debug!(session_handle = %handle, user_id, "session created");
        (session, token)
    }

    async fn entry(&self, handle: &str) -> Result<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub async fn lookup(&self, handle: &str) -> Result<Session> {
        let entry = self.entry(handle).await?;
        let entry = entry.lock().await;
        Ok(entry.session.clone())
    }

    pub async fn rotate_refresh_token(
        &self,
        handle: &str,
        presented_token_id: &str,
    ) -> Result<RefreshTokenRecord> {
        self.rotate_refresh_token_at(handle, presented_token_id, crate::now_millis())
            .await
    }

    /// Consume `presented_token_id` and issue its successor.
    ///
    /// Presenting a token that was already consumed revokes the session and
    /// returns `TokenReused`; every later call for the session then fails
    /// with `Revoked`.
    pub async fn rotate_refresh_token_at(
        &self,
        handle: &str,
        presented_token_id: &str,
        now_millis: u64,
    ) -> Result<RefreshTokenRecord> {
        let entry = self.entry(handle).await?;
        let mut guard = entry.lock().await;
        let entry = &mut *guard;

        if entry.session.revoked {
            return Err(Error::Revoked);
        }
        if now_millis >= entry.session.expires_at {
            return Err(Error::Expired);
        }

        let presented = entry
            .tokens
            .get_mut(presented_token_id)
            .ok_or(Error::NotFound)?;

        if presented.used {
            entry.session.revoked = true;
            entry.session.revoked_at = Some(now_millis);
            warn!(
                session_handle = handle,
                user_id = %entry.session.user_id,
                family_id = %entry.session.family_id,
                security_event = "refresh_token_reuse",
                "refresh token presented twice, session revoked"
            );
            return Err(Error::TokenReused);
        }
        presented.used = true;

        let next = RefreshTokenRecord {
            token_id: random_id(),
            session_handle: handle.to_string(),
            parent: Some(presented_token_id.to_string()),
            issued_at: now_millis,
            used: false,
        };
        entry.tokens.insert(next.token_id.clone(), next.clone());
        prune_ancestors(&mut entry.tokens, &next.token_id);
        entry.session.expires_at = deadline(now_millis, self.settings.session_ttl);

        debug!(session_handle = handle, "refresh token rotated");
        Ok(next)
    }

    /// Mark a session revoked. Unknown or already revoked handles are a no-op.
    ///
    /// Returns true when this call did the revoking.
    pub async fn revoke(&self, handle: &str) -> bool {
        self.revoke_at(handle, crate::now_millis()).await
    }

    pub async fn revoke_at(&self, handle: &str, now_millis: u64) -> bool {
        let Ok(entry) = self.entry(handle).await else {
            return false;
        };
        let mut entry = entry.lock().await;
        if entry.session.revoked {
            return false;
        }
        entry.session.revoked = true;
        entry.session.revoked_at = Some(now_millis);
        debug!(session_handle = handle, "session revoked");
        true
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(crate::now_millis()).await
    }

    /// Remove expired sessions and revoked sessions past the grace period.
    ///
    /// Best effort: sessions whose lock is held by a request right now are
    /// skipped and picked up by a later pass. The map write lock is taken
    /// per removal, never for the whole pass.
    pub async fn sweep_expired_at(&self, now_millis: u64) -> usize {
        let grace = clock::millis(self.settings.revoked_grace);

        let candidates: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter_map(|(handle, entry)| {
                    let entry = entry.try_lock().ok()?;
                    let session = &entry.session;
                    let expired = now_millis >= session.expires_at;
                    let revoked_past_grace = session
                        .revoked_at
                        .is_some_and(|at| now_millis >= at.saturating_add(grace));
                    (expired || revoked_past_grace).then(|| handle.clone())
                })
                .collect()
        };

        let mut removed = 0;
        for handle in &candidates {
            if self.sessions.write().await.remove(handle).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept expired sessions");
        }
        removed
    }

    /// Number of session records, including revoked ones awaiting the sweep.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write the snapshot for file-backed stores; no-op in memory.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let entries: Vec<(String, Arc<Mutex<SessionEntry>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(h, e)| (h.clone(), e.clone()))
            .collect();

        let mut snapshot = HashMap::with_capacity(entries.len());
        for (handle, entry) in entries {
            snapshot.insert(handle, entry.lock().await.clone());
        }

        common::snapshot::write_atomic(path, &snapshot).await?;
        Ok(())
    }
}

/// Keep `newest` and its closest `USED_TOKENS_KEPT` ancestors.
fn prune_ancestors(tokens: &mut HashMap<String, RefreshTokenRecord>, newest: &str) {
    let mut keep = HashSet::new();
    let mut cursor = Some(newest.to_string());
    while let Some(id) = cursor.take() {
        if keep.len() > USED_TOKENS_KEPT {
            break;
        }
        cursor = tokens.get(&id).and_then(|t| t.parent.clone());
        keep.insert(id);
    }
    tokens.retain(|id, _| keep.contains(id));
}
