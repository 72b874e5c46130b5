//! JSON snapshot files for file-backed stores
//!
//! Session and user records are kept in memory and snapshotted to a
//! directory named by `SESSION_STORE_URI=file://<dir>`. Writes go to a temp
//! file in the same directory and are renamed over the target, so a crash
//! mid-write leaves the previous snapshot intact. Snapshot files hold session
//! material and are created 0600 on unix.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Read a snapshot, returning `None` when the file does not exist yet.
pub async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    let value = serde_json::from_str(&contents)?;
    Ok(Some(value))
}

/// Serialize `data` and atomically replace the snapshot at `path`.
pub async fn write_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(data)?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, &json).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), bytes = json.len(), "snapshot written");
    Ok(())
}
