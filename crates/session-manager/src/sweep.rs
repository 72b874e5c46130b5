//! Background sweep of expired state
//!
//! Periodically removes expired or long-revoked sessions and abandoned
//! sign-in attempts, then writes the session snapshot. Runs independently
//! of the request path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::manager::{SessionManager, SweepReport};

/// Spawn the periodic sweep. Returns the task handle so shutdown can abort it.
pub fn spawn_sweep_task(
    manager: Arc<SessionManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; nothing has expired yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&manager).await;
        }
    })
}

async fn sweep_cycle(manager: &SessionManager) -> SweepReport {
    let report = manager.sweep().await;
    debug!(
        sessions = report.sessions,
        sign_in_attempts = report.sign_in_attempts,
        "sweep cycle complete"
    );
    if let Err(e) = manager.save().await {
        warn!(error = %e, "failed to persist session snapshot, will retry next cycle");
    }
    report
}
