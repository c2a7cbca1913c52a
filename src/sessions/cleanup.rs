//! Session TTL cleanup.
//!
//! Background task that periodically purges sessions whose `updatedAt`
//! timestamp is older than the configured TTL, and ages out the transport
//! replay cache on the same cadence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use super::SessionStore;
use crate::transport::replay::ReplayGuard;

/// Background loop that periodically sweeps expired sessions and replay
/// records. Exits cleanly when the shutdown signal fires.
pub async fn cleanup_loop(
    sessions: Arc<SessionStore>,
    replay: Arc<ReplayGuard>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        target: "sessions",
        interval_ms = interval.as_millis() as u64,
        "session cleanup scheduled"
    );

    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; nothing can have expired yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if *shutdown.borrow() {
            break;
        }

        run_sweep(&sessions, &replay);
    }

    debug!(target: "sessions", "session cleanup stopped");
}

/// Execute a single sweep pass, logging what was reclaimed.
fn run_sweep(sessions: &SessionStore, replay: &ReplayGuard) {
    let expired_sessions = sessions.cleanup_expired();
    let expired_nonces = replay.sweep();
    if expired_sessions > 0 || expired_nonces > 0 {
        info!(
            target: "sessions",
            expired_sessions,
            expired_nonces,
            live_sessions = sessions.len(),
            "sweep reclaimed expired state"
        );
    } else {
        debug!(target: "sessions", "sweep found nothing to reclaim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_loop_exits_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(
            dir.path().to_path_buf(),
            Duration::from_secs(600),
        ));
        let replay = Arc::new(ReplayGuard::new(
            Duration::from_secs(300),
            Duration::from_secs(30),
        ));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(cleanup_loop(
            sessions,
            replay,
            Duration::from_secs(3600),
            rx,
        ));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop should exit promptly")
            .unwrap();
    }
}
