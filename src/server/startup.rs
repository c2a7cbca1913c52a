//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real relay on an ephemeral port, exercise its HTTP surface,
//! and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::routes::{build_router, AppState};
use crate::sessions::cleanup::cleanup_loop;

/// Everything needed to start a relay server.
pub struct ServerConfig {
    pub state: AppState,
    pub bind_address: SocketAddr,
    /// When `false` (e.g. in tests), the session cleanup task is **not**
    /// spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Minimal config suitable for integration tests: binds to an
    /// OS-assigned port and disables background tasks.
    pub fn for_testing(state: AppState) -> Self {
        ServerConfig {
            state,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            spawn_background_tasks: false,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The full local address (ip + port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Trigger graceful shutdown: notify background tasks, then await the
    /// server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(target: "server", "server task returned error: {e}"),
            Ok(Err(e)) => error!(target: "server", "server task panicked: {e}"),
            Err(_) => warn!(target: "server", "server task did not finish within 5s timeout"),
        }
    }
}

/// Bind, spawn background tasks, and serve until shutdown.
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.spawn_background_tasks {
        tokio::spawn(cleanup_loop(
            Arc::clone(&config.state.sessions),
            Arc::clone(&config.state.replay),
            config.state.config.sweep_interval,
            shutdown_rx.clone(),
        ));
    }

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(config.state);

    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    info!(target: "server", %local_addr, "relay listening");

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        server_task,
    })
}
