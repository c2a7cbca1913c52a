use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};

use drawbridge::config::Config;
use drawbridge::logging;
use drawbridge::repo::CliGit;
use drawbridge::server::{run_server_with_config, AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_from_env();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(target: "server", "configuration error: {e}");
            return Err(e.into());
        }
    };

    let git = Arc::new(CliGit::new(
        config.repos_dir.clone(),
        config.github_pat.clone(),
        config.identity.clone(),
    ));
    let state = AppState::new(config, git);
    let bind_address = SocketAddr::from(([0, 0, 0, 0], state.config.port));

    let handle = run_server_with_config(ServerConfig {
        state,
        bind_address,
        spawn_background_tasks: true,
    })
    .await?;

    info!(target: "server", "drawbridge ready on {}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    info!(target: "server", "shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
