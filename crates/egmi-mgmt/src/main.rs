use anyhow::Result;
use clap::Parser;
use egmi_mgmt::cli::{apply_overrides, Cli, Command};
use egmi_mgmt::config::CoordinatorKind;
use egmi_mgmt::election::{Coordinator, ElectionService, InMemoryCoordinator, LeadershipState};
use egmi_mgmt::zookeeper::ZookeeperCoordinator;
use egmi_mgmt::{api, EgmiConfig, HttpRemoteManager, ManagementService, RemoteManager};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Serve {
            config,
            bind,
            hostname,
            master,
        } => {
            let mut config = load_config(config)?;
            apply_overrides(&mut config, *bind, hostname.clone(), *master);
            config.validate()?;
            serve(config).await
        }
        _ => cli.run().await,
    }
}

fn load_config(path: &Path) -> Result<EgmiConfig> {
    if path.exists() {
        EgmiConfig::from_file(path)
    } else {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
        Ok(EgmiConfig::default())
    }
}

async fn serve(config: EgmiConfig) -> Result<()> {
    tracing::info!(hostname = %config.hostname, "EGMI starting...");

    let remote: Arc<dyn RemoteManager> = Arc::new(
        HttpRemoteManager::new(
            config.remote_port,
            Duration::from_millis(config.remote_connect_timeout_ms),
            Duration::from_millis(config.remote_read_timeout_ms),
        )
        .with_context_root(&config.remote_context_root),
    );

    let coordinator: Option<Arc<dyn Coordinator>> = match config.election.coordinator {
        CoordinatorKind::Standalone => None,
        CoordinatorKind::InMemory => Some(Arc::new(InMemoryCoordinator::new())),
        CoordinatorKind::Zookeeper => Some(Arc::new(ZookeeperCoordinator::new(
            config.election.zookeeper_urls.clone(),
        ))),
    };

    let leadership = Arc::new(LeadershipState::default());
    let election = ElectionService::new(
        config.election.clone(),
        config.hostname.clone(),
        leadership.clone(),
        coordinator,
    );
    let bind_addr = config.bind_addr;
    let service = Arc::new(ManagementService::new(config, remote, leadership));
    let cancel = CancellationToken::new();

    let election_handle = tokio::spawn(election.run(cancel.clone()));
    let loop_handle = tokio::spawn(service.clone().run(cancel.clone()));
    let api_handle = tokio::spawn(api::serve(service.clone(), bind_addr, cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("API serve error: {}", e),
                Err(e) => tracing::error!("API task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    cancel.cancel();
    let _ = tokio::join!(election_handle, loop_handle);
    tracing::info!("EGMI stopped");
    Ok(())
}
