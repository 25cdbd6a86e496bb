use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{error, info, warn};

use raft_kv_service::cli::Cli;
use raft_kv_service::service::Service;
use raft_kv_service::store::Store;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let node_id = cli.node_id();
    let store = Arc::new(Store::new(cli.store_config()));
    store
        .open(cli.bootstrap, &node_id)
        .await
        .with_context(|| format!("failed to open store at {}", cli.path.display()))?;

    let service = match Service::start(cli.service_config(), store.clone()).await {
        Ok(service) => service,
        Err(err) => {
            store.close().await;
            return Err(err.into());
        }
    };

    if let Some(join_addr) = &cli.join {
        if let Err(err) = service.join_existing(join_addr).await {
            service.stop().await;
            return Err(err).context("failed to join cluster");
        }
    }

    info!(node = %node_id, "raft-kv-service started");
    let halted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            None
        }
        reason = store.halted() => reason,
    };

    service.stop().await;
    match halted {
        Some(reason) => {
            error!(%reason, "state machine diverged, node halted");
            Err(anyhow!("node halted: {reason}"))
        }
        None => {
            info!("raft-kv-service exiting");
            Ok(())
        }
    }
}
