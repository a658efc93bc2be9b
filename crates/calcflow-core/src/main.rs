// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Calcflow runner daemon.
//!
//! Hosts a runner with the bundled transports and schedulers and a SQLite
//! checkpoint store under the work directory. The broker is private to the
//! daemon, served over TCP to other runners and clients, or reached on
//! another daemon, depending on `CALCFLOW_BROKER_MODE`. Rehydrates in-flight
//! processes on startup and drains on ctrl-c.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use calcflow_core::{BrokerMode, PluginRegistry, Runner, RunnerConfig, SqliteCheckpointStore};
use calcflow_protocol::{
    BrokerServer, BrokerServerConfig, Communicator, LocalBroker, RemoteBroker, RemoteBrokerConfig,
    ServerError,
};

/// Checkpoint database inside the work directory.
const CHECKPOINT_DB: &str = "checkpoints.db";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("calcflow_core=info".parse()?)
                .add_directive("calcflow_protocol=info".parse()?),
        )
        .init();

    info!("Starting calcflow runner");

    let config = RunnerConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        runner_id = %config.runner_id,
        work_dir = %config.work_dir.display(),
        computers = config.computers.len(),
        max_rehydrate = config.max_rehydrate,
        broker_mode = ?config.broker_mode,
        "Configuration loaded"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let (communicator, server) = open_broker(config.broker_mode, stop_rx).await?;

    let db_path = config.work_dir.join(CHECKPOINT_DB);
    info!(path = %db_path.display(), "Opening checkpoint store...");
    let store = SqliteCheckpointStore::from_path(&db_path).await?;

    let runner = Runner::builder()
        .config(config)
        .store(Arc::new(store))
        .registry(PluginRegistry::with_defaults())
        .communicator(communicator.clone())
        .build()
        .await?;

    let rehydrated = runner.start().await?;
    info!(rehydrated, "Runner ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runner.shutdown().await?;
    let _ = stop_tx.send(true);
    if let Some(server) = server {
        server.await??;
    }
    communicator.close().await;
    info!("Shutdown complete");

    Ok(())
}

type ServerTask = JoinHandle<std::result::Result<(), ServerError>>;

async fn open_broker(
    mode: BrokerMode,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<dyn Communicator>, Option<ServerTask>)> {
    match mode {
        BrokerMode::Embedded => Ok((Arc::new(LocalBroker::new()), None)),
        BrokerMode::Serve => {
            let broker = LocalBroker::new();
            let server = BrokerServer::bind(BrokerServerConfig::from_env(), broker.clone()).await?;
            let task = tokio::spawn(server.run(shutdown));
            Ok((Arc::new(broker), Some(task)))
        }
        BrokerMode::Connect => {
            let config = RemoteBrokerConfig::from_env();
            info!(addr = %config.server_addr, "Connecting to broker server...");
            let remote = RemoteBroker::connect(config).await?;
            Ok((Arc::new(remote), None))
        }
    }
}
