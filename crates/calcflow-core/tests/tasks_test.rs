// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Competing task consumers sharing one broker, in process or over TCP.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use calcflow_core::runner::{continue_task, launch_task};
use calcflow_core::{
    CheckpointStore, CoreError, LaunchRequest, MemoryCheckpointStore, ProcessState, Runner,
};
use calcflow_protocol::{
    BrokerServer, BrokerServerConfig, Communicator, Envelope, LocalBroker, RemoteBroker,
    RemoteBrokerConfig, RpcMethod,
};
use tokio::sync::watch;

use common::*;

async fn started_runner(
    runner_id: &str,
    dir: &std::path::Path,
    store: Arc<dyn CheckpointStore>,
    broker: Arc<dyn Communicator>,
) -> Runner {
    let runner = Runner::builder()
        .config(test_config(runner_id, dir))
        .registry(test_registry())
        .store(store)
        .communicator(broker)
        .build()
        .await
        .unwrap();
    runner.start().await.unwrap();
    runner
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_each_launch_task_is_taken_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let broker = broker();
    let a = started_runner("runner-a", dir.path(), store.clone(), broker.clone()).await;
    let b = started_runner("runner-b", dir.path(), store.clone(), broker.clone()).await;

    let mut ids = HashSet::new();
    for _ in 0..6 {
        let id = launch_task(
            broker.as_ref(),
            LaunchRequest::new("signal", json!({})),
        )
        .await
        .unwrap();
        assert!(ids.insert(id));
    }

    for id in &ids {
        assert_ne!(a.is_live(id), b.is_live(id), "{id} must live in exactly one runner");
    }
    assert_eq!(a.live_count() + b.live_count(), 6);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_task_reports_error_to_sender() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let broker = broker();
    let runner = started_runner(
        "runner-reject",
        dir.path(),
        Arc::new(MemoryCheckpointStore::new()),
        broker.clone(),
    )
    .await;

    let err = launch_task(broker.as_ref(), LaunchRequest::new("nope", json!({})))
        .await
        .unwrap_err();
    match err {
        CoreError::Remote { code, .. } => assert_eq!(code, "UNKNOWN_PROCESS_TYPE"),
        other => panic!("unexpected error {other:?}"),
    }

    runner.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_continue_task_moves_released_processes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let broker = broker();

    let a = started_runner("runner-a", dir.path(), store.clone(), broker.clone()).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            a.submit(LaunchRequest::new("signal", json!({})))
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        let waiting = eventually(Duration::from_secs(10), || async {
            a.status(*id)
                .await
                .map(|s| s.state == ProcessState::Waiting)
                .unwrap_or(false)
        })
        .await;
        assert!(waiting);
    }
    a.shutdown().await.unwrap();

    // A second runner started with no rehydration only picks processes up
    // through tasks
    let b = Runner::builder()
        .config(test_config("runner-b", dir.path()).with_max_rehydrate(0))
        .registry(test_registry())
        .store(store.clone())
        .communicator(broker.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(b.start().await.unwrap(), 0);

    for id in &ids {
        let continued = continue_task(broker.as_ref(), *id).await.unwrap();
        assert_eq!(continued, *id);
        assert!(b.is_live(id));
    }

    for id in &ids {
        b.continue_process(*id, json!("done")).await.unwrap();
        let record = b.wait_for(*id).await.unwrap();
        assert_eq!(record.state, ProcessState::Finished);
    }

    b.shutdown().await.unwrap();
}

async fn serve_broker() -> (std::net::SocketAddr, watch::Sender<bool>) {
    let config = BrokerServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        max_connections: 0,
    };
    let server = BrokerServer::bind(config, LocalBroker::new()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(server.run(stop_rx));
    (addr, stop)
}

async fn remote(addr: std::net::SocketAddr) -> Arc<dyn Communicator> {
    Arc::new(
        RemoteBroker::connect(RemoteBrokerConfig::default().with_server_addr(addr))
            .await
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runners_share_a_served_broker() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let (addr, _stop) = serve_broker().await;

    let a = started_runner("runner-a", dir.path(), store.clone(), remote(addr).await).await;
    let b = started_runner("runner-b", dir.path(), store.clone(), remote(addr).await).await;
    let client = remote(addr).await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        let id = launch_task(client.as_ref(), LaunchRequest::new("signal", json!({})))
            .await
            .unwrap();
        assert_ne!(a.is_live(&id), b.is_live(&id), "{id} must live in exactly one runner");
        ids.push(id);
    }

    for (n, id) in ids.iter().enumerate() {
        let waiting = eventually(Duration::from_secs(10), || async {
            client
                .rpc_send(Envelope::rpc(id.to_string(), RpcMethod::Status, None))
                .await
                .map(|status| status["state"] == "waiting")
                .unwrap_or(false)
        })
        .await;
        assert!(waiting, "{id} never reported waiting over the served broker");

        let owner = if a.is_live(id) { &a } else { &b };
        client
            .rpc_send(Envelope::rpc(
                id.to_string(),
                RpcMethod::Continue,
                Some(json!({ "value": n })),
            ))
            .await
            .unwrap();

        let record = tokio::time::timeout(Duration::from_secs(10), owner.wait_for(*id))
            .await
            .expect("process did not finish")
            .unwrap();
        assert_eq!(record.state, ProcessState::Finished);
        assert_eq!(record.outputs, Some(json!({ "value": n })));
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
