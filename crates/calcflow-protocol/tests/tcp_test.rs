// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery semantics across the TCP broker server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use calcflow_protocol::{
    BrokerServer, BrokerServerConfig, Communicator, CommunicatorError, Envelope, LocalBroker,
    RemoteBroker, RemoteBrokerConfig, RpcError, RpcMethod,
};
use serde_json::json;
use tokio::sync::watch;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    broker: LocalBroker,
    _stop: watch::Sender<bool>,
}

async fn start_server() -> TestServer {
    let config = BrokerServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        max_connections: 0,
    };
    let broker = LocalBroker::new();
    let server = BrokerServer::bind(config, broker.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(server.run(stop_rx));
    TestServer {
        addr,
        broker,
        _stop: stop,
    }
}

async fn connect(server: &TestServer) -> RemoteBroker {
    RemoteBroker::connect(RemoteBrokerConfig::default().with_server_addr(server.addr))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_rpc_crosses_connections() {
    let server = start_server().await;
    let owner = connect(&server).await;
    let caller = connect(&server).await;

    let mut inbox = owner.add_rpc_subscriber("p1").await.unwrap();
    tokio::spawn(async move {
        while let Some(call) = inbox.recv().await {
            match call.envelope.method {
                Some(RpcMethod::Status) => {
                    let args = call.envelope.args.clone();
                    call.respond(Ok(json!({ "state": "waiting", "args": args })));
                }
                _ => call.respond(Err(RpcError {
                    code: "INVALID_STATE".to_string(),
                    message: "already finished".to_string(),
                })),
            }
        }
    });

    let status = caller
        .rpc_send(Envelope::rpc("p1", RpcMethod::Status, Some(json!({"depth": 1}))))
        .await
        .unwrap();
    assert_eq!(status["state"], "waiting");
    assert_eq!(status["args"]["depth"], 1);

    let err = caller
        .rpc_send(Envelope::rpc("p1", RpcMethod::Pause, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CommunicatorError::Remote { code, .. } if code == "INVALID_STATE"));

    let err = caller
        .rpc_send(Envelope::rpc("missing", RpcMethod::Status, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CommunicatorError::ProcessNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn test_remote_and_local_subscribers_share_one_namespace() {
    let server = start_server().await;
    let remote = connect(&server).await;

    let mut local_inbox = server.broker.add_rpc_subscriber("p1").await.unwrap();
    tokio::spawn(async move {
        while let Some(call) = local_inbox.recv().await {
            call.respond(Ok(json!("local")));
        }
    });

    let err = remote.add_rpc_subscriber("p1").await.unwrap_err();
    assert!(matches!(err, CommunicatorError::AlreadySubscribed(id) if id == "p1"));

    let reply = remote
        .rpc_send(Envelope::rpc("p1", RpcMethod::Status, None))
        .await
        .unwrap();
    assert_eq!(reply, json!("local"));
}

#[tokio::test]
async fn test_dropped_call_reports_no_reply() {
    let server = start_server().await;
    let owner = connect(&server).await;
    let caller = connect(&server).await;

    let mut inbox = owner.add_rpc_subscriber("p1").await.unwrap();
    tokio::spawn(async move {
        while let Some(call) = inbox.recv().await {
            drop(call);
        }
    });

    let err = caller
        .rpc_send(Envelope::rpc("p1", RpcMethod::Kill, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CommunicatorError::NoReply));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tasks_reach_exactly_one_remote_consumer() {
    let server = start_server().await;
    let handled = Arc::new(AtomicUsize::new(0));

    let mut consumers = Vec::new();
    for name in ["a", "b"] {
        let consumer = connect(&server).await;
        let queue = consumer.task_queue().await.unwrap();
        let handled = handled.clone();
        tokio::spawn(async move {
            while let Some(task) = queue.next().await {
                handled.fetch_add(1, Ordering::SeqCst);
                let n = task.envelope.body.clone().unwrap_or_default()["n"].clone();
                task.respond(Ok(json!({ "n": n, "by": name })));
            }
        });
        consumers.push(consumer);
    }

    let sender = connect(&server).await;
    let replies = futures::future::join_all(
        (0..6).map(|n| sender.task_send(Envelope::task(json!({ "n": n })))),
    )
    .await;

    for (n, reply) in replies.into_iter().enumerate() {
        let reply = reply.unwrap();
        assert_eq!(reply["n"], n);
        assert!(reply["by"] == "a" || reply["by"] == "b");
    }
    assert_eq!(handled.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_broadcast_reaches_remote_subscribers() {
    let server = start_server().await;
    let listener = connect(&server).await;
    let publisher = connect(&server).await;

    let mut remote_sub = listener.subscribe_broadcasts().await.unwrap();
    let mut local_sub = server.broker.subscribe_broadcasts().await.unwrap();

    publisher
        .broadcast_send(Envelope::broadcast(
            "p1",
            "state_changed.running.waiting",
            json!({}),
        ))
        .await
        .unwrap();

    let received = tokio::time::timeout(TIMEOUT, remote_sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.subject.as_deref(), Some("state_changed.running.waiting"));
    assert_eq!(received.sender.as_deref(), Some("p1"));

    let received = tokio::time::timeout(TIMEOUT, local_sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.sender.as_deref(), Some("p1"));
}

#[tokio::test]
async fn test_subscriptions_end_with_the_connection() {
    let server = start_server().await;
    let owner = connect(&server).await;
    let caller = connect(&server).await;

    let _inbox = owner.add_rpc_subscriber("p1").await.unwrap();
    owner.close().await;
    assert!(owner.is_closed());
    assert!(matches!(
        owner.rpc_send(Envelope::rpc("p1", RpcMethod::Status, None)).await,
        Err(CommunicatorError::Closed)
    ));

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match caller.rpc_send(Envelope::rpc("p1", RpcMethod::Status, None)).await {
            Err(CommunicatorError::ProcessNotFound(_)) => break,
            other => assert!(
                tokio::time::Instant::now() < deadline,
                "subscription outlived its connection: {other:?}"
            ),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(caller.add_rpc_subscriber("p1").await.is_ok());
}

#[tokio::test]
async fn test_client_closes_when_the_server_hangs_up() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let client = RemoteBroker::connect(RemoteBrokerConfig::default().with_server_addr(addr))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !client.is_closed() {
        assert!(tokio::time::Instant::now() < deadline, "client never noticed the hang-up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(matches!(
        client.rpc_send(Envelope::rpc("p1", RpcMethod::Status, None)).await,
        Err(CommunicatorError::Closed)
    ));
    assert!(matches!(
        client.task_queue().await,
        Err(CommunicatorError::Closed)
    ));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result =
        RemoteBroker::connect(RemoteBrokerConfig::default().with_server_addr(addr)).await;
    assert!(result.is_err());
}
