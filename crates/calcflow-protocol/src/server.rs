// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP server exposing a [`LocalBroker`] to remote runners and clients.
//!
//! Each connection carries frames in both directions. Broadcasts, RPCs and
//! tasks sent by the client run against the broker and are answered with a
//! `Response` frame. Traffic for the client's own subscriptions is forwarded
//! down the same connection and the client answers it with `Response`
//! frames. `Control` frames add and remove those subscriptions.
//!
//! Subscriptions die with the connection: a client that disconnects loses
//! its process ids and any task it was handed but had not answered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::communicator::{
    Communicator, CommunicatorError, RpcInbox, TaskQueue, reply_for, send_response,
};
use crate::envelope::{ControlOp, ControlRequest, Envelope, EnvelopeKind, RpcResponse};
use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frames};
use crate::local::LocalBroker;

/// Errors that can occur in the broker server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Configuration for the broker server
#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections (0 for unlimited)
    pub max_connections: u32,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7300)),
            max_connections: 0,
        }
    }
}

impl BrokerServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `CALCFLOW_BROKER_BIND_ADDR`: Listen address (default: 127.0.0.1:7300)
    /// - `CALCFLOW_BROKER_MAX_CONNECTIONS`: Max concurrent connections, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: std::env::var("CALCFLOW_BROKER_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.bind_addr),
            max_connections: std::env::var("CALCFLOW_BROKER_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_connections),
        }
    }
}

/// Broker server bound to a TCP listener.
pub struct BrokerServer {
    listener: TcpListener,
    broker: LocalBroker,
    config: BrokerServerConfig,
}

impl std::fmt::Debug for BrokerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServer")
            .field("config", &self.config)
            .field("broker", &self.broker)
            .finish()
    }
}

impl BrokerServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(config: BrokerServerConfig, broker: LocalBroker) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "Broker server listening");
        Ok(Self {
            listener,
            broker,
            config,
        })
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` turns true.
    ///
    /// Connections already accepted keep being served until their peer
    /// disconnects.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let semaphore = (self.config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_connections as usize)));

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = stopped(&mut shutdown) => break,
            };

            let permit = match &semaphore {
                Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(%remote_addr, "Connection limit reached, rejecting");
                        continue;
                    }
                },
                None => None,
            };

            let broker = self.broker.clone();
            tokio::spawn(async move {
                let _permit = permit;
                debug!(%remote_addr, "Accepted broker connection");
                serve_connection(stream, broker).await;
                debug!(%remote_addr, "Broker connection closed");
            });
        }

        info!("Broker server stopped");
        Ok(())
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

type Outbound = mpsc::UnboundedSender<Frame>;

/// Calls forwarded to the client, keyed by correlation id. `None` once the
/// connection is released.
type Awaiting = Arc<Mutex<Option<HashMap<Uuid, oneshot::Sender<RpcResponse>>>>>;

async fn serve_connection(stream: TcpStream, broker: LocalBroker) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to disable Nagle");
    }
    let (mut reader, writer) = stream.into_split();
    let (out, frames) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(writer, frames));

    let mut conn = Connection {
        broker,
        out,
        awaiting: Arc::new(Mutex::new(Some(HashMap::new()))),
        subscriptions: HashMap::new(),
        broadcasts: None,
        tasks: None,
    };

    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => conn.dispatch(frame).await,
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                warn!(error = %e, "Broker connection failed");
                break;
            }
        }
    }

    conn.release().await;
    writer_task.abort();
}

/// Server side of one client connection.
struct Connection {
    broker: LocalBroker,
    out: Outbound,
    awaiting: Awaiting,
    subscriptions: HashMap<String, JoinHandle<()>>,
    broadcasts: Option<JoinHandle<()>>,
    tasks: Option<JoinHandle<()>>,
}

impl Connection {
    async fn dispatch(&mut self, frame: Frame) {
        match frame.message_type {
            MessageType::Broadcast | MessageType::Rpc | MessageType::Task => {
                match Envelope::from_frame(&frame) {
                    Ok(envelope) => self.submit(envelope).await,
                    Err(e) => warn!(error = %e, "Dropping undecodable envelope"),
                }
            }
            MessageType::Response => match frame.decode::<RpcResponse>() {
                Ok(response) => {
                    let slot = self
                        .awaiting
                        .lock()
                        .await
                        .as_mut()
                        .and_then(|slots| slots.remove(&response.correlation_id));
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(
                            correlation_id = %response.correlation_id,
                            "Reply for an unknown call"
                        ),
                    }
                }
                Err(e) => warn!(error = %e, "Dropping undecodable reply"),
            },
            MessageType::Control => match frame.decode::<ControlRequest>() {
                Ok(request) => {
                    let result = self.control(request.op).await;
                    send_response(&self.out, reply_for(request.correlation_id, result));
                }
                Err(e) => warn!(error = %e, "Dropping undecodable control request"),
            },
        }
    }

    /// Run a client's call against the broker. RPCs and tasks are answered
    /// from their own task so a slow reply never stalls the connection.
    async fn submit(&self, envelope: Envelope) {
        if envelope.kind == EnvelopeKind::Broadcast {
            if let Err(e) = self.broker.broadcast_send(envelope).await {
                warn!(error = %e, "Failed to relay broadcast");
            }
            return;
        }

        let broker = self.broker.clone();
        let out = self.out.clone();
        tokio::spawn(async move {
            let correlation_id = envelope.correlation_id;
            let result = match envelope.kind {
                EnvelopeKind::Task => broker.task_send(envelope).await,
                _ => broker.rpc_send(envelope).await,
            };
            send_response(&out, reply_for(correlation_id, result));
        });
    }

    async fn control(&mut self, op: ControlOp) -> Result<Value, CommunicatorError> {
        match op {
            ControlOp::SubscribeBroadcasts => {
                if self.broadcasts.is_none() {
                    let mut subscription = self.broker.subscribe_broadcasts().await?;
                    let out = self.out.clone();
                    self.broadcasts = Some(tokio::spawn(async move {
                        while let Some(envelope) = subscription.recv().await {
                            match envelope.to_frame() {
                                Ok(frame) => {
                                    if out.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Failed to encode broadcast"),
                            }
                        }
                    }));
                }
            }
            ControlOp::AddRpcSubscriber { process_id } => {
                // A client re-subscribing after dropping its inbox replaces its own entry
                if let Some(previous) = self.subscriptions.remove(&process_id) {
                    previous.abort();
                    self.broker.remove_rpc_subscriber(&process_id).await;
                }
                let inbox = self.broker.add_rpc_subscriber(&process_id).await?;
                let handle = tokio::spawn(forward_calls(
                    inbox,
                    self.out.clone(),
                    self.awaiting.clone(),
                ));
                self.subscriptions.insert(process_id, handle);
            }
            ControlOp::RemoveRpcSubscriber { process_id } => {
                if let Some(handle) = self.subscriptions.remove(&process_id) {
                    handle.abort();
                    self.broker.remove_rpc_subscriber(&process_id).await;
                }
            }
            ControlOp::ConsumeTasks => {
                if self.tasks.is_none() {
                    let queue = self.broker.task_queue().await?;
                    self.tasks = Some(tokio::spawn(forward_tasks(
                        queue,
                        self.out.clone(),
                        self.awaiting.clone(),
                    )));
                }
            }
        }
        Ok(Value::Null)
    }

    /// Drop every subscription held by this connection. Calls still waiting
    /// on the client resolve as `NoReply` for their senders.
    async fn release(self) {
        let count = self.subscriptions.len();
        for (_, handle) in self.subscriptions {
            handle.abort();
        }
        for handle in self.broadcasts.into_iter().chain(self.tasks) {
            handle.abort();
        }
        self.awaiting.lock().await.take();
        if count > 0 {
            debug!(subscriptions = count, "Released subscriptions of closed connection");
        }
    }
}

/// Send a delivery to the client and return the slot its reply lands in.
async fn forward(
    envelope: &Envelope,
    out: &Outbound,
    awaiting: &Awaiting,
) -> Option<oneshot::Receiver<RpcResponse>> {
    let frame = match envelope.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to encode delivery");
            return None;
        }
    };
    let (tx, rx) = oneshot::channel();
    {
        let mut awaiting = awaiting.lock().await;
        let slots = awaiting.as_mut()?;
        slots.insert(envelope.correlation_id, tx);
    }
    if out.send(frame).is_err() {
        if let Some(slots) = awaiting.lock().await.as_mut() {
            slots.remove(&envelope.correlation_id);
        }
        return None;
    }
    Some(rx)
}

async fn forward_calls(mut inbox: RpcInbox, out: Outbound, awaiting: Awaiting) {
    while let Some(delivery) = inbox.recv().await {
        let (envelope, responder) = delivery.into_parts();
        let Some(reply) = forward(&envelope, &out, &awaiting).await else {
            if out.is_closed() {
                break;
            }
            continue;
        };
        // Calls to one process may be answered out of order (a kill replies late)
        tokio::spawn(async move {
            if let Ok(response) = reply.await {
                responder.respond(response.into_result());
            }
        });
    }
}

/// One task in flight per connection, so an idle consumer elsewhere can
/// pick up the rest of the queue.
async fn forward_tasks(queue: TaskQueue, out: Outbound, awaiting: Awaiting) {
    while let Some(delivery) = queue.next().await {
        let (envelope, responder) = delivery.into_parts();
        let Some(reply) = forward(&envelope, &out, &awaiting).await else {
            if out.is_closed() {
                break;
            }
            continue;
        };
        match reply.await {
            Ok(response) => responder.respond(response.into_result()),
            Err(_) => break,
        }
    }
}
