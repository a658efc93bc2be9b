// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP client for a [`BrokerServer`](crate::server::BrokerServer).
//!
//! [`RemoteBroker`] implements [`Communicator`] over a single connection.
//! Subscriptions are registered with the server and the traffic it forwards
//! is demultiplexed into the same inbox, queue and subscription types the
//! local broker hands out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::communicator::{
    BroadcastSubscription, Communicator, CommunicatorError, NO_REPLY, PROCESS_NOT_FOUND,
    RawDelivery, RpcInbox, TaskQueue, decode_reply, send_response,
};
use crate::envelope::{ControlOp, ControlRequest, Envelope, EnvelopeKind, RpcResponse};
use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frames};
use crate::local::{BROADCAST_CAPACITY, RPC_INBOX_CAPACITY};

/// Errors that can occur while connecting to a broker server
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Configuration for the broker client
#[derive(Debug, Clone)]
pub struct RemoteBrokerConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for RemoteBrokerConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7300)),
            connect_timeout_ms: 10_000,
        }
    }
}

impl RemoteBrokerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `CALCFLOW_BROKER_ADDR`: Broker server address (default: 127.0.0.1:7300)
    /// - `CALCFLOW_BROKER_CONNECT_TIMEOUT_MS`: Connect timeout in ms (default: 10000)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            server_addr: std::env::var("CALCFLOW_BROKER_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.server_addr),
            connect_timeout_ms: std::env::var("CALCFLOW_BROKER_CONNECT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.connect_timeout_ms),
        }
    }

    pub fn with_server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }
}

struct ClientInner {
    out: mpsc::UnboundedSender<Frame>,
    /// Calls sent by this client, keyed by correlation id.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Bytes>>>,
    rpc: RwLock<HashMap<String, mpsc::Sender<RawDelivery>>>,
    tasks_tx: Mutex<Option<mpsc::UnboundedSender<RawDelivery>>>,
    tasks_rx: Arc<Mutex<mpsc::UnboundedReceiver<RawDelivery>>>,
    broadcasts: Mutex<Option<broadcast::Sender<Bytes>>>,
    subscribed: AtomicBool,
    consuming: AtomicBool,
    closed: AtomicBool,
    io: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Communicator backed by a connection to a broker server.
#[derive(Clone)]
pub struct RemoteBroker {
    inner: Arc<ClientInner>,
    server_addr: SocketAddr,
}

impl std::fmt::Debug for RemoteBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBroker")
            .field("server_addr", &self.server_addr)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl RemoteBroker {
    /// Connect to the server
    #[instrument(skip(config), fields(addr = %config.server_addr))]
    pub async fn connect(config: RemoteBrokerConfig) -> Result<Self, ClientError> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(config.server_addr))
            .await
            .map_err(|_| ClientError::Timeout(config.connect_timeout_ms))??;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (out, frames) = mpsc::unbounded_channel();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let inner = Arc::new(ClientInner {
            out,
            pending: Mutex::new(HashMap::new()),
            rpc: RwLock::new(HashMap::new()),
            tasks_tx: Mutex::new(Some(tasks_tx)),
            tasks_rx: Arc::new(Mutex::new(tasks_rx)),
            broadcasts: Mutex::new(Some(broadcast_tx)),
            subscribed: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            io: std::sync::Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(write_frames(writer, frames));
        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&inner)));
        inner
            .io
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([writer_task, reader_task]);

        info!("Connected to broker server");
        Ok(Self {
            inner,
            server_addr: config.server_addr,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    fn ensure_open(&self) -> Result<(), CommunicatorError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(CommunicatorError::Closed)
        } else {
            Ok(())
        }
    }

    /// Send a frame and wait for the `Response` frame with the same
    /// correlation id.
    async fn request(&self, frame: Frame, correlation_id: Uuid) -> Result<Bytes, CommunicatorError> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(correlation_id, tx);
        // The reader clears `pending` after flagging `closed`
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.out.send(frame).is_err() {
            self.inner.pending.lock().await.remove(&correlation_id);
            return Err(CommunicatorError::Closed);
        }
        rx.await.map_err(|_| CommunicatorError::Closed)
    }

    async fn control(&self, target: &str, op: ControlOp) -> Result<(), CommunicatorError> {
        let request = ControlRequest::new(op);
        let reply = self.request(request.to_frame()?, request.correlation_id).await?;
        decode_reply(target, reply).map(|_| ())
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inner: Weak<ClientInner>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break,
            Err(e) => {
                warn!(error = %e, "Broker connection failed");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(frame).await;
    }

    if let Some(inner) = inner.upgrade()
        && !inner.closed.swap(true, Ordering::SeqCst)
    {
        warn!("Broker server closed the connection");
        inner.release().await;
    }
}

impl ClientInner {
    async fn dispatch(&self, frame: Frame) {
        match frame.message_type {
            MessageType::Response => match frame.decode::<RpcResponse>() {
                Ok(response) => {
                    let slot = self.pending.lock().await.remove(&response.correlation_id);
                    if let Some(tx) = slot {
                        let _ = tx.send(frame.encode());
                    }
                }
                Err(e) => warn!(error = %e, "Dropping undecodable reply"),
            },
            MessageType::Broadcast => {
                if let Some(tx) = self.broadcasts.lock().await.as_ref() {
                    let _ = tx.send(frame.encode());
                }
            }
            MessageType::Rpc | MessageType::Task => match Envelope::from_frame(&frame) {
                Ok(envelope) => self.deliver(envelope, frame).await,
                Err(e) => warn!(error = %e, "Dropping undecodable delivery"),
            },
            MessageType::Control => warn!("Ignoring control frame sent by the server"),
        }
    }

    /// Hand a forwarded call to the local inbox or queue and relay its reply.
    async fn deliver(&self, envelope: Envelope, frame: Frame) {
        let correlation_id = envelope.correlation_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        let raw = RawDelivery {
            frame: frame.encode(),
            reply: reply_tx,
        };

        let delivered = if envelope.kind == EnvelopeKind::Task {
            match self.tasks_tx.lock().await.as_ref() {
                Some(tx) => tx.send(raw).is_ok(),
                None => false,
            }
        } else {
            let target = envelope.target_process_id.unwrap_or_default();
            let sender = self.rpc.read().await.get(&target).cloned();
            let accepted = match sender {
                Some(tx) => match tx.try_send(raw) {
                    Ok(()) => true,
                    // Never block the reader on a busy process; replies it awaits arrive here too
                    Err(mpsc::error::TrySendError::Full(raw)) => {
                        tokio::spawn(async move {
                            let _ = tx.send(raw).await;
                        });
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
                None => false,
            };
            if !accepted {
                send_response(
                    &self.out,
                    RpcResponse::err(
                        correlation_id,
                        PROCESS_NOT_FOUND,
                        format!("process not found: {target}"),
                    ),
                );
                return;
            }
            true
        };

        if !delivered {
            send_response(
                &self.out,
                RpcResponse::err(correlation_id, NO_REPLY, "task consumer closed"),
            );
            return;
        }

        let out = self.out.clone();
        tokio::spawn(async move {
            match reply_rx.await {
                Ok(bytes) => match Frame::decode_from_bytes(bytes) {
                    Ok(frame) => {
                        let _ = out.send(frame);
                    }
                    Err(e) => warn!(error = %e, "Failed to relay reply"),
                },
                Err(_) => send_response(
                    &out,
                    RpcResponse::err(correlation_id, NO_REPLY, "no reply received"),
                ),
            }
        });
    }

    /// Fail outstanding calls and end every local subscription.
    async fn release(&self) {
        self.pending.lock().await.clear();
        self.rpc.write().await.clear();
        self.tasks_tx.lock().await.take();
        self.broadcasts.lock().await.take();
    }
}

#[async_trait]
impl Communicator for RemoteBroker {
    async fn broadcast_send(&self, envelope: Envelope) -> Result<(), CommunicatorError> {
        self.ensure_open()?;
        if envelope.kind != EnvelopeKind::Broadcast {
            return Err(CommunicatorError::Malformed("expected a broadcast envelope"));
        }
        self.inner
            .out
            .send(envelope.to_frame()?)
            .map_err(|_| CommunicatorError::Closed)
    }

    async fn subscribe_broadcasts(&self) -> Result<BroadcastSubscription, CommunicatorError> {
        self.ensure_open()?;
        let rx = {
            let guard = self.inner.broadcasts.lock().await;
            guard.as_ref().ok_or(CommunicatorError::Closed)?.subscribe()
        };
        if !self.inner.subscribed.swap(true, Ordering::SeqCst)
            && let Err(e) = self.control("broker", ControlOp::SubscribeBroadcasts).await
        {
            self.inner.subscribed.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(BroadcastSubscription::new(rx))
    }

    async fn add_rpc_subscriber(&self, process_id: &str) -> Result<RpcInbox, CommunicatorError> {
        self.ensure_open()?;
        let rx = {
            let mut rpc = self.inner.rpc.write().await;
            if let Some(existing) = rpc.get(process_id)
                && !existing.is_closed()
            {
                return Err(CommunicatorError::AlreadySubscribed(process_id.to_string()));
            }
            let (tx, rx) = mpsc::channel(RPC_INBOX_CAPACITY);
            rpc.insert(process_id.to_string(), tx);
            rx
        };

        let op = ControlOp::AddRpcSubscriber {
            process_id: process_id.to_string(),
        };
        if let Err(e) = self.control(process_id, op).await {
            self.inner.rpc.write().await.remove(process_id);
            return Err(e);
        }
        debug!(process_id, "Remote RPC subscriber added");
        Ok(RpcInbox::new(rx))
    }

    async fn remove_rpc_subscriber(&self, process_id: &str) {
        if self.inner.rpc.write().await.remove(process_id).is_none() || self.is_closed() {
            return;
        }
        let op = ControlOp::RemoveRpcSubscriber {
            process_id: process_id.to_string(),
        };
        if let Err(e) = self.control(process_id, op).await {
            debug!(process_id, error = %e, "Failed to remove remote RPC subscriber");
        }
    }

    async fn rpc_send(&self, envelope: Envelope) -> Result<Value, CommunicatorError> {
        let target = envelope
            .target_process_id
            .clone()
            .ok_or(CommunicatorError::Malformed("rpc without target_process_id"))?;
        if envelope.method.is_none() {
            return Err(CommunicatorError::Malformed("rpc without method"));
        }
        let reply = self
            .request(envelope.to_frame()?, envelope.correlation_id)
            .await?;
        decode_reply(&target, reply)
    }

    async fn task_send(&self, envelope: Envelope) -> Result<Value, CommunicatorError> {
        if envelope.kind != EnvelopeKind::Task {
            return Err(CommunicatorError::Malformed("expected a task envelope"));
        }
        let reply = self
            .request(envelope.to_frame()?, envelope.correlation_id)
            .await?;
        decode_reply("task", reply)
    }

    async fn task_queue(&self) -> Result<TaskQueue, CommunicatorError> {
        self.ensure_open()?;
        if !self.inner.consuming.swap(true, Ordering::SeqCst)
            && let Err(e) = self.control("task", ControlOp::ConsumeTasks).await
        {
            self.inner.consuming.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(TaskQueue::new(self.inner.tasks_rx.clone()))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let io: Vec<_> = self
            .inner
            .io
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in io {
            handle.abort();
        }
        self.inner.release().await;
        info!(addr = %self.server_addr, "Remote broker closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
