// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker.
//!
//! [`LocalBroker`] implements [`Communicator`] on top of tokio channels.
//! Every message is still encoded as a frame, so subscribers see exactly
//! what a networked broker would hand them. Several runners sharing one
//! `LocalBroker` behave like workers attached to the same broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::communicator::{
    BroadcastSubscription, Communicator, CommunicatorError, RawDelivery, RpcInbox, TaskQueue,
    decode_reply,
};
use crate::envelope::{Envelope, EnvelopeKind};

/// Capacity of each per-process RPC inbox.
pub(crate) const RPC_INBOX_CAPACITY: usize = 64;

/// Capacity of the broadcast ring buffer.
pub(crate) const BROADCAST_CAPACITY: usize = 1024;

struct BrokerInner {
    rpc: RwLock<HashMap<String, mpsc::Sender<RawDelivery>>>,
    tasks_tx: Mutex<Option<mpsc::UnboundedSender<RawDelivery>>>,
    tasks_rx: Arc<Mutex<mpsc::UnboundedReceiver<RawDelivery>>>,
    broadcasts: Mutex<Option<broadcast::Sender<Bytes>>>,
    closed: AtomicBool,
}

/// In-process broker shared by any number of runners and clients.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroker")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BrokerInner {
                rpc: RwLock::new(HashMap::new()),
                tasks_tx: Mutex::new(Some(tasks_tx)),
                tasks_rx: Arc::new(Mutex::new(tasks_rx)),
                broadcasts: Mutex::new(Some(broadcast_tx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of processes with an RPC subscriber.
    pub async fn rpc_subscriber_count(&self) -> usize {
        self.inner.rpc.read().await.len()
    }

    fn ensure_open(&self) -> Result<(), CommunicatorError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(CommunicatorError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Communicator for LocalBroker {
    async fn broadcast_send(&self, envelope: Envelope) -> Result<(), CommunicatorError> {
        self.ensure_open()?;
        if envelope.kind != EnvelopeKind::Broadcast {
            return Err(CommunicatorError::Malformed("expected a broadcast envelope"));
        }
        let bytes = envelope.to_frame()?.encode();
        if let Some(tx) = self.inner.broadcasts.lock().await.as_ref() {
            // No subscribers is not an error for broadcasts
            let _ = tx.send(bytes);
        }
        Ok(())
    }

    async fn subscribe_broadcasts(&self) -> Result<BroadcastSubscription, CommunicatorError> {
        self.ensure_open()?;
        let guard = self.inner.broadcasts.lock().await;
        let tx = guard.as_ref().ok_or(CommunicatorError::Closed)?;
        Ok(BroadcastSubscription::new(tx.subscribe()))
    }

    async fn add_rpc_subscriber(&self, process_id: &str) -> Result<RpcInbox, CommunicatorError> {
        self.ensure_open()?;
        let mut rpc = self.inner.rpc.write().await;
        if let Some(existing) = rpc.get(process_id)
            && !existing.is_closed()
        {
            return Err(CommunicatorError::AlreadySubscribed(process_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(RPC_INBOX_CAPACITY);
        rpc.insert(process_id.to_string(), tx);
        debug!(process_id, "RPC subscriber added");
        Ok(RpcInbox::new(rx))
    }

    async fn remove_rpc_subscriber(&self, process_id: &str) {
        if self.inner.rpc.write().await.remove(process_id).is_some() {
            debug!(process_id, "RPC subscriber removed");
        }
    }

    async fn rpc_send(&self, envelope: Envelope) -> Result<Value, CommunicatorError> {
        self.ensure_open()?;
        let target = envelope
            .target_process_id
            .clone()
            .ok_or(CommunicatorError::Malformed("rpc without target_process_id"))?;
        if envelope.method.is_none() {
            return Err(CommunicatorError::Malformed("rpc without method"));
        }

        let sender = self.inner.rpc.read().await.get(&target).cloned();
        let Some(sender) = sender else {
            return Err(CommunicatorError::ProcessNotFound(target));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let raw = RawDelivery {
            frame: envelope.to_frame()?.encode(),
            reply: reply_tx,
        };
        if sender.send(raw).await.is_err() {
            self.inner.rpc.write().await.remove(&target);
            return Err(CommunicatorError::ProcessNotFound(target));
        }

        let reply = reply_rx.await.map_err(|_| CommunicatorError::NoReply)?;
        decode_reply(&target, reply)
    }

    async fn task_send(&self, envelope: Envelope) -> Result<Value, CommunicatorError> {
        self.ensure_open()?;
        if envelope.kind != EnvelopeKind::Task {
            return Err(CommunicatorError::Malformed("expected a task envelope"));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let raw = RawDelivery {
            frame: envelope.to_frame()?.encode(),
            reply: reply_tx,
        };
        {
            let guard = self.inner.tasks_tx.lock().await;
            let tx = guard.as_ref().ok_or(CommunicatorError::Closed)?;
            tx.send(raw).map_err(|_| CommunicatorError::Closed)?;
        }
        let reply = reply_rx.await.map_err(|_| CommunicatorError::NoReply)?;
        decode_reply("task", reply)
    }

    async fn task_queue(&self) -> Result<TaskQueue, CommunicatorError> {
        self.ensure_open()?;
        Ok(TaskQueue::new(self.inner.tasks_rx.clone()))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.rpc.write().await.clear();
        self.inner.tasks_tx.lock().await.take();
        self.inner.broadcasts.lock().await.take();
        info!("Local broker closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RpcMethod;
    use serde_json::json;

    #[tokio::test]
    async fn test_rpc_without_subscriber_is_not_found() {
        let broker = LocalBroker::new();
        let err = broker
            .rpc_send(Envelope::rpc("missing", RpcMethod::Status, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicatorError::ProcessNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_second_subscriber_rejected() {
        let broker = LocalBroker::new();
        let _inbox = broker.add_rpc_subscriber("p1").await.unwrap();
        let err = broker.add_rpc_subscriber("p1").await.unwrap_err();
        assert!(matches!(err, CommunicatorError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn test_dropped_inbox_frees_the_id() {
        let broker = LocalBroker::new();
        let inbox = broker.add_rpc_subscriber("p1").await.unwrap();
        drop(inbox);
        assert!(broker.add_rpc_subscriber("p1").await.is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_succeeds() {
        let broker = LocalBroker::new();
        broker
            .broadcast_send(Envelope::broadcast("p1", "state_changed.created.running", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_calls() {
        let broker = LocalBroker::new();
        broker.close().await;
        assert!(broker.is_closed());
        let err = broker.task_send(Envelope::task(json!({}))).await.unwrap_err();
        assert!(matches!(err, CommunicatorError::Closed));
    }
}
