// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Communicator contract.
//!
//! A communicator carries three kinds of traffic:
//! - broadcasts: at-most-once announcements, never block the sender
//! - RPCs: control calls routed to the single subscriber of a process id
//! - tasks: work items handed to exactly one of the competing consumers
//!
//! Subscribers receive raw frames and decode them here, so any broker
//! implementation only has to move bytes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, RpcError, RpcResponse};
use crate::frame::{Frame, FrameError};

/// Error code a subscriber uses when it no longer owns the addressed process.
pub const PROCESS_NOT_FOUND: &str = "PROCESS_NOT_FOUND";

/// Error code relayed by a broker server when the subscriber dropped a call.
pub const NO_REPLY: &str = "NO_REPLY";

/// Error code relayed by a broker server when a process id is already owned.
pub const ALREADY_SUBSCRIBED: &str = "ALREADY_SUBSCRIBED";

/// Error code for broker failures that have no dedicated code.
pub const BROKER_ERROR: &str = "BROKER_ERROR";

/// Errors from communicator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommunicatorError {
    /// No subscriber owns the target process.
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// Another subscriber already owns the process id.
    #[error("process {0} already has an RPC subscriber")]
    AlreadySubscribed(String),

    /// The subscriber answered with an error.
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    /// The envelope is missing a field required for its kind.
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),

    /// The subscriber dropped the call without answering.
    #[error("no reply received")]
    NoReply,

    #[error("communicator closed")]
    Closed,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Raw message moved through broker channels.
#[derive(Debug)]
pub struct RawDelivery {
    pub frame: Bytes,
    pub reply: oneshot::Sender<Bytes>,
}

/// A decoded RPC or task together with its reply slot.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    responder: Responder,
}

impl Delivery {
    pub fn correlation_id(&self) -> Uuid {
        self.envelope.correlation_id
    }

    /// Split into the envelope and the responder.
    pub fn into_parts(self) -> (Envelope, Responder) {
        (self.envelope, self.responder)
    }

    pub fn respond(self, result: Result<Value, RpcError>) {
        self.responder.respond(result);
    }
}

/// One-shot reply slot of a delivery.
#[derive(Debug)]
pub struct Responder {
    correlation_id: Uuid,
    tx: oneshot::Sender<Bytes>,
}

impl Responder {
    pub fn respond(self, result: Result<Value, RpcError>) {
        let response = match result {
            Ok(value) => RpcResponse::ok(self.correlation_id, value),
            Err(e) => RpcResponse::err(self.correlation_id, e.code, e.message),
        };
        match response.to_frame() {
            Ok(frame) => {
                if self.tx.send(frame.encode()).is_err() {
                    debug!(correlation_id = %self.correlation_id, "Caller went away before reply");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode reply"),
        }
    }
}

fn decode_delivery(raw: RawDelivery) -> Option<Delivery> {
    let envelope = Frame::decode_from_bytes(raw.frame)
        .and_then(|frame| Envelope::from_frame(&frame));
    match envelope {
        Ok(envelope) => Some(Delivery {
            responder: Responder {
                correlation_id: envelope.correlation_id,
                tx: raw.reply,
            },
            envelope,
        }),
        Err(e) => {
            warn!(error = %e, "Dropping undecodable delivery");
            None
        }
    }
}

/// Per-process RPC inbox. Calls arrive in the order they were sent.
#[derive(Debug)]
pub struct RpcInbox {
    rx: mpsc::Receiver<RawDelivery>,
}

impl RpcInbox {
    pub fn new(rx: mpsc::Receiver<RawDelivery>) -> Self {
        Self { rx }
    }

    /// Next call, or `None` once the subscription is removed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let raw = self.rx.recv().await?;
            if let Some(delivery) = decode_delivery(raw) {
                return Some(delivery);
            }
        }
    }

    /// Next call if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        while let Ok(raw) = self.rx.try_recv() {
            if let Some(delivery) = decode_delivery(raw) {
                return Some(delivery);
            }
        }
        None
    }
}

/// Handle onto the shared task queue. Clones compete for the same items.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<RawDelivery>>>,
}

impl TaskQueue {
    pub fn new(rx: Arc<Mutex<mpsc::UnboundedReceiver<RawDelivery>>>) -> Self {
        Self { rx }
    }

    /// Take the next task, or `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let raw = self.rx.lock().await.recv().await?;
            if let Some(delivery) = decode_delivery(raw) {
                return Some(delivery);
            }
        }
    }
}

/// Broadcast subscription. Slow subscribers lose messages rather than
/// holding up senders.
#[derive(Debug)]
pub struct BroadcastSubscription {
    rx: broadcast::Receiver<Bytes>,
}

impl BroadcastSubscription {
    pub fn new(rx: broadcast::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next broadcast, or `None` once the communicator is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => {
                    match Frame::decode_from_bytes(bytes).and_then(|f| Envelope::from_frame(&f)) {
                        Ok(envelope) => return Some(envelope),
                        Err(e) => warn!(error = %e, "Dropping undecodable broadcast"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Broadcast subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Decode a reply frame into the call result.
pub fn decode_reply(target: &str, bytes: Bytes) -> Result<Value, CommunicatorError> {
    let frame = Frame::decode_from_bytes(bytes)?;
    let response: RpcResponse = frame.decode()?;
    response.into_result().map_err(|e| match e.code.as_str() {
        PROCESS_NOT_FOUND => CommunicatorError::ProcessNotFound(target.to_string()),
        ALREADY_SUBSCRIBED => CommunicatorError::AlreadySubscribed(target.to_string()),
        NO_REPLY => CommunicatorError::NoReply,
        _ => CommunicatorError::Remote {
            code: e.code,
            message: e.message,
        },
    })
}

/// Encode a call outcome so [`decode_reply`] on the far side of a network
/// hop yields the same error variant.
pub fn reply_for(correlation_id: Uuid, result: Result<Value, CommunicatorError>) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::ok(correlation_id, value),
        Err(CommunicatorError::ProcessNotFound(id)) => {
            RpcResponse::err(correlation_id, PROCESS_NOT_FOUND, format!("process not found: {id}"))
        }
        Err(CommunicatorError::AlreadySubscribed(id)) => RpcResponse::err(
            correlation_id,
            ALREADY_SUBSCRIBED,
            format!("process {id} already has an RPC subscriber"),
        ),
        Err(CommunicatorError::NoReply) => {
            RpcResponse::err(correlation_id, NO_REPLY, "no reply received")
        }
        Err(CommunicatorError::Remote { code, message }) => {
            RpcResponse::err(correlation_id, code, message)
        }
        Err(e) => RpcResponse::err(correlation_id, BROKER_ERROR, e.to_string()),
    }
}

/// Queue a reply on a connection's outbound frames.
pub(crate) fn send_response(out: &mpsc::UnboundedSender<Frame>, response: RpcResponse) {
    match response.to_frame() {
        Ok(frame) => {
            if out.send(frame).is_err() {
                debug!(correlation_id = %response.correlation_id, "Connection closed before reply");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode reply"),
    }
}

/// Broker-backed messaging used to control and observe processes.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Publish a broadcast. Never waits for subscribers.
    async fn broadcast_send(&self, envelope: Envelope) -> Result<(), CommunicatorError>;

    async fn subscribe_broadcasts(&self) -> Result<BroadcastSubscription, CommunicatorError>;

    /// Become the single RPC subscriber for `process_id`.
    async fn add_rpc_subscriber(&self, process_id: &str) -> Result<RpcInbox, CommunicatorError>;

    async fn remove_rpc_subscriber(&self, process_id: &str);

    /// Send an RPC and wait for the reply.
    ///
    /// Fails with [`CommunicatorError::ProcessNotFound`] when nobody owns
    /// the target.
    async fn rpc_send(&self, envelope: Envelope) -> Result<Value, CommunicatorError>;

    /// Queue a task for one consumer and wait for its reply.
    async fn task_send(&self, envelope: Envelope) -> Result<Value, CommunicatorError>;

    async fn task_queue(&self) -> Result<TaskQueue, CommunicatorError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}
