// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! calcflow protocol - broker messaging layer
//!
//! This crate defines how runners, processes and clients talk to each other:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    calcflow-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Communicator: broadcast / RPC / task (competing consumers) │
//! │    LocalBroker (in-process) · BrokerServer / RemoteBroker   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelope: JSON message with correlation id                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frame: [u32 length][u16 type][payload]                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use calcflow_protocol::{Communicator, Envelope, LocalBroker, RpcMethod};
//!
//! let broker = LocalBroker::new();
//! let mut inbox = broker.add_rpc_subscriber("proc-1").await?;
//!
//! tokio::spawn(async move {
//!     while let Some(call) = inbox.recv().await {
//!         call.respond(Ok(serde_json::json!({"state": "running"})));
//!     }
//! });
//!
//! let status = broker
//!     .rpc_send(Envelope::rpc("proc-1", RpcMethod::Status, None))
//!     .await?;
//! ```

pub mod client;
pub mod communicator;
pub mod envelope;
pub mod frame;
pub mod local;
pub mod server;

pub use client::{ClientError, RemoteBroker, RemoteBrokerConfig};
pub use communicator::{
    BroadcastSubscription, Communicator, CommunicatorError, Delivery, PROCESS_NOT_FOUND,
    Responder, RpcInbox, TaskQueue,
};
pub use envelope::{ControlOp, ControlRequest, Envelope, EnvelopeKind, RpcError, RpcMethod, RpcResponse};
pub use frame::{Frame, FrameError, MessageType};
pub use local::LocalBroker;
pub use server::{BrokerServer, BrokerServerConfig, ServerError};
