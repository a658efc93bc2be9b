// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message envelopes exchanged over the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::frame::{Frame, FrameError, MessageType};

/// Envelope kind, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Broadcast,
    Rpc,
    Task,
}

impl EnvelopeKind {
    fn message_type(self) -> MessageType {
        match self {
            Self::Broadcast => MessageType::Broadcast,
            Self::Rpc => MessageType::Rpc,
            Self::Task => MessageType::Task,
        }
    }
}

/// Control methods a process answers over RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    Pause,
    Play,
    Kill,
    Status,
    /// Deliver an external signal to a waiting process.
    Continue,
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Play => "play",
            Self::Kill => "kill",
            Self::Status => "status",
            Self::Continue => "continue",
        };
        f.write_str(s)
    }
}

/// A broker message.
///
/// Which optional fields are populated depends on `kind`:
/// broadcasts carry `sender`, `subject` and `body`; RPCs carry
/// `target_process_id`, `method` and `args`; tasks carry `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<RpcMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Envelope {
    pub fn broadcast(sender: impl Into<String>, subject: impl Into<String>, body: Value) -> Self {
        Self {
            kind: EnvelopeKind::Broadcast,
            target_process_id: None,
            method: None,
            args: None,
            correlation_id: Uuid::new_v4(),
            sender: Some(sender.into()),
            subject: Some(subject.into()),
            body: Some(body),
        }
    }

    pub fn rpc(target: impl Into<String>, method: RpcMethod, args: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Rpc,
            target_process_id: Some(target.into()),
            method: Some(method),
            args,
            correlation_id: Uuid::new_v4(),
            sender: None,
            subject: None,
            body: None,
        }
    }

    pub fn task(body: Value) -> Self {
        Self {
            kind: EnvelopeKind::Task,
            target_process_id: None,
            method: None,
            args: None,
            correlation_id: Uuid::new_v4(),
            sender: None,
            subject: None,
            body: Some(body),
        }
    }

    /// Attach the identity of the sending client.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::new(self.kind.message_type(), self)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        frame.decode()
    }
}

/// Error payload of a failed RPC or task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Machine-readable code, e.g. `PROCESS_NOT_FOUND`.
    pub code: String,
    pub message: String,
}

/// Reply to an RPC or task, correlated by `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub correlation_id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(correlation_id: Uuid, result: Value) -> Self {
        Self {
            correlation_id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(correlation_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            ok: false,
            result: None,
            error: Some(RpcError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::new(MessageType::Response, self)
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or_else(|| RpcError {
            code: "UNKNOWN".to_string(),
            message: "error reply without details".to_string(),
        }))
    }
}

/// Subscription change a remote client asks the broker server to make on
/// its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    SubscribeBroadcasts,
    AddRpcSubscriber { process_id: String },
    RemoveRpcSubscriber { process_id: String },
    /// Join the competing consumers of the task queue.
    ConsumeTasks,
}

/// Control message, acknowledged with an [`RpcResponse`] carrying the same
/// correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub correlation_id: Uuid,
    #[serde(flatten)]
    pub op: ControlOp,
}

impl ControlRequest {
    pub fn new(op: ControlOp) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            op,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::new(MessageType::Control, self)
    }
}
