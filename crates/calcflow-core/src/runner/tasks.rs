// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task queue handling.
//!
//! Tasks are how work reaches a pool of runners: every runner consumes from
//! the same queue and each task is taken by exactly one of them.

use std::sync::Arc;

use calcflow_protocol::{Communicator, Envelope, TaskQueue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{LaunchRequest, RunnerShared};
use crate::error::{CoreError, Result};
use crate::process::ProcessId;
use crate::process::actor::wait_shutdown;

/// Body of a task envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskBody {
    /// Create and run a new process.
    Launch(LaunchRequest),
    /// Load a checkpointed process and continue running it.
    Continue { process_id: ProcessId },
}

/// Queue a launch for whichever runner takes it first.
pub async fn launch_task(
    communicator: &dyn Communicator,
    request: LaunchRequest,
) -> Result<ProcessId> {
    send(communicator, TaskBody::Launch(request)).await
}

/// Ask any runner to load and continue `process_id`.
pub async fn continue_task(communicator: &dyn Communicator, process_id: ProcessId) -> Result<ProcessId> {
    send(communicator, TaskBody::Continue { process_id }).await
}

async fn send(communicator: &dyn Communicator, body: TaskBody) -> Result<ProcessId> {
    let reply = communicator
        .task_send(Envelope::task(serde_json::to_value(&body)?))
        .await?;
    let id = reply
        .get("process_id")
        .cloned()
        .ok_or_else(|| CoreError::Serialization("task reply without process_id".to_string()))?;
    Ok(serde_json::from_value(id)?)
}

pub(crate) async fn consume(
    shared: Arc<RunnerShared>,
    queue: TaskQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(runner_id = %shared.config.runner_id, "Task consumer started");
    loop {
        let delivery = tokio::select! {
            biased;

            _ = wait_shutdown(&mut shutdown) => break,
            delivery = queue.next() => delivery,
        };
        let Some(delivery) = delivery else {
            debug!("Task queue closed");
            break;
        };

        let (envelope, responder) = delivery.into_parts();
        let result = handle(&shared, envelope.body).await;
        if let Err(e) = &result {
            warn!(error = %e, "Task rejected");
        }
        responder.respond(
            result
                .map(|id| json!({ "process_id": id }))
                .map_err(|e| e.to_rpc_error()),
        );
    }
    info!(runner_id = %shared.config.runner_id, "Task consumer stopped");
}

async fn handle(shared: &Arc<RunnerShared>, body: Option<Value>) -> Result<ProcessId> {
    let body = body.ok_or_else(|| CoreError::validation("body", "task without body"))?;
    let task: TaskBody = serde_json::from_value(body)
        .map_err(|e| CoreError::validation("body", e.to_string()))?;
    match task {
        TaskBody::Launch(request) => {
            debug!(process_type = %request.process_type, "Launch task received");
            shared.submit(request).await
        }
        TaskBody::Continue { process_id } => {
            debug!(process_id = %process_id, "Continue task received");
            shared.load_process(process_id, false).await?;
            Ok(process_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_body_shape() {
        let body = TaskBody::Launch(LaunchRequest::new("double", json!({"x": 1})));
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["task"], "launch");
        assert_eq!(value["process_type"], "double");

        let id = ProcessId::new();
        let value = serde_json::to_value(TaskBody::Continue { process_id: id }).unwrap();
        assert_eq!(value["task"], "continue");
        let back: TaskBody = serde_json::from_value(value).unwrap();
        assert_eq!(back, TaskBody::Continue { process_id: id });
    }
}
