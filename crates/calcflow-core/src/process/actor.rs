// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The task that drives one live process.
//!
//! An actor owns the process record. It steps the process logic, commits
//! every state transition as a new checkpoint version and answers control
//! RPCs from its inbox in arrival order. Kill and shutdown are honored
//! between steps and while waiting, never in the middle of a step.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use calcflow_protocol::{
    Delivery, Envelope, PROCESS_NOT_FOUND, Responder, RpcError, RpcInbox, RpcMethod,
};
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::logic::{
    Awaitable, Awaiting, ChildOutcome, JobOutcome, PendingChild, ProcessLogic, ResumeValue, Step,
    StepContext, Waiter,
};
use super::record::{
    EXIT_CODE_EXCEPTED, ExitStatus, Failure, FailureKind, ProcessId, ProcessRecord, ProcessState,
};
use super::spec::ProcessSpec;
use crate::error::{CoreError, Result};
use crate::persistence::Bundle;
use crate::runner::RunnerShared;
use crate::runner::status::ProcessStatus;

/// Delay between attempts to observe a child that could not be read.
const CHILD_RETRY_DELAY: Duration = Duration::from_secs(1);

struct PendingKill {
    message: Option<String>,
    responders: Vec<Responder>,
}

pub(crate) struct Actor {
    shared: Arc<RunnerShared>,
    logic: Arc<dyn ProcessLogic>,
    spec: Arc<ProcessSpec>,
    record: ProcessRecord,
    inbox: RpcInbox,
    shutdown: watch::Receiver<bool>,
    kill: Option<PendingKill>,
    /// Resume value received while paused or from `continue`.
    buffered: Option<ResumeValue>,
    /// Loaded from a checkpoint and not yet past its first step or wait.
    /// The load claim counts as a failed resumption until then.
    unconfirmed: bool,
}

impl Actor {
    pub fn new(
        shared: Arc<RunnerShared>,
        logic: Arc<dyn ProcessLogic>,
        record: ProcessRecord,
        inbox: RpcInbox,
        resumed: bool,
    ) -> Self {
        let spec = logic.spec();
        let shutdown = shared.shutdown_rx();
        Self {
            shared,
            logic,
            spec,
            record,
            inbox,
            shutdown,
            kill: None,
            buffered: None,
            unconfirmed: resumed,
        }
    }

    /// Drive the process until it terminates, is released on shutdown or
    /// loses ownership.
    pub fn run(mut self) -> BoxFuture<'static, ()> {
        let span = info_span!(
            "process",
            process_id = %self.record.id,
            process_type = %self.record.process_type
        );
        async move {
            self.drive().await;
            self.finish().await;
        }
        .instrument(span)
        .boxed()
    }

    async fn drive(&mut self) {
        loop {
            if self.record.state.is_terminal() {
                break;
            }
            self.drain_inbox().await;

            if self.kill.is_some() {
                self.do_kill().await;
                break;
            }
            if *self.shutdown.borrow() {
                self.release().await;
                break;
            }

            let idle = self.record.paused
                && (self.record.state != ProcessState::Waiting || self.buffered.is_some());
            let result = if idle {
                self.idle_while_paused().await;
                Ok(())
            } else {
                match self.record.state {
                    ProcessState::Created => self.transition(|r| r.start()).await,
                    ProcessState::Running => match self.step().await {
                        Ok(()) => self.confirm_resume().await,
                        Err(e) => Err(e),
                    },
                    ProcessState::Waiting => self.wait().await,
                    _ => Ok(()),
                }
            };

            if let Err(e) = result {
                // Lost ownership or the store is unavailable
                error!(error = %e, version = self.record.version, "Process driver stopped");
                break;
            }
        }
    }

    async fn drain_inbox(&mut self) {
        while let Some(delivery) = self.inbox.try_recv() {
            self.handle(delivery).await;
        }
    }

    async fn idle_while_paused(&mut self) {
        tokio::select! {
            delivery = recv_or_pending(&mut self.inbox) => self.handle(delivery).await,
            _ = wait_shutdown(&mut self.shutdown) => {}
        }
    }

    async fn handle(&mut self, delivery: Delivery) {
        let (envelope, responder) = delivery.into_parts();
        let Some(method) = envelope.method else {
            responder.respond(Err(RpcError {
                code: "MALFORMED".to_string(),
                message: "rpc without method".to_string(),
            }));
            return;
        };
        debug!(method = %method, "RPC received");

        match method {
            RpcMethod::Status => {
                let status = self.status().await;
                responder.respond(
                    serde_json::to_value(status).map_err(|e| CoreError::from(e).to_rpc_error()),
                );
            }
            RpcMethod::Pause => {
                let changed = !self.record.paused && self.record.pause();
                if changed {
                    info!(state = %self.record.state, "Process paused");
                }
                responder.respond(Ok(json!(changed)));
            }
            RpcMethod::Play => {
                let changed = self.record.paused && self.record.play();
                if changed {
                    info!(state = %self.record.state, "Process resumed");
                }
                responder.respond(Ok(json!(changed)));
            }
            RpcMethod::Kill => {
                let message = envelope
                    .args
                    .as_ref()
                    .and_then(|args| args.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match &mut self.kill {
                    Some(pending) => pending.responders.push(responder),
                    None => {
                        self.kill = Some(PendingKill {
                            message,
                            responders: vec![responder],
                        })
                    }
                }
            }
            RpcMethod::Continue => {
                let on_signal = self.record.state == ProcessState::Waiting
                    && matches!(
                        self.record.awaiting,
                        Some(Awaiting {
                            on: Waiter::Signal { .. },
                            ..
                        })
                    );
                if on_signal && self.buffered.is_none() {
                    let value = envelope
                        .args
                        .and_then(|args| args.get("value").cloned())
                        .unwrap_or(Value::Null);
                    debug!("Signal delivered");
                    self.buffered = Some(ResumeValue::Signal(value));
                    responder.respond(Ok(json!(true)));
                } else {
                    let err = CoreError::InvalidState {
                        process_id: self.record.id.to_string(),
                        expected: "waiting for a signal".to_string(),
                        actual: self.record.state.to_string(),
                    };
                    responder.respond(Err(err.to_rpc_error()));
                }
            }
        }
    }

    async fn status(&self) -> ProcessStatus {
        let mut status = ProcessStatus::from_record(&self.record, true);
        if let Some(calc) = status.calc.as_mut()
            && calc.job_info.is_none()
            && let Some(job_id) = &calc.job_id
            && let Some(env) = self.shared.env.computer(&calc.computer)
        {
            calc.job_info = env.manager.last_info(job_id).await;
        }
        status
    }

    /// Apply `apply` to a copy of the record and commit it.
    async fn transition<F>(&mut self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProcessRecord) -> Result<()>,
    {
        let next = self.record.clone();
        self.commit(next, apply).await
    }

    /// Apply `apply` to `next`, store it as the next checkpoint version and
    /// make it current.
    async fn commit<F>(&mut self, mut next: ProcessRecord, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProcessRecord) -> Result<()>,
    {
        let from = self.record.state;
        apply(&mut next)?;
        next.version = self.record.version + 1;

        let bundle = Bundle::new(next, Some(self.shared.config.runner_id.clone()));
        self.shared
            .store
            .save(&bundle.process.id, bundle.version(), &bundle)
            .await?;
        self.record = bundle.process;
        self.unconfirmed = false;

        let to = self.record.state;
        debug!(version = self.record.version, from = %from, to = %to, "Checkpoint saved");
        if to.is_terminal() {
            self.finalize_provenance().await;
            self.shared.prune_history(&self.record.id).await;
        }
        if from != to {
            self.broadcast_transition(from).await;
        }
        Ok(())
    }

    async fn finalize_provenance(&self) {
        let Some(record_id) = self.record.provenance_id.as_deref() else {
            return;
        };
        let provenance = &self.shared.provenance;
        if let Some(outputs) = &self.record.outputs
            && let Err(e) = provenance.attach_output(record_id, outputs).await
        {
            warn!(error = %e, "Failed to attach outputs to provenance record");
        }
        let status = self.record.exit_status.clone().unwrap_or_else(ExitStatus::ok);
        if let Err(e) = provenance.finalize(record_id, &status).await {
            warn!(error = %e, "Failed to finalize provenance record");
        }
    }

    async fn broadcast_transition(&self, from: ProcessState) {
        let to = self.record.state;
        let subject = format!("state_changed.{from}.{to}");
        let body = json!({
            "process_id": self.record.id,
            "process_type": self.record.process_type,
            "state": to,
            "version": self.record.version,
            "exit_status": self.record.exit_status,
        });
        let envelope = Envelope::broadcast(self.record.id.to_string(), subject, body);
        if let Err(e) = self.shared.communicator.broadcast_send(envelope).await {
            warn!(error = %e, "Failed to broadcast state change");
        }
        match to {
            ProcessState::Finished => info!(
                exit_code = self.record.exit_status.as_ref().map(|s| s.code).unwrap_or(0),
                version = self.record.version,
                "Process finished"
            ),
            ProcessState::Excepted | ProcessState::Killed => info!(
                state = %to,
                version = self.record.version,
                "Process terminated"
            ),
            _ => {}
        }
    }

    async fn step(&mut self) -> Result<()> {
        let mut work = self.record.clone();
        let outcome = {
            let mut ctx = StepContext::new(&mut work);
            AssertUnwindSafe(self.logic.step(&mut ctx)).catch_unwind().await
        };

        let step = match outcome {
            Ok(Ok(step)) => step,
            Ok(Err(e)) => {
                let failure = match e.downcast::<Failure>() {
                    Ok(failure) => failure,
                    Err(e) => Failure::from_anyhow(FailureKind::ProcessLogicError, &e),
                };
                return self.except(work, failure).await;
            }
            Err(panic) => {
                let message = panic_message(panic);
                return self
                    .except(work, Failure::logic(format!("step panicked: {message}")))
                    .await;
            }
        };

        match step {
            Step::Continue => {
                self.record = work;
                Ok(())
            }
            Step::Await { on, then } => {
                let waiter = match on {
                    Awaitable::Children(requests) => {
                        let mut children = Vec::with_capacity(requests.len());
                        for request in requests {
                            if let Err(e) = self.shared.check_launch(
                                &request.process_type,
                                &request.inputs,
                                request.options.as_ref(),
                            ) {
                                let failure = Failure::logic(format!(
                                    "invalid sub-process '{}': {e}",
                                    request.process_type
                                ));
                                return self.except(work, failure).await;
                            }
                            let id = ProcessId::new();
                            work.children.push(id);
                            children.push(PendingChild { id, request });
                        }
                        Waiter::Children { children }
                    }
                    Awaitable::Timer { wake_at } => Waiter::Timer { wake_at },
                    Awaitable::Signal { name } => Waiter::Signal { name },
                    Awaitable::JobUpdate { computer, job_id } => {
                        Waiter::JobUpdate { computer, job_id }
                    }
                };
                self.commit(work, |r| r.wait(Awaiting { on: waiter, then }))
                    .await
            }
            Step::Finish { outputs } => {
                if let Err(e) = self.spec.validate_outputs(&outputs) {
                    return self
                        .except(work, Failure::logic(format!("invalid outputs: {e}")))
                        .await;
                }
                self.commit(work, |r| r.finish(Some(outputs), ExitStatus::ok()))
                    .await
            }
            Step::Fail {
                exit_code,
                message,
                outputs,
            } => {
                if exit_code == 0 {
                    return self
                        .except(work, Failure::logic("failed with exit code 0"))
                        .await;
                }
                info!(exit_code, message = %message, "Process failed");
                self.commit(work, |r| {
                    r.finish(outputs, ExitStatus::with_code(exit_code, message))
                })
                .await
            }
        }
    }

    async fn except(&mut self, work: ProcessRecord, failure: Failure) -> Result<()> {
        error!(kind = %failure.kind, message = %failure.message, "Process excepted");
        self.commit(work, |r| r.except(failure)).await
    }

    /// Checkpoint the unchanged record once a loaded process made it
    /// through a step or back into its wait, clearing the failure count of
    /// the load claim.
    async fn confirm_resume(&mut self) -> Result<()> {
        if !self.unconfirmed || self.record.state.is_terminal() {
            return Ok(());
        }
        self.transition(|_| Ok(())).await?;
        debug!(version = self.record.version, "Resumption confirmed");
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        if let Some(value) = self.buffered.take() {
            return self.transition(|r| r.resume(value)).await;
        }
        let Some(awaiting) = self.record.awaiting.clone() else {
            return self
                .transition(|r| r.except(Failure::logic("waiting without a continuation")))
                .await;
        };
        if let Waiter::Children { children } = &awaiting.on {
            self.ensure_children(children).await;
        }
        self.confirm_resume().await?;

        let mut pending = self.waiter_future(awaiting.on);
        loop {
            tokio::select! {
                value = &mut pending => {
                    if self.record.paused {
                        debug!("Wait resolved while paused");
                        self.buffered = Some(value);
                        return Ok(());
                    }
                    return self.transition(|r| r.resume(value)).await;
                }
                delivery = recv_or_pending(&mut self.inbox) => {
                    self.handle(delivery).await;
                    if self.kill.is_some() {
                        return Ok(());
                    }
                    if self.buffered.is_some() && !self.record.paused {
                        return Ok(());
                    }
                }
                _ = wait_shutdown(&mut self.shutdown) => return Ok(()),
            }
        }
    }

    /// Launch children recorded in the checkpoint that are neither live nor
    /// stored, e.g. after a crash between the wait commit and their launch.
    async fn ensure_children(&self, children: &[PendingChild]) {
        for child in children {
            if self.shared.is_live(&child.id) {
                continue;
            }
            match self.shared.store.load(&child.id).await {
                Ok(bundle) => {
                    let runner_id = &self.shared.config.runner_id;
                    let ours = bundle.owner.as_ref().is_none_or(|owner| owner == runner_id);
                    if !bundle.process.state.is_terminal() && ours {
                        if let Err(e) = self.shared.load_process(child.id, false).await {
                            debug!(child = %child.id, error = %e, "Child not loaded");
                        }
                    }
                }
                Err(CoreError::ProcessNotFound { .. }) => {
                    if let Err(e) = self.shared.launch_child(self.record.id, child).await {
                        error!(child = %child.id, error = %e, "Failed to launch sub-process");
                    }
                }
                Err(e) => warn!(child = %child.id, error = %e, "Failed to read sub-process"),
            }
        }
    }

    fn waiter_future(&self, on: Waiter) -> BoxFuture<'static, ResumeValue> {
        match on {
            Waiter::Children { children } => {
                let shared = self.shared.clone();
                async move {
                    let mut outcomes = Vec::with_capacity(children.len());
                    for child in children {
                        outcomes.push(child_outcome(&shared, child).await);
                    }
                    ResumeValue::Children(outcomes)
                }
                .boxed()
            }
            Waiter::Timer { wake_at } => async move {
                let delay = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;
                ResumeValue::Timer
            }
            .boxed(),
            Waiter::Signal { .. } => futures::future::pending().boxed(),
            Waiter::JobUpdate { computer, job_id } => {
                let manager = self.shared.env.computer(&computer).map(|c| c.manager.clone());
                async move {
                    let Some(manager) = manager else {
                        let failure = Failure::new(
                            FailureKind::SchedulerError,
                            format!("unknown computer '{computer}'"),
                        );
                        return ResumeValue::Job(JobOutcome::Failed { failure });
                    };
                    match manager.request_update(&job_id).await.await {
                        Ok(outcome) => ResumeValue::Job(outcome),
                        // Polling stopped for shutdown
                        Err(_) => futures::future::pending().await,
                    }
                }
                .boxed()
            }
        }
    }

    async fn do_kill(&mut self) {
        let Some(PendingKill {
            message,
            responders,
        }) = self.kill.take()
        else {
            return;
        };
        info!(message = ?message, state = %self.record.state, "Killing process");

        let mut work = self.record.clone();
        {
            let mut ctx = StepContext::new(&mut work);
            if AssertUnwindSafe(self.logic.on_kill(&mut ctx))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!("Kill hook panicked");
            }
        }

        // Each kill resolves once the child committed its own kill, however
        // long its current step runs
        let children = self.record.children.clone();
        let kills = children
            .iter()
            .map(|id| self.shared.kill_process(*id, message.clone()));
        for (id, result) in children.iter().zip(join_all(kills).await) {
            if let Err(e) = result {
                warn!(child = %id, error = %e, "Failed to kill sub-process");
            }
        }

        let reply = match self.commit(work, |r| r.kill(message)).await {
            Ok(()) => Ok(json!(true)),
            Err(e) => {
                error!(error = %e, "Failed to commit kill");
                Err(e.to_rpc_error())
            }
        };
        for responder in responders {
            responder.respond(reply.clone());
        }
    }

    /// Store a snapshot owned by nobody so any runner can pick it up.
    async fn release(&mut self) {
        let mut next = self.record.clone();
        if let Some(value) = self.buffered.take()
            && next.state == ProcessState::Waiting
            && let Err(e) = next.resume(value)
        {
            warn!(error = %e, "Dropping buffered resume value");
        }
        next.version = self.record.version + 1;

        let bundle = Bundle::new(next, None);
        match self
            .shared
            .store
            .save(&bundle.process.id, bundle.version(), &bundle)
            .await
        {
            Ok(()) => {
                self.record = bundle.process;
                info!(state = %self.record.state, version = self.record.version, "Process released");
            }
            Err(e) => warn!(error = %e, "Failed to release process"),
        }
    }

    async fn finish(mut self) {
        let id = self.record.id.to_string();
        self.shared.communicator.remove_rpc_subscriber(&id).await;

        let gone = RpcError {
            code: PROCESS_NOT_FOUND.to_string(),
            message: format!("process {id} is no longer running here"),
        };
        while let Some(delivery) = self.inbox.try_recv() {
            delivery.respond(Err(gone.clone()));
        }
        if let Some(kill) = self.kill.take() {
            for responder in kill.responders {
                responder.respond(Err(gone.clone()));
            }
        }

        self.shared.deregister(&self.record.id);
        debug!(state = %self.record.state, version = self.record.version, "Process actor stopped");
    }
}

/// Wait for a child to reach a terminal state.
async fn child_outcome(shared: &Arc<RunnerShared>, child: PendingChild) -> ChildOutcome {
    loop {
        match shared.wait_terminal(child.id).await {
            Ok(record) => {
                return ChildOutcome {
                    id: child.id,
                    key: child.request.key,
                    state: record.state,
                    outputs: record.outputs,
                    exit_status: record.exit_status,
                };
            }
            Err(CoreError::ProcessNotFound { .. }) => {
                let message = format!("sub-process {} was never started", child.id);
                return ChildOutcome {
                    id: child.id,
                    key: child.request.key,
                    state: ProcessState::Excepted,
                    outputs: None,
                    exit_status: Some(ExitStatus {
                        code: EXIT_CODE_EXCEPTED,
                        message: Some(message.clone()),
                        failure: Some(Failure::logic(message)),
                    }),
                };
            }
            Err(e) => {
                warn!(child = %child.id, error = %e, "Failed to observe sub-process, retrying");
                tokio::time::sleep(CHILD_RETRY_DELAY).await;
            }
        }
    }
}

async fn recv_or_pending(inbox: &mut RpcInbox) -> Delivery {
    match inbox.recv().await {
        Some(delivery) => delivery,
        None => futures::future::pending().await,
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves once shutdown is signalled or the runner is gone.
///
/// The `watch::Ref` is dropped here so callers can await in the
/// `select!` arm that follows.
pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(3u8)), "unknown panic");
    }
}
