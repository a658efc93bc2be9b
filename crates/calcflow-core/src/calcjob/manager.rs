// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batched scheduler polling.
//!
//! One manager per computer. Calculations waiting for their job register a
//! waiter; a single polling task runs while there are waiters and issues
//! one status command for all of them per poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use calcflow_environment::retry::jittered_duration;
use calcflow_environment::{Connection, JobInfo, Scheduler, TransportError, TransportPool};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::process::actor::wait_shutdown;
use crate::process::{Failure, JobOutcome};

/// Polling configuration of a manager.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Fraction of the interval that is randomized.
    pub jitter: f64,
    /// Consecutive failed polls tolerated before waiters are failed.
    pub max_transport_retries: u32,
}

#[derive(Default)]
struct PollState {
    waiters: HashMap<String, Vec<oneshot::Sender<JobOutcome>>>,
    last_info: HashMap<String, JobInfo>,
    polling: bool,
    consecutive_failures: u32,
}

struct Inner {
    computer: String,
    pool: Arc<TransportPool>,
    scheduler: Arc<dyn Scheduler>,
    settings: PollSettings,
    state: Mutex<PollState>,
    shutdown: watch::Receiver<bool>,
}

/// Scheduler status poller of one computer.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        computer: impl Into<String>,
        pool: Arc<TransportPool>,
        scheduler: Arc<dyn Scheduler>,
        settings: PollSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                computer: computer.into(),
                pool,
                scheduler,
                settings,
                state: Mutex::new(PollState::default()),
                shutdown,
            }),
        }
    }

    /// Wait for `job_id` to finish.
    ///
    /// The receiver resolves once the job is reported done, disappears from
    /// the listing, or polling gives up. It errors if the manager shuts down
    /// first.
    pub async fn request_update(&self, job_id: &str) -> oneshot::Receiver<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock().await;
        state.waiters.entry(job_id.to_string()).or_default().push(tx);
        if !state.polling {
            state.polling = true;
            let inner = self.inner.clone();
            tokio::spawn(async move { poll_loop(inner).await });
        }
        rx
    }

    /// Latest report for a job that is still queued or running.
    pub async fn last_info(&self, job_id: &str) -> Option<JobInfo> {
        self.inner.state.lock().await.last_info.get(job_id).cloned()
    }

    /// Jobs that currently have waiters.
    pub async fn watched_jobs(&self) -> usize {
        self.inner.state.lock().await.waiters.len()
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    debug!(computer = %inner.computer, "Job polling started");
    let mut shutdown = inner.shutdown.clone();

    loop {
        let delay = jittered_duration(inner.settings.interval, inner.settings.jitter);
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => {
                info!(computer = %inner.computer, "Job polling shutting down");
                let mut state = inner.state.lock().await;
                state.waiters.clear();
                state.polling = false;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let job_ids = {
            let mut state = inner.state.lock().await;
            for senders in state.waiters.values_mut() {
                senders.retain(|tx| !tx.is_closed());
            }
            state.waiters.retain(|_, senders| !senders.is_empty());
            if state.waiters.is_empty() {
                state.polling = false;
                debug!(computer = %inner.computer, "Job polling idle");
                return;
            }
            let mut ids: Vec<String> = state.waiters.keys().cloned().collect();
            ids.sort();
            ids
        };

        poll_once(&inner, &job_ids).await;
    }
}

async fn query(inner: &Inner, job_ids: &[String]) -> Result<calcflow_environment::CommandOutput, TransportError> {
    let conn = inner.pool.acquire(&inner.computer).await?;
    conn.exec(&inner.scheduler.render_status_query(job_ids), None)
        .await
}

async fn poll_once(inner: &Inner, job_ids: &[String]) {
    let output = query(inner, job_ids).await;
    let mut state = inner.state.lock().await;

    let output = match output {
        Ok(output) => {
            state.consecutive_failures = 0;
            output
        }
        Err(e) => {
            state.consecutive_failures += 1;
            if state.consecutive_failures <= inner.settings.max_transport_retries {
                warn!(
                    computer = %inner.computer,
                    failures = state.consecutive_failures,
                    error = %e,
                    "Status poll failed, retrying on next poll"
                );
                return;
            }
            error!(
                computer = %inner.computer,
                failures = state.consecutive_failures,
                error = %e,
                "Status polling gave up"
            );
            state.consecutive_failures = 0;
            let failure = Failure::transport(&e);
            for id in job_ids {
                resolve(&mut state, id, JobOutcome::Failed {
                    failure: failure.clone(),
                });
            }
            return;
        }
    };

    let jobs = match inner.scheduler.parse_status_output(&output) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(computer = %inner.computer, error = %e, "Unparsable status output");
            let failure = Failure::scheduler(&e);
            for id in job_ids {
                resolve(&mut state, id, JobOutcome::Failed {
                    failure: failure.clone(),
                });
            }
            return;
        }
    };

    for id in job_ids {
        match jobs.get(id) {
            Some(info) if info.state.is_done() => {
                debug!(computer = %inner.computer, job_id = %id, "Job done");
                resolve(&mut state, id, JobOutcome::Done {
                    info: Some(info.clone()),
                });
            }
            Some(info) => {
                debug!(computer = %inner.computer, job_id = %id, state = %info.state, "Job still active");
                state.last_info.insert(id.clone(), info.clone());
            }
            None => {
                info!(computer = %inner.computer, job_id = %id, "Job vanished from listing");
                resolve(&mut state, id, JobOutcome::Done { info: None });
            }
        }
    }
}

fn resolve(state: &mut PollState, job_id: &str, outcome: JobOutcome) {
    state.last_info.remove(job_id);
    for tx in state.waiters.remove(job_id).unwrap_or_default() {
        let _ = tx.send(outcome.clone());
    }
}
