// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The runner: hosts live processes and routes work to them.
//!
//! # Example
//!
//! ```rust,ignore
//! use calcflow_core::{LaunchRequest, Runner, RunnerConfig};
//!
//! let runner = Runner::builder()
//!     .config(RunnerConfig::from_env()?)
//!     .registry(registry)
//!     .build()
//!     .await?;
//! runner.start().await?;
//!
//! let id = runner.submit(LaunchRequest::new("double", json!({"x": 1}))).await?;
//! let record = runner.wait_for(id).await?;
//!
//! runner.shutdown().await?;
//! ```

pub mod status;
pub mod tasks;

pub use self::status::{CalcStatus, ProcessStatus, StatusNode};
pub use self::tasks::{TaskBody, continue_task, launch_task};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use calcflow_environment::TransportPool;
use calcflow_protocol::{Communicator, CommunicatorError, Envelope, LocalBroker, RpcMethod};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calcjob::manager::PollSettings;
use crate::calcjob::{CalcEnv, CalcJobProcess, CalcJobState, ComputerEnv, JobManager, JobOptions};
use crate::config::RunnerConfig;
use crate::error::{CoreError, Result};
use crate::persistence::{Bundle, BundleSummary, CheckpointStore, MemoryCheckpointStore, ProcessFilter};
use crate::process::actor::Actor;
use crate::process::{Failure, PendingChild, ProcessId, ProcessLogic, ProcessRecord};
use crate::provenance::{MemoryProvenance, Provenance};
use crate::registry::{PluginRegistry, ProcessFactory};

/// How often `wait_for` re-reads the store when no broadcast arrives.
const WAIT_RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Request to create a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub process_type: String,
    #[serde(default)]
    pub inputs: Value,
    /// Required for calculations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JobOptions>,
}

impl LaunchRequest {
    pub fn new(process_type: impl Into<String>, inputs: Value) -> Self {
        Self {
            process_type: process_type.into(),
            inputs,
            options: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// State shared by the runner handle, its actors and the task consumer.
pub(crate) struct RunnerShared {
    pub config: RunnerConfig,
    pub store: Arc<dyn CheckpointStore>,
    pub communicator: Arc<dyn Communicator>,
    pub registry: PluginRegistry,
    pub provenance: Arc<dyn Provenance>,
    pub env: Arc<CalcEnv>,
    live: Mutex<HashMap<ProcessId, JoinHandle<()>>>,
    tasks: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunnerShared {
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Trim the checkpoint history of a process that reached a terminal state.
    pub async fn prune_history(&self, id: &ProcessId) {
        let keep = self.config.checkpoint_retention;
        if keep == 0 {
            return;
        }
        match self.store.prune(id, keep).await {
            Ok(0) => {}
            Ok(removed) => debug!(process_id = %id, removed, "Pruned checkpoint history"),
            Err(e) => warn!(process_id = %id, error = %e, "Failed to prune checkpoint history"),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn is_live(&self, id: &ProcessId) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn deregister(&self, id: &ProcessId) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn logic_for(&self, factory: &ProcessFactory) -> Arc<dyn ProcessLogic> {
        match factory {
            ProcessFactory::Workflow(logic) => logic.clone(),
            ProcessFactory::CalcJob(logic) => {
                Arc::new(CalcJobProcess::new(logic.clone(), self.env.clone()))
            }
        }
    }

    /// Validate a launch without creating anything.
    pub fn check_launch(
        &self,
        process_type: &str,
        inputs: &Value,
        options: Option<&JobOptions>,
    ) -> Result<()> {
        let factory = self.registry.process(process_type)?;
        factory.spec().validate_inputs(inputs)?;
        if let ProcessFactory::CalcJob(_) = factory {
            let options = options.ok_or_else(|| {
                CoreError::validation("options", "calculations require job options")
            })?;
            if self.env.computer(&options.computer).is_none() {
                return Err(CoreError::UnknownComputer(options.computer.clone()));
            }
        }
        Ok(())
    }

    async fn launch(
        self: &Arc<Self>,
        id: ProcessId,
        request: LaunchRequest,
        parent: Option<ProcessId>,
    ) -> Result<ProcessId> {
        if self.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }
        self.check_launch(&request.process_type, &request.inputs, request.options.as_ref())?;
        let factory = self.registry.process(&request.process_type)?.clone();
        let spec = factory.spec();
        let kind = factory.kind();

        let mut record = ProcessRecord::new(id, &request.process_type, kind, request.inputs, parent);
        if let (ProcessFactory::CalcJob(_), Some(options)) = (&factory, &request.options) {
            record.calc = Some(CalcJobState::new(options.computer.clone()));
        }
        record.options = request.options;
        record.provenance_id = Some(
            self.provenance
                .create_record(kind, &spec, &record.inputs)
                .await?,
        );

        let logic = self.logic_for(&factory);
        self.spawn_actor(record, logic, false).await?;
        info!(
            process_id = %id,
            process_type = %request.process_type,
            parent = ?parent,
            "Process submitted"
        );
        Ok(id)
    }

    pub async fn submit(self: &Arc<Self>, request: LaunchRequest) -> Result<ProcessId> {
        self.launch(ProcessId::new(), request, None).await
    }

    pub async fn launch_child(
        self: &Arc<Self>,
        parent: ProcessId,
        child: &PendingChild,
    ) -> Result<ProcessId> {
        let request = LaunchRequest {
            process_type: child.request.process_type.clone(),
            inputs: child.request.inputs.clone(),
            options: child.request.options.clone(),
        };
        self.launch(child.id, request, Some(parent)).await
    }

    async fn spawn_actor(
        self: &Arc<Self>,
        record: ProcessRecord,
        logic: Arc<dyn ProcessLogic>,
        resumed: bool,
    ) -> Result<()> {
        let id = record.id;
        let inbox = self.communicator.add_rpc_subscriber(&id.to_string()).await?;
        let actor = Actor::new(self.clone(), logic, record, inbox, resumed);

        // Held across spawn so a fast actor cannot deregister before insert
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.insert(id, tokio::spawn(actor.run()));
        Ok(())
    }

    /// Claim a checkpointed process and start driving it.
    pub async fn load_process(self: &Arc<Self>, id: ProcessId, force: bool) -> Result<()> {
        if self.is_shutting_down() {
            return Err(CoreError::ShuttingDown);
        }
        if self.is_live(&id) {
            return Ok(());
        }

        let bundle = self.store.load(&id).await?;
        let runner_id = &self.config.runner_id;
        if bundle.process.state.is_terminal() {
            return Err(CoreError::InvalidState {
                process_id: id.to_string(),
                expected: "non-terminal".to_string(),
                actual: bundle.process.state.to_string(),
            });
        }
        if let Some(owner) = &bundle.owner
            && owner != runner_id
            && !force
        {
            return Err(CoreError::ProcessOwned {
                process_id: id.to_string(),
                owner: owner.clone(),
            });
        }
        let factory = self.registry.process(&bundle.process.process_type)?.clone();

        let failures = bundle.resume_failures + 1;
        let mut claimed = bundle.process;
        claimed.version += 1;

        if failures > self.config.max_resume_failures {
            warn!(
                process_id = %id,
                failures = bundle.resume_failures,
                "Giving up on process that keeps failing to resume"
            );
            claimed.except(Failure::logic(format!(
                "gave up after {} failed resumptions",
                bundle.resume_failures
            )))?;
            let excepted = Bundle::new(claimed, Some(runner_id.clone()));
            self.store.save(&id, excepted.version(), &excepted).await?;
            self.prune_history(&id).await;
            if let Some(record_id) = &excepted.process.provenance_id
                && let Some(status) = &excepted.process.exit_status
                && let Err(e) = self.provenance.finalize(record_id, status).await
            {
                warn!(process_id = %id, error = %e, "Failed to finalize provenance record");
            }
            return Ok(());
        }

        let mut claim = Bundle::new(claimed, Some(runner_id.clone()));
        claim.resume_failures = failures;
        self.store.save(&id, claim.version(), &claim).await?;
        info!(
            process_id = %id,
            version = claim.version(),
            state = %claim.process.state,
            forced = force,
            "Process loaded"
        );

        let logic = self.logic_for(&factory);
        self.spawn_actor(claim.process, logic, true).await
    }

    /// Control call bounded by the configured RPC timeout.
    pub async fn rpc(&self, id: ProcessId, method: RpcMethod, args: Option<Value>) -> Result<Value> {
        self.call(id, method, args, Some(self.config.rpc_timeout))
            .await
    }

    async fn call(
        &self,
        id: ProcessId,
        method: RpcMethod,
        args: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let envelope =
            Envelope::rpc(id.to_string(), method, args).with_sender(self.config.runner_id.clone());
        let reply = match timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.communicator.rpc_send(envelope)).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        return Err(CoreError::Communicator(format!(
                            "{method} call to {id} timed out after {}ms",
                            timeout.as_millis()
                        )));
                    }
                }
            }
            None => self.communicator.rpc_send(envelope).await,
        };
        match reply {
            Ok(value) => Ok(value),
            // The owner stopped between accepting the call and answering it
            Err(CommunicatorError::NoReply) => Err(CoreError::not_found(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Kill a process wherever it lives. Unowned checkpoints are loaded
    /// here first.
    ///
    /// Resolves once the kill is committed. A kill waits for the running
    /// step and for all live descendants, so it is not bounded by the RPC
    /// timeout.
    pub async fn kill_process(self: &Arc<Self>, id: ProcessId, message: Option<String>) -> Result<()> {
        let args = Some(json!({ "message": message }));
        match self.call(id, RpcMethod::Kill, args.clone(), None).await {
            Ok(_) => return Ok(()),
            Err(CoreError::ProcessNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let bundle = self.store.load(&id).await?;
        if bundle.process.state.is_terminal() {
            return Ok(());
        }
        self.load_process(id, false).await?;
        self.call(id, RpcMethod::Kill, args, None).await.map(|_| ())
    }

    /// Wait until the stored state of `id` is terminal.
    pub async fn wait_terminal(&self, id: ProcessId) -> Result<ProcessRecord> {
        let mut broadcasts = self.communicator.subscribe_broadcasts().await?;
        let sender = id.to_string();
        loop {
            match self.store.load(&id).await {
                Ok(bundle) if bundle.process.state.is_terminal() => return Ok(bundle.process),
                Ok(_) => {}
                // Not checkpointed yet
                Err(CoreError::ProcessNotFound { .. }) if self.is_live(&id) => {}
                Err(e) => return Err(e),
            }

            let recheck = tokio::time::sleep(WAIT_RECHECK_INTERVAL);
            tokio::pin!(recheck);
            loop {
                tokio::select! {
                    envelope = broadcasts.recv() => match envelope {
                        Some(envelope) if envelope.sender.as_deref() == Some(sender.as_str()) => break,
                        Some(_) => {}
                        None => {
                            (&mut recheck).await;
                            break;
                        }
                    },
                    _ = &mut recheck => break,
                }
            }
        }
    }

    pub async fn status(&self, id: ProcessId) -> Result<ProcessStatus> {
        match self.rpc(id, RpcMethod::Status, None).await {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(CoreError::ProcessNotFound { .. }) => {
                let bundle = self.store.load(&id).await?;
                Ok(ProcessStatus::from_record(&bundle.process, false))
            }
            Err(e) => Err(e),
        }
    }

    fn status_tree(self: Arc<Self>, id: ProcessId) -> BoxFuture<'static, Result<StatusNode>> {
        async move {
            let status = self.status(id).await?;
            let mut children = Vec::with_capacity(status.children.len());
            for child in &status.children {
                match self.clone().status_tree(*child).await {
                    Ok(node) => children.push(node),
                    // Launched but not yet checkpointed
                    Err(CoreError::ProcessNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(StatusNode { status, children })
        }
        .boxed()
    }
}

/// Builder for [`Runner`].
pub struct RunnerBuilder {
    config: RunnerConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    communicator: Option<Arc<dyn Communicator>>,
    registry: PluginRegistry,
    provenance: Option<Arc<dyn Provenance>>,
}

impl std::fmt::Debug for RunnerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("communicator", &self.communicator.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .finish()
    }
}

impl Default for RunnerBuilder {
    fn default() -> Self {
        Self {
            config: RunnerConfig::default(),
            store: None,
            communicator: None,
            registry: PluginRegistry::with_defaults(),
            provenance: None,
        }
    }
}

impl RunnerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Checkpoint store. Default: [`MemoryCheckpointStore`].
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Broker connection. Default: a private [`LocalBroker`].
    pub fn communicator(mut self, communicator: Arc<dyn Communicator>) -> Self {
        self.communicator = Some(communicator);
        self
    }

    /// Plugins. Default: [`PluginRegistry::with_defaults`].
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Provenance store. Default: [`MemoryProvenance`].
    pub fn provenance(mut self, provenance: Arc<dyn Provenance>) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Validate the configuration against the registry and connect the
    /// computers. Nothing runs until [`Runner::start`].
    pub async fn build(self) -> Result<Runner> {
        let Self {
            config,
            store,
            communicator,
            registry,
            provenance,
        } = self;
        registry.validate(&config.computers)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(TransportPool::new());
        let mut computers = HashMap::new();
        for computer in &config.computers {
            let transport = registry.create_transport(computer)?;
            let scheduler = registry.create_scheduler(computer)?;
            pool.register(&computer.name, transport, computer.max_connections)
                .await;
            let manager = JobManager::new(
                computer.name.clone(),
                pool.clone(),
                scheduler.clone(),
                PollSettings {
                    interval: config.poll_interval,
                    jitter: config.poll_jitter,
                    max_transport_retries: config.transport_backoff.max_retries,
                },
                shutdown_rx.clone(),
            );
            computers.insert(
                computer.name.clone(),
                ComputerEnv {
                    config: computer.clone(),
                    scheduler,
                    manager,
                },
            );
        }

        let env = Arc::new(CalcEnv {
            pool,
            computers,
            parsers: registry.parsers().clone(),
            backoff: config.transport_backoff.clone(),
            max_resubmissions: config.max_resubmissions,
            work_dir: config.work_dir.clone(),
        });

        info!(
            runner_id = %config.runner_id,
            computers = config.computers.len(),
            process_types = ?registry.process_types(),
            "Runner built"
        );

        Ok(Runner {
            shared: Arc::new(RunnerShared {
                store: store.unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
                communicator: communicator.unwrap_or_else(|| Arc::new(LocalBroker::new())),
                provenance: provenance.unwrap_or_else(|| Arc::new(MemoryProvenance::new())),
                config,
                registry,
                env,
                live: Mutex::new(HashMap::new()),
                tasks: Mutex::new(None),
                shutdown_tx,
            }),
        })
    }
}

/// Handle onto a runner. Clones share the same runner.
#[derive(Clone)]
pub struct Runner {
    shared: Arc<RunnerShared>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("runner_id", &self.shared.config.runner_id)
            .field("live", &self.live_count())
            .finish()
    }
}

impl Runner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::new()
    }

    pub fn id(&self) -> &str {
        &self.shared.config.runner_id
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.shared.store
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.shared.communicator
    }

    /// Rehydrate in-flight processes and start consuming tasks.
    ///
    /// Returns the number of processes loaded from the store.
    pub async fn start(&self) -> Result<usize> {
        let shared = &self.shared;
        let filter = ProcessFilter::active()
            .owned_by_or_unowned(shared.config.runner_id.clone())
            .with_limit(shared.config.max_rehydrate);
        let candidates = shared.store.list(&filter).await?;

        let mut loaded = 0;
        for summary in candidates {
            match shared.load_process(summary.process_id, false).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!(
                    process_id = %summary.process_id,
                    error = %e,
                    "Failed to rehydrate process"
                ),
            }
        }

        let queue = shared.communicator.task_queue().await?;
        let handle = tokio::spawn(tasks::consume(shared.clone(), queue, shared.shutdown_rx()));
        *shared.tasks.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(runner_id = %shared.config.runner_id, rehydrated = loaded, "Runner started");
        Ok(loaded)
    }

    /// Create a process and start running it here.
    pub async fn submit(&self, request: LaunchRequest) -> Result<ProcessId> {
        self.shared.submit(request).await
    }

    /// Load a checkpointed process that no other runner owns.
    pub async fn load(&self, id: ProcessId) -> Result<()> {
        self.shared.load_process(id, false).await
    }

    /// Load a checkpointed process even if another runner owns it.
    pub async fn force_load(&self, id: ProcessId) -> Result<()> {
        self.shared.load_process(id, true).await
    }

    /// Returns false if the process was already paused.
    pub async fn pause(&self, id: ProcessId) -> Result<bool> {
        let value = self.shared.rpc(id, RpcMethod::Pause, None).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Returns false if the process was not paused.
    pub async fn play(&self, id: ProcessId) -> Result<bool> {
        let value = self.shared.rpc(id, RpcMethod::Play, None).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Kill a process and its live descendants. Returns once the kill is
    /// committed.
    pub async fn kill(&self, id: ProcessId, message: Option<String>) -> Result<()> {
        self.shared.kill_process(id, message).await
    }

    /// Deliver `value` to a process waiting for a signal.
    pub async fn continue_process(&self, id: ProcessId, value: Value) -> Result<()> {
        self.shared
            .rpc(id, RpcMethod::Continue, Some(json!({ "value": value })))
            .await
            .map(|_| ())
    }

    pub async fn status(&self, id: ProcessId) -> Result<ProcessStatus> {
        self.shared.status(id).await
    }

    /// Status of `id` and all of its descendants.
    pub async fn status_tree(&self, id: ProcessId) -> Result<StatusNode> {
        self.shared.clone().status_tree(id).await
    }

    /// Wait until `id` is terminal and return its final record.
    pub async fn wait_for(&self, id: ProcessId) -> Result<ProcessRecord> {
        self.shared.wait_terminal(id).await
    }

    pub async fn list_processes(&self, filter: &ProcessFilter) -> Result<Vec<BundleSummary>> {
        self.shared.store.list(filter).await
    }

    pub fn is_live(&self, id: &ProcessId) -> bool {
        self.shared.is_live(id)
    }

    pub fn live_count(&self) -> usize {
        self.shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop taking tasks, let live processes reach a checkpoint and release
    /// them. Processes still busy after the shutdown timeout are aborted and
    /// resume from their last checkpoint elsewhere.
    pub async fn shutdown(&self) -> Result<()> {
        let shared = &self.shared;
        info!(runner_id = %shared.config.runner_id, live = self.live_count(), "Runner shutting down...");
        shared.shutdown_tx.send_replace(true);

        let consumer = shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer
            && let Err(e) = consumer.await
        {
            error!(error = %e, "Task consumer panicked");
        }

        let handles: Vec<(ProcessId, JoinHandle<()>)> = shared
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let aborts: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();
        let count = handles.len();

        let joined = tokio::time::timeout(
            shared.config.shutdown_timeout,
            join_all(handles.into_iter().map(|(id, handle)| async move { (id, handle.await) })),
        )
        .await;
        match joined {
            Ok(results) => {
                for (id, result) in results {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        error!(process_id = %id, "Process actor panicked");
                    }
                }
                debug!(processes = count, "All processes drained");
            }
            Err(_) => {
                warn!(
                    processes = count,
                    timeout_ms = shared.config.shutdown_timeout.as_millis() as u64,
                    "Shutdown timed out, aborting remaining processes"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        shared.env.pool.close_idle().await;
        info!(runner_id = %shared.config.runner_id, "Runner shutdown complete");
        Ok(())
    }
}
