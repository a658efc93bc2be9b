// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin registry.
//!
//! Maps string keys to transports, schedulers, parsers and process types.
//! Filled before the runner is built; the runner checks that every key its
//! configuration refers to is present.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use calcflow_environment::scheduler::{DirectScheduler, PbsScheduler, SlurmScheduler};
use calcflow_environment::transport::LocalTransport;
use calcflow_environment::{ComputerConfig, Scheduler, Transport};
use tracing::debug;

use crate::calcjob::CalcJobLogic;
use crate::error::{CoreError, Result};
use crate::parser::Parser;
use crate::process::{ProcessKind, ProcessLogic, ProcessSpec};

pub type TransportFactory =
    Arc<dyn Fn(&ComputerConfig) -> Result<Arc<dyn Transport>> + Send + Sync>;

pub type SchedulerFactory = Arc<dyn Fn() -> Arc<dyn Scheduler> + Send + Sync>;

/// A registered process type.
#[derive(Clone)]
pub enum ProcessFactory {
    Workflow(Arc<dyn ProcessLogic>),
    CalcJob(Arc<dyn CalcJobLogic>),
}

impl ProcessFactory {
    pub fn spec(&self) -> Arc<ProcessSpec> {
        match self {
            Self::Workflow(logic) => logic.spec(),
            Self::CalcJob(logic) => logic.spec(),
        }
    }

    pub fn kind(&self) -> ProcessKind {
        match self {
            Self::Workflow(logic) => logic.kind(),
            Self::CalcJob(_) => ProcessKind::Calculation,
        }
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    transports: HashMap<String, TransportFactory>,
    schedulers: HashMap<String, SchedulerFactory>,
    parsers: HashMap<String, Arc<dyn Parser>>,
    processes: HashMap<String, ProcessFactory>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut processes: Vec<&String> = self.processes.keys().collect();
        processes.sort();
        f.debug_struct("PluginRegistry")
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("schedulers", &self.schedulers.keys().collect::<Vec<_>>())
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .field("processes", &processes)
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled `local` transport and `direct`, `slurm`
    /// and `pbs` schedulers.
    pub fn with_defaults() -> Self {
        Self::new()
            .transport(
                "local",
                Arc::new(|_: &ComputerConfig| -> Result<Arc<dyn Transport>> {
                    Ok(Arc::new(LocalTransport::new()))
                }),
            )
            .scheduler("direct", Arc::new(|| -> Arc<dyn Scheduler> { Arc::new(DirectScheduler::new()) }))
            .scheduler("slurm", Arc::new(|| -> Arc<dyn Scheduler> { Arc::new(SlurmScheduler::new()) }))
            .scheduler("pbs", Arc::new(|| -> Arc<dyn Scheduler> { Arc::new(PbsScheduler::new()) }))
    }

    pub fn transport(mut self, name: impl Into<String>, factory: TransportFactory) -> Self {
        self.transports.insert(name.into(), factory);
        self
    }

    /// Register a single transport instance shared by every computer using
    /// `name`.
    pub fn transport_instance(self, name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.transport(
            name,
            Arc::new(move |_: &ComputerConfig| -> Result<Arc<dyn Transport>> {
                Ok(transport.clone())
            }),
        )
    }

    pub fn scheduler(mut self, name: impl Into<String>, factory: SchedulerFactory) -> Self {
        self.schedulers.insert(name.into(), factory);
        self
    }

    pub fn parser(mut self, name: impl Into<String>, parser: Arc<dyn Parser>) -> Self {
        self.parsers.insert(name.into(), parser);
        self
    }

    /// Register a workflow under its spec name.
    pub fn workflow(mut self, logic: Arc<dyn ProcessLogic>) -> Self {
        let name = logic.spec().name.clone();
        debug!(process_type = %name, "Registered workflow");
        self.processes.insert(name, ProcessFactory::Workflow(logic));
        self
    }

    /// Register a calculation under its spec name.
    pub fn calcjob(mut self, logic: Arc<dyn CalcJobLogic>) -> Self {
        let name = logic.spec().name.clone();
        debug!(process_type = %name, "Registered calculation");
        self.processes.insert(name, ProcessFactory::CalcJob(logic));
        self
    }

    pub fn process(&self, process_type: &str) -> Result<&ProcessFactory> {
        self.processes
            .get(process_type)
            .ok_or_else(|| CoreError::UnknownProcessType(process_type.to_string()))
    }

    pub fn process_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.processes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn create_transport(&self, computer: &ComputerConfig) -> Result<Arc<dyn Transport>> {
        let factory = self.transports.get(&computer.transport).ok_or_else(|| {
            CoreError::Configuration(format!(
                "computer '{}' uses unknown transport '{}'",
                computer.name, computer.transport
            ))
        })?;
        factory(computer)
    }

    pub fn create_scheduler(&self, computer: &ComputerConfig) -> Result<Arc<dyn Scheduler>> {
        let factory = self.schedulers.get(&computer.scheduler).ok_or_else(|| {
            CoreError::Configuration(format!(
                "computer '{}' uses unknown scheduler '{}'",
                computer.name, computer.scheduler
            ))
        })?;
        Ok(factory())
    }

    pub(crate) fn parsers(&self) -> &HashMap<String, Arc<dyn Parser>> {
        &self.parsers
    }

    /// Check that every computer's transport and scheduler and every
    /// calculation's parser is registered.
    pub fn validate(&self, computers: &[ComputerConfig]) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for computer in computers {
            if !names.insert(computer.name.as_str()) {
                return Err(CoreError::Configuration(format!(
                    "computer '{}' is configured twice",
                    computer.name
                )));
            }
            if !self.transports.contains_key(&computer.transport) {
                return Err(CoreError::Configuration(format!(
                    "computer '{}' uses unknown transport '{}'",
                    computer.name, computer.transport
                )));
            }
            if !self.schedulers.contains_key(&computer.scheduler) {
                return Err(CoreError::Configuration(format!(
                    "computer '{}' uses unknown scheduler '{}'",
                    computer.name, computer.scheduler
                )));
            }
        }
        for (name, factory) in &self.processes {
            if let ProcessFactory::CalcJob(logic) = factory
                && !self.parsers.contains_key(logic.parser())
            {
                return Err(CoreError::Configuration(format!(
                    "calculation '{name}' uses unknown parser '{}'",
                    logic.parser()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcjob::{CalcInfo, JobOptions};
    use crate::parser::{ParseOutcome, ParserError, RetrievedFiles};
    use serde_json::{Value, json};

    struct Echo;

    impl CalcJobLogic for Echo {
        fn spec(&self) -> Arc<ProcessSpec> {
            ProcessSpec::builder("echo").dynamic_inputs().build().unwrap()
        }

        fn parser(&self) -> &str {
            "echo"
        }

        fn prepare(&self, _inputs: &Value, _options: &JobOptions) -> anyhow::Result<CalcInfo> {
            Ok(CalcInfo::default())
        }
    }

    fn echo_parser(_: &RetrievedFiles, _: &Value) -> std::result::Result<ParseOutcome, ParserError> {
        Ok(ParseOutcome::ok(json!({})))
    }

    #[test]
    fn test_defaults_validate() {
        let registry = PluginRegistry::with_defaults();
        let computers = vec![
            ComputerConfig::new("localhost", "local", "direct", "/tmp/work"),
            ComputerConfig::new("cluster", "local", "slurm", "/scratch"),
        ];
        registry.validate(&computers).unwrap();
        assert_eq!(
            registry.create_scheduler(&computers[1]).unwrap().name(),
            "slurm"
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let registry = PluginRegistry::with_defaults();
        let err = registry
            .validate(&[ComputerConfig::new("remote", "ssh", "direct", "/tmp")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown transport 'ssh'"));

        let err = registry
            .validate(&[ComputerConfig::new("remote", "local", "lsf", "/tmp")])
            .unwrap_err();
        assert!(err.to_string().contains("unknown scheduler 'lsf'"));

        let err = registry
            .validate(&[
                ComputerConfig::new("a", "local", "direct", "/tmp"),
                ComputerConfig::new("a", "local", "direct", "/tmp"),
            ])
            .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_calcjob_parser_must_exist() {
        let registry = PluginRegistry::with_defaults().calcjob(Arc::new(Echo));
        assert!(matches!(
            registry.validate(&[]),
            Err(CoreError::Configuration(_))
        ));

        let registry = registry.parser("echo", Arc::new(echo_parser));
        registry.validate(&[]).unwrap();
        assert_eq!(registry.process_types(), vec!["echo"]);
        assert_eq!(registry.process("echo").unwrap().kind(), ProcessKind::Calculation);
        assert!(matches!(
            registry.process("nope"),
            Err(CoreError::UnknownProcessType(_))
        ));
    }
}
