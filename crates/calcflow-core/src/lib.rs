// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Calcflow Core - Process Engine
//!
//! This crate runs long-lived computational processes: workflows that
//! launch other processes, and calculations that execute as batch jobs on
//! remote machines. Every state transition is checkpointed so that any
//! runner attached to the same store and broker can pick a process up
//! after a crash or restart.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                 Clients (runner API, task queue)              │
//! └───────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            Runner                             │
//! │   one actor per live process, RPC inbox, task consumer        │
//! └───────────────────────────────────────────────────────────────┘
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//! ┌──────────────┐     ┌───────────────────┐     ┌────────────────┐
//! │ Checkpoint   │     │ Job manager       │     │ Communicator   │
//! │ store        │     │ (batched polling) │     │ (calcflow-     │
//! │ memory/SQLite│     │ transport pool    │     │  protocol)     │
//! └──────────────┘     └───────────────────┘     └────────────────┘
//!                                │
//!                                ▼
//!                    ┌──────────────────────────┐
//!                    │ calcflow-environment     │
//!                    │ transports + schedulers  │
//!                    └──────────────────────────┘
//! ```
//!
//! # Process lifecycle
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Created` | Accepted, not yet stepped |
//! | `Running` | Executing a step |
//! | `Waiting` | Suspended on children, a timer, a signal or a job update |
//! | `Finished` | Completed; exit status may still be non-zero |
//! | `Excepted` | An unrecoverable error was captured |
//! | `Killed` | Stopped by request |
//!
//! Calculations move through the stages `Uploading → Submitting → Scheduled
//! → Retrieving → Parsing` while `Running` or `Waiting`. Transport failures
//! are retried with exponential backoff before the calculation is excepted.
//!
//! # Control
//!
//! Live processes answer `status`, `pause`, `play`, `kill` and `continue`
//! RPCs addressed by process id. State changes are broadcast as
//! `state_changed.<from>.<to>`.

pub mod calcjob;
pub mod config;
pub mod error;
pub mod migrations;
pub mod parser;
pub mod persistence;
pub mod process;
pub mod provenance;
pub mod registry;
pub mod runner;

pub use calcjob::{CalcInfo, CalcJobLogic, CalcJobState, CalcStage, JobOptions};
pub use config::{BrokerMode, ConfigError, RunnerConfig};
pub use error::{CoreError, Result};
pub use parser::{ParseOutcome, Parser, ParserError, RetrievedFiles};
pub use persistence::{
    Bundle, BundleSummary, CheckpointStore, MemoryCheckpointStore, ProcessFilter,
    SqliteCheckpointStore,
};
pub use process::{
    ChildRequest, ExitStatus, Failure, FailureKind, ProcessId, ProcessKind, ProcessLogic,
    ProcessRecord, ProcessSpec, ProcessState, Step, StepContext,
};
pub use provenance::{MemoryProvenance, Provenance};
pub use registry::PluginRegistry;
pub use runner::{LaunchRequest, ProcessStatus, Runner, RunnerBuilder, StatusNode};
