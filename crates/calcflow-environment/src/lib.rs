// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! calcflow environment - where calculation jobs actually run.
//!
//! This crate holds the two plugin contracts the engine drives remote work
//! through, together with their reference implementations:
//!
//! - [`transport`]: opening connections to a host, running commands and
//!   moving files, plus a bounded per-computer [`TransportPool`]
//! - [`scheduler`]: rendering submit scripts and interpreting the output of
//!   batch scheduler commands
//!
//! The pool and the adapters are independent: the engine takes a pooled
//! connection, asks an adapter which command to run, runs it and hands the
//! output back to the adapter.

pub mod computer;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use computer::ComputerConfig;
pub use retry::BackoffPolicy;
pub use scheduler::{JobInfo, JobState, JobTemplate, Scheduler, SchedulerError};
pub use transport::{CommandOutput, Connection, Transport, TransportError, TransportPool};
