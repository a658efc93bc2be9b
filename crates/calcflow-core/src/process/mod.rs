// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processes: records, definitions and the step contract.

pub(crate) mod actor;
pub mod logic;
pub mod record;
pub mod spec;

pub use self::logic::{
    Awaitable, Awaiting, ChildOutcome, ChildRequest, JobOutcome, PendingChild, ProcessLogic,
    ResumeValue, Step, StepContext, Waiter,
};
pub use self::record::{
    EXIT_CODE_EXCEPTED, EXIT_CODE_KILLED, ExitStatus, Failure, FailureKind, ProcessId,
    ProcessKind, ProcessRecord, ProcessState, ReportEntry, ReportLevel, StateTransition,
};
pub use self::spec::{ExitCodeSpec, PortSpec, ProcessSpec, ProcessSpecBuilder};
