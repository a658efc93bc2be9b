// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler adapters.
//!
//! - [`DirectScheduler`]: background process on the host, done on exit
//! - [`SlurmScheduler`]: SLURM batch system
//! - [`PbsScheduler`]: PBS Pro batch system

pub mod direct;
pub mod pbs;
pub mod slurm;
pub mod traits;

pub use direct::DirectScheduler;
pub use pbs::PbsScheduler;
pub use slurm::SlurmScheduler;
pub use traits::{
    CodeCommand, JobInfo, JobResources, JobState, JobTemplate, SCHEDULER_STDERR,
    SCHEDULER_STDOUT, SUBMIT_SCRIPT_FILENAME, Scheduler, SchedulerError,
};
