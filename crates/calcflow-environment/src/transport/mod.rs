// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transports: how the engine reaches an execution host.
//!
//! - [`LocalTransport`]: the machine running the engine
//! - [`MockTransport`]: in-memory host for tests

pub mod local;
pub mod mock;
pub mod pool;
pub mod traits;

pub use local::LocalTransport;
pub use mock::{MockCommand, MockFault, MockFs, MockOp, MockTransport};
pub use pool::{PooledConnection, TransportPool};
pub use traits::{CommandOutput, Connection, Transport, TransportError};
