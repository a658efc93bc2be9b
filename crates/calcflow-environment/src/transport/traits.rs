// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport trait definitions.
//!
//! A [`Transport`] opens connections to one execution host. All file and
//! command operations happen on an explicitly opened [`Connection`].

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from transport operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The connection failed or dropped. Retryable after reconnecting.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials were rejected. Never retried.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The remote path does not exist.
    #[error("path not found: {0}")]
    NotFound(String),

    /// The connection was closed by the caller.
    #[error("connection closed")]
    Closed,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether reconnecting and repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open connection to an execution host.
///
/// Remote paths are plain strings in the host's path syntax; local paths
/// are [`Path`]s on the machine running the engine.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run `command` through the host's shell, optionally inside `workdir`.
    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<CommandOutput>;

    /// Copy a local file to `remote`.
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy `remote` to a local file.
    async fn get(&self, remote: &str, local: &Path) -> Result<()>;

    async fn mkdir(&self, remote: &str, parents: bool) -> Result<()>;

    /// Names of the entries in a remote directory, sorted.
    async fn listdir(&self, remote: &str) -> Result<Vec<String>>;

    /// Remove a remote file or directory tree.
    async fn remove(&self, remote: &str) -> Result<()>;

    async fn exists(&self, remote: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Factory for connections to one host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport type name (e.g., "local", "mock").
    fn transport_type(&self) -> &'static str;

    /// Open a new connection.
    async fn open(&self) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TransportError::Connection("reset".into()).is_retryable());
        assert!(TransportError::Closed.is_retryable());
        assert!(!TransportError::Authentication("denied".into()).is_retryable());
        assert!(!TransportError::NotFound("/x".into()).is_retryable());
    }
}
