// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for calcflow-core.
//!
//! [`CoreError`] is what runner and store operations return to callers.
//! Failures that end a process (transport, scheduler, parsing, process
//! logic) are not errors of this kind: they are captured into the process
//! exit status, see [`crate::process::Failure`].

use calcflow_protocol::{CommunicatorError, RpcError};
use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors returned synchronously by the engine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No runner owns the process, or no checkpoint exists for it.
    #[error("Process '{process_id}' not found")]
    ProcessNotFound { process_id: String },

    /// Another writer stored this checkpoint version first.
    #[error("Version conflict for process '{process_id}': version {version} already stored")]
    VersionConflict { process_id: String, version: u64 },

    /// The process is owned by another runner.
    #[error("Process '{process_id}' is owned by runner '{owner}'")]
    ProcessOwned { process_id: String, owner: String },

    /// The process is in the wrong state for the requested operation.
    #[error("Process '{process_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidState {
        process_id: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown process type '{0}'")]
    UnknownProcessType(String),

    #[error("Unknown computer '{0}'")]
    UnknownComputer(String),

    /// Input or definition validation failed.
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// Database operation failed.
    #[error("Database operation '{operation}' failed: {details}")]
    Database { operation: String, details: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Communicator error: {0}")]
    Communicator(String),

    /// Error reported by the process owner over RPC.
    #[error("Remote error {code}: {message}")]
    Remote { code: String, message: String },

    /// Missing or inconsistent plugins and settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Runner is shutting down")]
    ShuttingDown,
}

impl CoreError {
    pub fn not_found(process_id: impl ToString) -> Self {
        Self::ProcessNotFound {
            process_id: process_id.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn database(operation: &str, e: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: e.to_string(),
        }
    }

    /// Convert this error to an RpcError for protocol responses.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::Remote { code, message } => RpcError {
                code: code.clone(),
                message: message.clone(),
            },
            _ => RpcError {
                code: self.error_code().to_string(),
                message: self.to_string(),
            },
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::ProcessOwned { .. } => "PROCESS_OWNED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::UnknownProcessType(_) => "UNKNOWN_PROCESS_TYPE",
            Self::UnknownComputer(_) => "UNKNOWN_COMPUTER",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Communicator(_) => "COMMUNICATOR_ERROR",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::database("query", e)
    }
}

impl From<CommunicatorError> for CoreError {
    fn from(e: CommunicatorError) -> Self {
        match e {
            CommunicatorError::ProcessNotFound(process_id) => Self::ProcessNotFound { process_id },
            CommunicatorError::Remote { code, message } => Self::Remote { code, message },
            CommunicatorError::Closed => Self::ShuttingDown,
            other => Self::Communicator(other.to_string()),
        }
    }
}
