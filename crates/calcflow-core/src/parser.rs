// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Output parsers for calculation jobs.

use std::path::{Path, PathBuf};

use calcflow_environment::JobInfo;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by parsers. They except the calculation with a
/// `ParsingError`.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("output file '{0}' was not retrieved")]
    MissingFile(String),

    #[error("invalid output: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files copied back from the job's working directory.
#[derive(Debug, Clone)]
pub struct RetrievedFiles {
    /// Local directory holding the retrieved files.
    pub root: PathBuf,
    /// Names from the retrieve list that did not exist remotely.
    pub missing: Vec<String>,
    /// Last scheduler report, `None` if the job vanished from the listing.
    pub job_info: Option<JobInfo>,
}

impl RetrievedFiles {
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn is_missing(&self, name: &str) -> bool {
        self.missing.iter().any(|m| m == name)
    }

    pub fn read_to_string(&self, name: &str) -> Result<String, ParserError> {
        if self.is_missing(name) {
            return Err(ParserError::MissingFile(name.to_string()));
        }
        match std::fs::read_to_string(self.path(name)) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ParserError::MissingFile(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Exit code, message and outputs decided by a parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub exit_code: i32,
    pub message: Option<String>,
    pub outputs: Option<Value>,
}

impl ParseOutcome {
    pub fn ok(outputs: Value) -> Self {
        Self {
            exit_code: 0,
            message: None,
            outputs: Some(outputs),
        }
    }

    pub fn failed(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: Some(message.into()),
            outputs: None,
        }
    }
}

/// Interprets the retrieved files of one calculation type.
///
/// Parsers run on the blocking thread pool; a panic is reported as a
/// parsing failure.
pub trait Parser: Send + Sync {
    fn parse(&self, retrieved: &RetrievedFiles, inputs: &Value)
    -> Result<ParseOutcome, ParserError>;
}

impl<F> Parser for F
where
    F: Fn(&RetrievedFiles, &Value) -> Result<ParseOutcome, ParserError> + Send + Sync,
{
    fn parse(
        &self,
        retrieved: &RetrievedFiles,
        inputs: &Value,
    ) -> Result<ParseOutcome, ParserError> {
        self(retrieved, inputs)
    }
}
