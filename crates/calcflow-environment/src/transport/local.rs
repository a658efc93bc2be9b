// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local transport.
//!
//! Executes commands with `sh -c` on the machine running the engine and
//! copies files with tokio's filesystem API.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::traits::*;

/// Transport for the local host.
#[derive(Debug, Default, Clone)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn transport_type(&self) -> &'static str {
        "local"
    }

    async fn open(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(LocalConnection {
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to the local host.
#[derive(Debug)]
pub struct LocalConnection {
    closed: AtomicBool,
}

impl LocalConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

fn map_io(path: &str, e: std::io::Error) -> TransportError {
    if e.kind() == ErrorKind::NotFound {
        TransportError::NotFound(path.to_string())
    } else {
        TransportError::Io(e)
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<CommandOutput> {
        self.ensure_open()?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        debug!(command, workdir, "local exec");
        let output = cmd.output().await?;

        Ok(CommandOutput {
            // Killed by a signal has no exit code
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::copy(local, remote)
            .await
            .map_err(|e| map_io(&local.to_string_lossy(), e))?;
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        self.ensure_open()?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(remote, local)
            .await
            .map_err(|e| map_io(remote, e))?;
        Ok(())
    }

    async fn mkdir(&self, remote: &str, parents: bool) -> Result<()> {
        self.ensure_open()?;
        let result = if parents {
            tokio::fs::create_dir_all(remote).await
        } else {
            tokio::fs::create_dir(remote).await
        };
        result.map_err(|e| map_io(remote, e))
    }

    async fn listdir(&self, remote: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut entries = tokio::fs::read_dir(remote)
            .await
            .map_err(|e| map_io(remote, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        self.ensure_open()?;
        let meta = tokio::fs::metadata(remote)
            .await
            .map_err(|e| map_io(remote, e))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(remote).await?;
        } else {
            tokio::fs::remove_file(remote).await?;
        }
        Ok(())
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(tokio::fs::try_exists(remote).await?)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalTransport::new().open().await.unwrap();

        let out = conn
            .exec("pwd; echo err >&2; exit 3", Some(dir.path().to_str().unwrap()))
            .await
            .unwrap();

        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.trim().ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_put_get_listdir_remove() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("remote/work");
        let root_str = root.to_str().unwrap().to_string();
        let conn = LocalTransport::new().open().await.unwrap();

        conn.mkdir(&root_str, true).await.unwrap();
        let src = dir.path().join("input.txt");
        tokio::fs::write(&src, b"42").await.unwrap();
        conn.put(&src, &format!("{root_str}/input.txt")).await.unwrap();

        assert_eq!(conn.listdir(&root_str).await.unwrap(), vec!["input.txt"]);
        assert!(conn.exists(&format!("{root_str}/input.txt")).await.unwrap());

        let back = dir.path().join("retrieved/input.txt");
        conn.get(&format!("{root_str}/input.txt"), &back).await.unwrap();
        assert_eq!(tokio::fs::read(&back).await.unwrap(), b"42");

        conn.remove(&root_str).await.unwrap();
        assert!(!conn.exists(&root_str).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalTransport::new().open().await.unwrap();
        let missing = dir.path().join("nope.txt");

        let err = conn
            .get(missing.to_str().unwrap(), &dir.path().join("out.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let conn = LocalTransport::new().open().await.unwrap();
        conn.close().await.unwrap();
        let err = conn.exec("true", None).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
