// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock transport for testing.
//!
//! Keeps an in-memory filesystem, answers commands through a scriptable
//! handler and can inject connection faults and latency into individual
//! operations.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;

/// Operations that can be counted and faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Open,
    Exec,
    Put,
    Get,
    Mkdir,
    Listdir,
    Remove,
    Exists,
    Close,
}

/// Kind of injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Connection,
    Authentication,
}

/// In-memory filesystem of the mock host.
#[derive(Debug, Default)]
pub struct MockFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

impl MockFs {
    /// Write a file, creating parent directories.
    pub fn write(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = normalize(path);
        if let Some(parent) = parent_of(&path) {
            self.mkdir_all(parent);
        }
        self.files.insert(path, contents.into());
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(Vec::as_slice)
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        self.files.contains_key(&path) || self.dirs.contains(&path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(&normalize(path))
    }

    fn mkdir_all(&mut self, path: &str) {
        let path = normalize(path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn list(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", normalize(dir).trim_end_matches('/'));
        let mut names: BTreeSet<String> = BTreeSet::new();
        for path in self.files.keys().chain(self.dirs.iter()) {
            if let Some(rest) = path.strip_prefix(&prefix)
                && let Some(name) = rest.split('/').next()
                && !name.is_empty()
            {
                names.insert(name.to_string());
            }
        }
        names.into_iter().collect()
    }

    fn remove_tree(&mut self, path: &str) {
        let path = normalize(path);
        let prefix = format!("{path}/");
        self.files.retain(|p, _| p != &path && !p.starts_with(&prefix));
        self.dirs.retain(|p| p != &path && !p.starts_with(&prefix));
    }
}

/// Command seen by the exec handler.
#[derive(Debug, Clone, Copy)]
pub struct MockCommand<'a> {
    pub command: &'a str,
    pub workdir: Option<&'a str>,
}

/// Scripted reply to commands. Receives the filesystem so a fake job can
/// leave output files behind.
pub type ExecHandler = Arc<dyn Fn(&MockCommand<'_>, &mut MockFs) -> CommandOutput + Send + Sync>;

struct MockState {
    fs: MockFs,
    handler: Option<ExecHandler>,
    faults: HashMap<MockOp, VecDeque<MockFault>>,
    latency: HashMap<MockOp, Duration>,
    calls: HashMap<MockOp, usize>,
    commands: Vec<String>,
}

impl MockState {
    fn record(&mut self, op: MockOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(MockFault::Connection) => Err(TransportError::Connection(format!(
                "injected fault on {op:?}"
            ))),
            Some(MockFault::Authentication) => Err(TransportError::Authentication(format!(
                "injected fault on {op:?}"
            ))),
            None => Ok(()),
        }
    }
}

/// Mock transport. Clones share the same host state.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock host where every command succeeds with empty output.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                fs: MockFs::default(),
                handler: None,
                faults: HashMap::new(),
                latency: HashMap::new(),
                calls: HashMap::new(),
                commands: Vec::new(),
            })),
        }
    }

    /// Create a mock host that answers commands with `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&MockCommand<'_>, &mut MockFs) -> CommandOutput + Send + Sync + 'static,
    {
        let transport = Self::new();
        if let Ok(mut state) = transport.state.try_lock() {
            state.handler = Some(Arc::new(handler));
        }
        transport
    }

    /// Fail the next `count` calls of `op` with `fault`.
    pub async fn fail_next(&self, op: MockOp, count: usize, fault: MockFault) {
        let mut state = self.state.lock().await;
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(fault, count));
    }

    /// Delay every later call of `op` by `latency`. The host stays usable
    /// for other operations meanwhile.
    pub async fn set_latency(&self, op: MockOp, latency: Duration) {
        self.state.lock().await.latency.insert(op, latency);
    }

    /// Number of times `op` was attempted, including faulted attempts.
    pub async fn calls(&self, op: MockOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Every command passed to `exec`, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    pub async fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.state.lock().await.fs.write(path, contents);
    }

    pub async fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().await.fs.read(path).map(<[u8]>::to_vec)
    }

    pub async fn file_exists(&self, path: &str) -> bool {
        self.state.lock().await.fs.exists(path)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &'static str {
        "mock"
    }

    async fn open(&self) -> Result<Box<dyn Connection>> {
        self.state.lock().await.record(MockOp::Open)?;
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

/// Connection to the mock host.
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Count the call, then apply injected faults and latency.
    async fn enter(&self, op: MockOp) -> Result<()> {
        let latency = {
            let mut state = self.state.lock().await;
            state.record(op)?;
            state.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<CommandOutput> {
        self.enter(MockOp::Exec).await?;
        let mut state = self.state.lock().await;
        state.commands.push(command.to_string());
        let Some(handler) = state.handler.clone() else {
            return Ok(CommandOutput::success(""));
        };
        let cmd = MockCommand { command, workdir };
        Ok(handler(&cmd, &mut state.fs))
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.enter(MockOp::Put).await?;
        let contents = tokio::fs::read(local).await?;
        let mut state = self.state.lock().await;
        let remote = normalize(remote);
        match parent_of(&remote) {
            Some(parent) if !state.fs.is_dir(parent) => {
                return Err(TransportError::NotFound(parent.to_string()));
            }
            _ => {}
        }
        state.fs.files.insert(remote, contents);
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        self.enter(MockOp::Get).await?;
        let contents = {
            let state = self.state.lock().await;
            state
                .fs
                .read(remote)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| TransportError::NotFound(remote.to_string()))?
        };
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, contents).await?;
        Ok(())
    }

    async fn mkdir(&self, remote: &str, parents: bool) -> Result<()> {
        self.enter(MockOp::Mkdir).await?;
        let mut state = self.state.lock().await;
        let remote = normalize(remote);
        if !parents
            && let Some(parent) = parent_of(&remote)
            && parent != "/"
            && !state.fs.is_dir(parent)
        {
            return Err(TransportError::NotFound(parent.to_string()));
        }
        state.fs.mkdir_all(&remote);
        Ok(())
    }

    async fn listdir(&self, remote: &str) -> Result<Vec<String>> {
        self.enter(MockOp::Listdir).await?;
        let state = self.state.lock().await;
        if !state.fs.is_dir(remote) {
            return Err(TransportError::NotFound(remote.to_string()));
        }
        Ok(state.fs.list(remote))
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        self.enter(MockOp::Remove).await?;
        let mut state = self.state.lock().await;
        if !state.fs.exists(remote) {
            return Err(TransportError::NotFound(remote.to_string()));
        }
        state.fs.remove_tree(remote);
        Ok(())
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        self.enter(MockOp::Exists).await?;
        let state = self.state.lock().await;
        Ok(state.fs.exists(remote))
    }

    async fn close(&self) -> Result<()> {
        self.enter(MockOp::Close).await
    }
}
