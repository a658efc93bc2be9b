// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection pool.
//!
//! One entry per computer. Each entry bounds the number of concurrently
//! checked-out connections with a semaphore; callers beyond the limit
//! wait in FIFO order. Idle connections are reused, and a connection that
//! saw a retryable failure is closed instead of going back to the pool.
//! Dropping a checkout never blocks: closes and contended returns finish on
//! a spawned task.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use super::traits::*;

struct HostPool {
    computer: String,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    max_connections: usize,
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

/// Pool of transport connections keyed by computer name.
#[derive(Default)]
pub struct TransportPool {
    hosts: RwLock<HashMap<String, Arc<HostPool>>>,
}

impl std::fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool").finish_non_exhaustive()
    }
}

impl TransportPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a computer. Replaces any previous registration.
    pub async fn register(
        &self,
        computer: &str,
        transport: Arc<dyn Transport>,
        max_connections: usize,
    ) {
        let max_connections = max_connections.max(1);
        info!(
            computer,
            transport = transport.transport_type(),
            max_connections,
            "Registered transport"
        );
        self.hosts.write().await.insert(
            computer.to_string(),
            Arc::new(HostPool {
                computer: computer.to_string(),
                transport,
                permits: Arc::new(Semaphore::new(max_connections)),
                max_connections,
                idle: Mutex::new(Vec::new()),
            }),
        );
    }

    async fn host(&self, computer: &str) -> Result<Arc<HostPool>> {
        self.hosts
            .read()
            .await
            .get(computer)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("unknown computer '{computer}'")))
    }

    /// Check out a connection, waiting while the computer is at its limit.
    pub async fn acquire(&self, computer: &str) -> Result<PooledConnection> {
        let host = self.host(computer).await?;
        let permit = host
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;

        let reused = host.idle.lock().await.pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!(computer, "Opening new connection");
                host.transport.open().await?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            host,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            permit: Some(permit),
        })
    }

    /// Connections currently checked out for `computer`.
    pub async fn in_use(&self, computer: &str) -> usize {
        match self.host(computer).await {
            Ok(host) => host.max_connections - host.permits.available_permits(),
            Err(_) => 0,
        }
    }

    /// Idle connections kept for `computer`.
    pub async fn idle(&self, computer: &str) -> usize {
        match self.host(computer).await {
            Ok(host) => host.idle.lock().await.len(),
            Err(_) => 0,
        }
    }

    /// Close every idle connection.
    pub async fn close_idle(&self) {
        let hosts: Vec<Arc<HostPool>> = self.hosts.read().await.values().cloned().collect();
        for host in hosts {
            let drained: Vec<_> = host.idle.lock().await.drain(..).collect();
            if !drained.is_empty() {
                debug!(computer = %host.computer, count = drained.len(), "Closing idle connections");
            }
            for conn in drained {
                close_logged(conn, &host.computer).await;
            }
        }
    }
}

async fn close_logged(conn: Box<dyn Connection>, computer: &str) {
    if let Err(e) = conn.close().await {
        warn!(computer, error = %e, "Failed to close connection");
    }
}

/// Run cleanup that cannot happen inside `Drop`.
fn spawn_detached(task: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => debug!("No runtime left for connection cleanup"),
    }
}

/// A checked-out connection. Returns to the pool on drop unless it failed
/// with a retryable error.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    host: Arc<HostPool>,
    broken: AtomicBool,
    closed: AtomicBool,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Drop the connection instead of returning it to the pool.
    pub fn invalidate(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn inner(&self) -> Result<&dyn Connection> {
        self.conn.as_deref().ok_or(TransportError::Closed)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_retryable()
        {
            self.invalidate();
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let host = self.host.clone();
        if self.broken.load(Ordering::SeqCst) {
            debug!(computer = %host.computer, "Discarding broken connection");
            spawn_detached(async move { close_logged(conn, &host.computer).await });
            return;
        }
        // Returned before the permit is released, so the next waiter can reuse it
        if let Ok(mut idle) = host.idle.try_lock() {
            idle.push(conn);
            return;
        }
        let permit = self.permit.take();
        spawn_detached(async move {
            host.idle.lock().await.push(conn);
            drop(permit);
        });
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn exec(&self, command: &str, workdir: Option<&str>) -> Result<CommandOutput> {
        let result = self.inner()?.exec(command, workdir).await;
        self.track(result)
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let result = self.inner()?.put(local, remote).await;
        self.track(result)
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let result = self.inner()?.get(remote, local).await;
        self.track(result)
    }

    async fn mkdir(&self, remote: &str, parents: bool) -> Result<()> {
        let result = self.inner()?.mkdir(remote, parents).await;
        self.track(result)
    }

    async fn listdir(&self, remote: &str) -> Result<Vec<String>> {
        let result = self.inner()?.listdir(remote).await;
        self.track(result)
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        let result = self.inner()?.remove(remote).await;
        self.track(result)
    }

    async fn exists(&self, remote: &str) -> Result<bool> {
        let result = self.inner()?.exists(remote).await;
        self.track(result)
    }

    async fn close(&self) -> Result<()> {
        self.invalidate();
        self.closed.store(true, Ordering::SeqCst);
        self.inner()?.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockFault, MockOp, MockTransport};
    use std::time::Duration;

    #[tokio::test]
    async fn test_connections_are_reused() {
        let mock = MockTransport::new();
        let pool = TransportPool::new();
        pool.register("hpc", Arc::new(mock.clone()), 2).await;

        for _ in 0..5 {
            let conn = pool.acquire("hpc").await.unwrap();
            conn.exec("true", None).await.unwrap();
        }

        assert_eq!(mock.calls(MockOp::Open).await, 1);
        assert_eq!(pool.idle("hpc").await, 1);
        assert_eq!(pool.in_use("hpc").await, 0);
    }

    #[tokio::test]
    async fn test_limit_applies_backpressure() {
        let pool = Arc::new(TransportPool::new());
        pool.register("hpc", Arc::new(MockTransport::new()), 1).await;

        let first = pool.acquire("hpc").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("hpc").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.in_use("hpc").await, 1);

        drop(first);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_retryable_failure_discards_connection() {
        let mock = MockTransport::new();
        mock.fail_next(MockOp::Exec, 1, MockFault::Connection).await;
        let pool = TransportPool::new();
        pool.register("hpc", Arc::new(mock.clone()), 1).await;

        {
            let conn = pool.acquire("hpc").await.unwrap();
            assert!(conn.exec("true", None).await.is_err());
        }
        assert_eq!(pool.idle("hpc").await, 0);

        let conn = pool.acquire("hpc").await.unwrap();
        conn.exec("true", None).await.unwrap();
        assert_eq!(mock.calls(MockOp::Open).await, 2);
    }

    #[tokio::test]
    async fn test_broken_connection_is_closed() {
        let mock = MockTransport::new();
        mock.fail_next(MockOp::Exec, 1, MockFault::Connection).await;
        let pool = TransportPool::new();
        pool.register("hpc", Arc::new(mock.clone()), 1).await;

        {
            let conn = pool.acquire("hpc").await.unwrap();
            assert!(conn.exec("true", None).await.is_err());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(mock.calls(MockOp::Close).await, 1);
        assert_eq!(pool.idle("hpc").await, 0);
    }

    #[tokio::test]
    async fn test_return_under_contention_is_not_lost() {
        let mock = MockTransport::new();
        let pool = TransportPool::new();
        pool.register("hpc", Arc::new(mock.clone()), 1).await;

        let conn = pool.acquire("hpc").await.unwrap();
        let host = pool.host("hpc").await.unwrap();
        let guard = host.idle.lock().await;
        drop(conn);

        // The checkout stays counted until it is back in the idle list
        assert_eq!(pool.in_use("hpc").await, 1);
        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.idle("hpc").await, 1);
        assert_eq!(pool.in_use("hpc").await, 0);
        assert_eq!(mock.calls(MockOp::Close).await, 0);

        pool.acquire("hpc").await.unwrap().exec("true", None).await.unwrap();
        assert_eq!(mock.calls(MockOp::Open).await, 1);
    }

    #[tokio::test]
    async fn test_close_idle_closes_every_connection() {
        let mock = MockTransport::new();
        mock.fail_next(MockOp::Close, 1, MockFault::Connection).await;
        let pool = TransportPool::new();
        pool.register("hpc", Arc::new(mock.clone()), 2).await;

        let first = pool.acquire("hpc").await.unwrap();
        let second = pool.acquire("hpc").await.unwrap();
        drop(first);
        drop(second);
        assert_eq!(pool.idle("hpc").await, 2);

        pool.close_idle().await;

        assert_eq!(mock.calls(MockOp::Close).await, 2);
        assert_eq!(pool.idle("hpc").await, 0);
    }

    #[tokio::test]
    async fn test_unknown_computer() {
        let pool = TransportPool::new();
        assert!(pool.acquire("nowhere").await.is_err());
    }
}
