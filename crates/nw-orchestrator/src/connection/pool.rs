//! Session-scoped connection pool
//!
//! One live executor per `(caller session, device)` pair. The index is a single
//! `std::sync::Mutex` that is held only to read, insert or remove entries; all
//! network I/O (resolving, connecting, executing, closing) happens after the
//! guard is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use nw_core::config::PoolConfig;
use nw_core::error::WardenError;
use nw_core::traits::{CommandExecutor, ConnectionResolver, Connector};
use nw_core::types::{CommandOutput, DeviceId, SessionId};

type PoolKey = (SessionId, DeviceId);

/// Pool of connections to routers, scoped by caller session
pub struct ConnectionPool {
    index: Mutex<PoolIndex>,
    resolver: Arc<dyn ConnectionResolver>,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
}

#[derive(Default)]
struct PoolIndex {
    /// Active sessions and their last activity
    sessions: HashMap<SessionId, Instant>,
    connections: HashMap<PoolKey, PooledConnection>,
}

struct PooledConnection {
    executor: Arc<dyn CommandExecutor>,
    last_used: Instant,
}

/// What a reaper pass removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub sessions_expired: usize,
    pub connections_closed: usize,
}

fn same_executor(a: &Arc<dyn CommandExecutor>, b: &Arc<dyn CommandExecutor>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl ConnectionPool {
    /// Create an empty pool
    pub fn new(
        resolver: Arc<dyn ConnectionResolver>,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Self {
        Self {
            index: Mutex::new(PoolIndex::default()),
            resolver,
            connector,
            config,
        }
    }

    /// Pool tuning in effect
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a caller session. Calling again refreshes its activity timestamp.
    pub fn start_session(&self, session: &SessionId) {
        let mut index = self.lock();
        if index.sessions.insert(session.clone(), Instant::now()).is_none() {
            tracing::debug!("Session {} started", session);
        }
    }

    /// Remove a session and close every connection opened under it.
    ///
    /// Unknown sessions are ignored.
    pub async fn end_session(&self, session: &SessionId) {
        let closed = {
            let mut index = self.lock();
            if index.sessions.remove(session).is_none() {
                return;
            }
            Self::drain_session(&mut index, session)
        };

        tracing::debug!(
            "Session {} ended, closing {} connection(s)",
            session,
            closed.len()
        );
        for executor in closed {
            executor.close().await;
        }
    }

    fn drain_session(index: &mut PoolIndex, session: &SessionId) -> Vec<Arc<dyn CommandExecutor>> {
        let keys: Vec<PoolKey> = index
            .connections
            .keys()
            .filter(|(s, _)| s == session)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| index.connections.remove(&key))
            .map(|conn| conn.executor)
            .collect()
    }

    /// Whether the session is currently tracked
    pub fn is_session_active(&self, session: &SessionId) -> bool {
        self.lock().sessions.contains_key(session)
    }

    /// Number of tracked sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Number of pooled connections
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Run a command on a device on behalf of a session.
    ///
    /// A transport failure discards the connection and the command is retried
    /// exactly once on a freshly established one. Failures to establish a
    /// connection are returned immediately.
    pub async fn execute(
        &self,
        session: &SessionId,
        device: &DeviceId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, WardenError> {
        let executor = self.checkout(session, device).await?;

        match executor.execute(command, timeout).await {
            Ok(output) => {
                self.touch(session, device);
                Ok(output)
            }
            Err(err) => {
                tracing::warn!(
                    "Transport failure on {} for session {}: {}. Reconnecting once",
                    device,
                    session,
                    err
                );
                self.discard(session, device, &executor).await;

                let fresh = self.establish(session, device).await?;
                match fresh.execute(command, timeout).await {
                    Ok(output) => {
                        self.touch(session, device);
                        Ok(output)
                    }
                    Err(err) => {
                        self.discard(session, device, &fresh).await;
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Get a live executor for the pair, connecting if needed
    async fn checkout(
        &self,
        session: &SessionId,
        device: &DeviceId,
    ) -> Result<Arc<dyn CommandExecutor>, WardenError> {
        let stale = {
            let mut index = self.lock();
            let now = Instant::now();
            match index.sessions.get_mut(session) {
                Some(last_activity) => *last_activity = now,
                None => return Err(WardenError::SessionExpired(session.to_string())),
            }

            let key = (session.clone(), device.clone());
            let alive = index
                .connections
                .get(&key)
                .map(|conn| conn.executor.is_alive());
            match alive {
                Some(true) => {
                    let conn = index.connections.get_mut(&key).map(|conn| {
                        conn.last_used = now;
                        Arc::clone(&conn.executor)
                    });
                    if let Some(executor) = conn {
                        return Ok(executor);
                    }
                    None
                }
                Some(false) => index.connections.remove(&key),
                None => None,
            }
        };

        if let Some(stale) = stale {
            tracing::debug!("Dropping dead connection to {} for session {}", device, session);
            stale.executor.close().await;
        }

        self.establish(session, device).await
    }

    /// Resolve, connect and register a new executor for the pair
    async fn establish(
        &self,
        session: &SessionId,
        device: &DeviceId,
    ) -> Result<Arc<dyn CommandExecutor>, WardenError> {
        let params = self.resolver.resolve(device).await?;
        tracing::debug!(
            "Connecting to {} at {} for session {}",
            device,
            params.endpoint(),
            session
        );
        let executor = self.connector.connect(&params).await?;

        let (result, orphan) = {
            let mut index = self.lock();
            if !index.sessions.contains_key(session) {
                (
                    Err(WardenError::SessionExpired(session.to_string())),
                    Some(executor),
                )
            } else {
                let key = (session.clone(), device.clone());
                let existing = index
                    .connections
                    .get(&key)
                    .filter(|conn| conn.executor.is_alive())
                    .map(|conn| Arc::clone(&conn.executor));
                match existing {
                    // Another caller won the race; keep theirs
                    Some(existing) => (Ok(existing), Some(executor)),
                    None => {
                        let replaced = index.connections.insert(
                            key,
                            PooledConnection {
                                executor: Arc::clone(&executor),
                                last_used: Instant::now(),
                            },
                        );
                        (Ok(executor), replaced.map(|conn| conn.executor))
                    }
                }
            }
        };

        if let Some(orphan) = orphan {
            orphan.close().await;
        }
        result
    }

    fn touch(&self, session: &SessionId, device: &DeviceId) {
        let mut index = self.lock();
        let now = Instant::now();
        if let Some(last_activity) = index.sessions.get_mut(session) {
            *last_activity = now;
        }
        if let Some(conn) = index
            .connections
            .get_mut(&(session.clone(), device.clone()))
        {
            conn.last_used = now;
        }
    }

    /// Remove the pair's entry if it still holds `executor`, then close it
    async fn discard(
        &self,
        session: &SessionId,
        device: &DeviceId,
        executor: &Arc<dyn CommandExecutor>,
    ) {
        {
            let mut index = self.lock();
            let key = (session.clone(), device.clone());
            let matches = index
                .connections
                .get(&key)
                .is_some_and(|conn| same_executor(&conn.executor, executor));
            if matches {
                index.connections.remove(&key);
            }
        }
        executor.close().await;
    }

    /// Expire idle sessions and close idle connections
    pub async fn reap(&self) -> ReapSummary {
        let now = Instant::now();
        let (closed, summary) = {
            let mut index = self.lock();

            let expired: Vec<SessionId> = index
                .sessions
                .iter()
                .filter(|(_, last)| {
                    now.saturating_duration_since(**last) > self.config.session_idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();

            let mut closed = Vec::new();
            for session in &expired {
                index.sessions.remove(session);
                closed.extend(Self::drain_session(&mut index, session));
            }

            let idle: Vec<PoolKey> = index
                .connections
                .iter()
                .filter(|(_, conn)| {
                    now.saturating_duration_since(conn.last_used)
                        > self.config.connection_idle_timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            closed.extend(
                idle.iter()
                    .filter_map(|key| index.connections.remove(key))
                    .map(|conn| conn.executor),
            );

            let summary = ReapSummary {
                sessions_expired: expired.len(),
                connections_closed: closed.len(),
            };
            (closed, summary)
        };

        for executor in closed {
            executor.close().await;
        }
        summary
    }

    /// Close every connection and forget every session
    pub async fn shutdown(&self) {
        let closed: Vec<Arc<dyn CommandExecutor>> = {
            let mut index = self.lock();
            index.sessions.clear();
            index.connections.drain().map(|(_, conn)| conn.executor).collect()
        };
        for executor in closed {
            executor.close().await;
        }
    }
}
