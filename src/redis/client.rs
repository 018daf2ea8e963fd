//! Pooled Redis client.

use super::{Cmd, Connection, RedisValue};
use crate::core::config::RedisConfig;
use crate::core::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

struct Pool {
    config: RedisConfig,
    idle: Mutex<Vec<Connection>>,
}

impl Pool {
    fn release(&self, conn: Connection) {
        if conn.is_broken() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.config.pool_size {
            idle.push(conn);
        }
    }
}

/// A connection checked out of the pool.
///
/// Returned to the pool on drop unless it is broken.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl PooledConnection {
    /// Drop the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.conn.take();
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// A cloneable handle to a pool of Redis connections.
#[derive(Clone)]
pub struct RedisClient {
    pool: Arc<Pool>,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("address", &self.pool.config.address)
            .field("idle", &self.pool.idle.lock().len())
            .finish()
    }
}

impl RedisClient {
    /// Create a client. Connections are opened lazily.
    pub fn new(config: RedisConfig) -> Self {
        Self {
            pool: Arc::new(Pool {
                config,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.pool.config
    }

    /// Check out a connection, opening one if none is idle.
    pub async fn connection(&self) -> StoreResult<PooledConnection> {
        let idle = self.pool.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open().await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.pool.clone(),
        })
    }

    async fn open(&self) -> StoreResult<Connection> {
        let config = &self.pool.config;
        let mut conn = Connection::connect(
            &config.address,
            config.connect_timeout(),
            config.io_timeout(),
        )
        .await?;
        if let Some(password) = &config.password {
            conn.request(&Cmd::new("AUTH").arg(password))
                .await?
                .into_result()?;
        }
        if config.database != 0 {
            conn.request(&Cmd::new("SELECT").arg(config.database))
                .await?
                .into_result()?;
        }
        tracing::debug!(address = %config.address, "opened redis connection");
        Ok(conn)
    }

    /// Run one command; error replies become errors.
    pub async fn request(&self, cmd: Cmd) -> StoreResult<RedisValue> {
        let mut conn = self.connection().await?;
        conn.request(&cmd).await?.into_result()
    }

    /// Run a command that blocks server-side for up to `wait`.
    pub async fn request_blocking(&self, cmd: Cmd, wait: Duration) -> StoreResult<RedisValue> {
        let mut conn = self.connection().await?;
        conn.request_blocking(&cmd, wait).await?.into_result()
    }

    /// Run commands in one round trip; replies are returned unchecked.
    pub async fn pipeline(&self, cmds: Vec<Cmd>) -> StoreResult<Vec<RedisValue>> {
        let mut conn = self.connection().await?;
        conn.pipeline(&cmds).await
    }

    /// Run commands inside `MULTI`/`EXEC` and return the EXEC results.
    pub async fn transaction(&self, cmds: Vec<Cmd>) -> StoreResult<Vec<RedisValue>> {
        let mut conn = self.connection().await?;
        exec_on(&mut conn, cmds).await
    }
}

/// Run `cmds` atomically on `conn` with `MULTI`/`EXEC`.
///
/// A nil EXEC reply means a watched key changed and maps to `Aborted`.
pub async fn exec_on(conn: &mut Connection, cmds: Vec<Cmd>) -> StoreResult<Vec<RedisValue>> {
    let n = cmds.len();
    let mut batch = Vec::with_capacity(n + 2);
    batch.push(Cmd::new("MULTI"));
    batch.extend(cmds);
    batch.push(Cmd::new("EXEC"));
    let mut replies = conn.pipeline(&batch).await?;
    let exec = replies
        .pop()
        .ok_or_else(|| StoreError::corruption("missing EXEC reply"))?;
    for queued in replies {
        // +OK for MULTI, +QUEUED per command, or an error that poisons EXEC.
        queued.into_result()?;
    }
    match exec {
        RedisValue::Null => Err(StoreError::Aborted),
        RedisValue::Array(results) if results.len() == n => Ok(results),
        RedisValue::Array(results) => Err(StoreError::corruption(format!(
            "EXEC returned {} results for {} commands",
            results.len(),
            n
        ))),
        other => other.into_result().and_then(|v| {
            Err(StoreError::corruption(format!(
                "unexpected EXEC reply {v:?}"
            )))
        }),
    }
}
