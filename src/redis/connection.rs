//! A single RESP2 connection.
//!
//! Requests are written whole and replies are read back in order, so a
//! pipeline of N commands yields exactly N replies. A connection that hit
//! an I/O error or timeout is marked broken and must not be reused.

use super::{Cmd, ParseResult, RedisValue, RespParser};
use crate::core::error::{StoreError, StoreResult};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Initial read buffer capacity.
const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// A connection to a Redis server.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    parser: RespParser,
    io_timeout: Duration,
    broken: bool,
}

impl Connection {
    /// Connect to `address` within `connect_timeout`.
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> StoreResult<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| StoreError::unavailable(format!("connect to {address} timed out")))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            parser: RespParser::new(),
            io_timeout,
            broken: false,
        })
    }

    /// Check if the connection saw an error and must be dropped.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send one command and read its reply.
    ///
    /// Error replies are returned as [`RedisValue::Error`].
    pub async fn request(&mut self, cmd: &Cmd) -> StoreResult<RedisValue> {
        let mut replies = self.pipeline(std::slice::from_ref(cmd)).await?;
        replies
            .pop()
            .ok_or_else(|| StoreError::corruption("missing reply"))
    }

    /// Send a command that may block server-side for up to `wait`.
    pub async fn request_blocking(&mut self, cmd: &Cmd, wait: Duration) -> StoreResult<RedisValue> {
        let timeout = wait + self.io_timeout;
        let mut replies = self.exchange(std::slice::from_ref(cmd), timeout).await?;
        replies
            .pop()
            .ok_or_else(|| StoreError::corruption("missing reply"))
    }

    /// Send several commands in one write and read all replies.
    pub async fn pipeline(&mut self, cmds: &[Cmd]) -> StoreResult<Vec<RedisValue>> {
        let timeout = self.io_timeout;
        self.exchange(cmds, timeout).await
    }

    async fn exchange(&mut self, cmds: &[Cmd], timeout: Duration) -> StoreResult<Vec<RedisValue>> {
        if self.broken {
            return Err(StoreError::unavailable("connection is broken"));
        }
        // Stays set if this future is dropped midway: the reply stream is
        // then out of step with the requests.
        self.broken = true;
        let replies = tokio::time::timeout(timeout, async {
            self.write_cmds(cmds).await?;
            let mut replies = Vec::with_capacity(cmds.len());
            for _ in cmds {
                replies.push(self.read_reply().await?);
            }
            Ok::<_, StoreError>(replies)
        })
        .await
        .map_err(|_| StoreError::unavailable("redis request timed out"))??;
        self.broken = false;
        Ok(replies)
    }

    async fn write_cmds(&mut self, cmds: &[Cmd]) -> StoreResult<()> {
        let mut buf = Vec::with_capacity(64 * cmds.len());
        for cmd in cmds {
            cmd.encode_into(&mut buf);
        }
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> StoreResult<RedisValue> {
        loop {
            match self.parser.parse(&self.read_buf) {
                ParseResult::Ok(value, consumed) => {
                    self.read_buf.advance(consumed);
                    return Ok(value);
                }
                ParseResult::Error(e) => {
                    return Err(StoreError::corruption(format!("protocol error: {e}")));
                }
                ParseResult::Incomplete => {}
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(StoreError::unavailable("connection closed by server"));
            }
        }
    }
}
