//! Redis client transport.
//!
//! A small RESP2 client: commands are encoded as arrays of bulk strings,
//! replies are parsed into [`RedisValue`]. Connections are pooled by
//! [`RedisClient`]; a connection can be taken out of the pool for
//! `WATCH`/`MULTI`/`EXEC` sessions that need connection affinity.
//!
//! ```text
//! ┌──────────────┐  Cmd  ┌────────────┐  RESP2  ┌────────┐
//! │ RedisBackend │ ────▶ │ RedisClient│ ──────▶ │ Redis  │
//! │ (store seam) │ ◀──── │  (pool)    │ ◀────── │ server │
//! └──────────────┘ Value └────────────┘         └────────┘
//! ```

pub mod client;
pub mod connection;
pub mod resp;

use crate::core::error::StoreError;
use bytes::Bytes;

pub use client::RedisClient;
pub use connection::Connection;
pub use resp::{ParseResult, RespParser};

/// A reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    /// Simple string (+OK\r\n)
    SimpleString(String),

    /// Error (-ERR message\r\n)
    Error(ReplyError),

    /// Integer (:1000\r\n)
    Integer(i64),

    /// Bulk string ($6\r\nfoobar\r\n)
    BulkString(Bytes),

    /// Array (*2\r\n...)
    Array(Vec<RedisValue>),

    /// Null ($-1\r\n or *-1\r\n)
    Null,
}

impl RedisValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert an error reply into a store error, passing other values.
    pub fn into_result(self) -> Result<RedisValue, StoreError> {
        match self {
            Self::Error(e) => Err(e.into()),
            other => Ok(other),
        }
    }

    /// Interpret as an optional blob.
    pub fn into_bytes(self) -> Result<Option<Bytes>, StoreError> {
        match self {
            Self::Null => Ok(None),
            Self::BulkString(b) => Ok(Some(b)),
            Self::SimpleString(s) => Ok(Some(Bytes::from(s))),
            Self::Error(e) => Err(e.into()),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Interpret as a UTF-8 string.
    pub fn into_string(self) -> Result<String, StoreError> {
        match self.into_bytes()? {
            Some(b) => String::from_utf8(b.to_vec())
                .map_err(|_| StoreError::corruption("reply is not valid UTF-8")),
            None => Err(StoreError::corruption("unexpected nil reply")),
        }
    }

    /// Interpret as an integer.
    pub fn into_int(self) -> Result<i64, StoreError> {
        match self {
            Self::Integer(n) => Ok(n),
            Self::BulkString(b) => std::str::from_utf8(&b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StoreError::corruption("reply is not an integer")),
            Self::Error(e) => Err(e.into()),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Interpret as a float (sorted set scores arrive as bulk strings).
    pub fn into_float(self) -> Result<f64, StoreError> {
        match self {
            Self::Integer(n) => Ok(n as f64),
            Self::BulkString(b) => std::str::from_utf8(&b)
                .ok()
                .and_then(|s| match s {
                    "inf" | "+inf" => Some(f64::INFINITY),
                    "-inf" => Some(f64::NEG_INFINITY),
                    s => s.parse().ok(),
                })
                .ok_or_else(|| StoreError::corruption("reply is not a float")),
            Self::Error(e) => Err(e.into()),
            other => Err(unexpected("float", &other)),
        }
    }

    /// Interpret as an array; nil becomes empty.
    pub fn into_array(self) -> Result<Vec<RedisValue>, StoreError> {
        match self {
            Self::Array(a) => Ok(a),
            Self::Null => Ok(Vec::new()),
            Self::Error(e) => Err(e.into()),
            other => Err(unexpected("array", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &RedisValue) -> StoreError {
    StoreError::corruption(format!("expected {expected} reply, got {got:?}"))
}

/// An error reply sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    /// Error kind (ERR, WRONGTYPE, NOSCRIPT, etc.)
    pub kind: String,
    /// Error message.
    pub message: String,
}

impl ReplyError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_noscript(&self) -> bool {
        self.kind == "NOSCRIPT"
    }

    pub fn is_busygroup(&self) -> bool {
        self.kind == "BUSYGROUP"
    }
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.message)
    }
}

impl From<ReplyError> for StoreError {
    fn from(err: ReplyError) -> Self {
        match err.kind.as_str() {
            "EXECABORT" => StoreError::Aborted,
            "WRONGTYPE" => StoreError::corruption(err.to_string()),
            "NOGROUP" => StoreError::not_found(err.message),
            "LOADING" | "MASTERDOWN" | "READONLY" | "BUSY" | "CLUSTERDOWN" | "TRYAGAIN" => {
                StoreError::unavailable(err.to_string())
            }
            _ => StoreError::unavailable(format!("redis error: {err}")),
        }
    }
}

/// A command ready to be written to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    args: Vec<Bytes>,
}

impl Cmd {
    /// Start a command with its name.
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl CmdArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Append several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: CmdArg,
    {
        self.args.extend(args.into_iter().map(CmdArg::into_arg));
        self
    }

    /// Command name, for logging.
    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.args[0]).unwrap_or("?")
    }

    /// Encode as a RESP2 array of bulk strings.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(b'*');
        buf.extend_from_slice(self.args.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        for arg in &self.args {
            buf.push(b'$');
            buf.extend_from_slice(arg.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(arg);
            buf.extend_from_slice(b"\r\n");
        }
    }
}

/// Types that can be passed as command arguments.
pub trait CmdArg {
    fn into_arg(self) -> Bytes;
}

impl CmdArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl CmdArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl CmdArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl CmdArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl CmdArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl CmdArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

macro_rules! int_arg {
    ($($t:ty),*) => {
        $(impl CmdArg for $t {
            fn into_arg(self) -> Bytes {
                Bytes::from(self.to_string())
            }
        })*
    };
}

int_arg!(i64, u64, u32, usize);

impl CmdArg for f64 {
    fn into_arg(self) -> Bytes {
        if self == f64::INFINITY {
            Bytes::from_static(b"+inf")
        } else if self == f64::NEG_INFINITY {
            Bytes::from_static(b"-inf")
        } else {
            Bytes::from(format!("{self}"))
        }
    }
}
