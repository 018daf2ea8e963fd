//! RESP2 reply parser.
//!
//! Replies are parsed incrementally out of a connection's read buffer. A
//! successful parse reports how many bytes it consumed so the caller can
//! advance the buffer; partial data yields [`ParseResult::Incomplete`].
//!
//! Supported types:
//! - Simple Strings (+)
//! - Errors (-)
//! - Integers (:)
//! - Bulk Strings ($, with $-1 as null)
//! - Arrays (*, with *-1 as null)

use super::{RedisValue, ReplyError};
use bytes::Bytes;

/// Maximum nesting depth for arrays.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum bulk string size (512MB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array elements.
pub const MAX_ELEMENTS: usize = 1_000_000;

/// Parse result.
#[derive(Debug, PartialEq)]
pub enum ParseResult {
    /// Parsed a value, consuming the given number of bytes.
    Ok(RedisValue, usize),
    /// Need more data.
    Incomplete,
    /// The stream is not valid RESP2.
    Error(String),
}

/// RESP2 reply parser.
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one reply from the start of `data`.
    pub fn parse(&mut self, data: &[u8]) -> ParseResult {
        self.depth = 0;
        self.parse_value(data)
    }

    fn parse_value(&mut self, data: &[u8]) -> ParseResult {
        let Some(&type_byte) = data.first() else {
            return ParseResult::Incomplete;
        };
        if self.depth > MAX_NESTING_DEPTH {
            return ParseResult::Error("maximum nesting depth exceeded".to_string());
        }
        let body = &data[1..];
        match type_byte {
            b'+' => Self::parse_line(body, |line| {
                Ok(RedisValue::SimpleString(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }),
            b'-' => Self::parse_line(body, |line| {
                let s = String::from_utf8_lossy(line);
                let (kind, message) = match s.find(' ') {
                    Some(pos) => (&s[..pos], &s[pos + 1..]),
                    None => (&s[..], ""),
                };
                Ok(RedisValue::Error(ReplyError::new(kind, message)))
            }),
            b':' => Self::parse_line(body, |line| {
                parse_i64(line)
                    .map(RedisValue::Integer)
                    .ok_or_else(|| "invalid integer".to_string())
            }),
            b'$' => Self::parse_bulk_string(body),
            b'*' => self.parse_array(body),
            other => ParseResult::Error(format!("unexpected type byte 0x{other:02x}")),
        }
    }

    fn parse_line<F>(body: &[u8], f: F) -> ParseResult
    where
        F: FnOnce(&[u8]) -> Result<RedisValue, String>,
    {
        match find_crlf(body) {
            Some(pos) => match f(&body[..pos]) {
                Ok(value) => ParseResult::Ok(value, pos + 3), // +1 prefix, +2 CRLF
                Err(e) => ParseResult::Error(e),
            },
            None => ParseResult::Incomplete,
        }
    }

    fn parse_bulk_string(body: &[u8]) -> ParseResult {
        let Some(len_pos) = find_crlf(body) else {
            return ParseResult::Incomplete;
        };
        let len = match parse_i64(&body[..len_pos]) {
            Some(-1) => return ParseResult::Ok(RedisValue::Null, len_pos + 3),
            Some(len) if len >= 0 => len as usize,
            _ => return ParseResult::Error("invalid bulk string length".to_string()),
        };
        if len > MAX_BULK_SIZE {
            return ParseResult::Error(format!(
                "bulk string too large: {} > {}",
                len, MAX_BULK_SIZE
            ));
        }
        let start = len_pos + 2;
        let end = start + len;
        if body.len() < end + 2 {
            return ParseResult::Incomplete;
        }
        if &body[end..end + 2] != b"\r\n" {
            return ParseResult::Error("missing CRLF after bulk string".to_string());
        }
        ParseResult::Ok(
            RedisValue::BulkString(Bytes::copy_from_slice(&body[start..end])),
            end + 3,
        )
    }

    fn parse_array(&mut self, body: &[u8]) -> ParseResult {
        let Some(len_pos) = find_crlf(body) else {
            return ParseResult::Incomplete;
        };
        let len = match parse_i64(&body[..len_pos]) {
            Some(-1) => return ParseResult::Ok(RedisValue::Null, len_pos + 3),
            Some(len) if len >= 0 => len as usize,
            _ => return ParseResult::Error("invalid array length".to_string()),
        };
        if len > MAX_ELEMENTS {
            return ParseResult::Error(format!("array too large: {} > {}", len, MAX_ELEMENTS));
        }

        self.depth += 1;
        let mut elements = Vec::with_capacity(len.min(1024));
        let mut offset = len_pos + 2;
        for _ in 0..len {
            match self.parse_value(&body[offset..]) {
                ParseResult::Ok(value, consumed) => {
                    elements.push(value);
                    offset += consumed;
                }
                other => {
                    self.depth -= 1;
                    return other;
                }
            }
        }
        self.depth -= 1;
        ParseResult::Ok(RedisValue::Array(elements), offset + 1)
    }
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

/// Find CRLF in data, returning position of first \r.
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
