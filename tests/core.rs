//! Core infrastructure tests.

mod common;

use bytes::{Bytes, BytesMut};
use lorawan_coord::core::config::Config;
use lorawan_coord::core::context::Context;
use lorawan_coord::core::error::{ErrorCategory, StoreError};
use lorawan_coord::core::time::parse_duration;
use lorawan_coord::redis::{Cmd, ParseResult, RedisClient, RedisValue, RespParser};
use lorawan_coord::store::{Backend, LockAttempt, LockKeys, RedisBackend, StreamId};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_full_config() {
    let file = common::config_file(
        r#"
[redis]
address = "redis.internal:6380"
password = "secret"
database = 2
pool_size = 4

[namespaces]
ns = "eu1:ns"
as = "eu1:as"
js = "eu1:js"

[mutex]
ttl_ms = 2000

[tasks]
group = "dispatchers"
stream_block_limit_ms = 500

[dedup]
window_ms = 50
limit = 5

[cleanup]
page_size = 100
pagination_delay_ms = 0

[telemetry]
log_level = "debug"
"#,
    );

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.redis.address, "redis.internal:6380");
    assert_eq!(config.redis.password.as_deref(), Some("secret"));
    assert_eq!(config.redis.database, 2);
    assert_eq!(config.namespaces.r#as, "eu1:as");
    assert_eq!(config.mutex.ttl_ms, 2000);
    assert_eq!(config.mutex.max_attempts, 8);
    assert_eq!(config.tasks.group, "dispatchers");
    assert_eq!(config.uplinks.group, "uplinks");
    assert_eq!(config.dedup.limit, 5);
    assert_eq!(config.cleanup.pagination_delay_ms, 0);
    assert_eq!(config.telemetry.log_level, "debug");
}

#[test]
fn validate_invalid_log_level() {
    let file = common::config_file("[telemetry]\nlog_level = \"loud\"\n");
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("log_level"));
}

#[test]
fn validate_zero_limits() {
    for content in [
        "[redis]\npool_size = 0\n",
        "[mutex]\nmax_attempts = 0\n",
        "[dedup]\nlimit = 0\n",
        "[cleanup]\npage_size = 0\n",
        "[namespaces]\njs = \"\"\n",
    ] {
        assert!(Config::from_toml(content).is_err(), "{content}");
    }
}

#[test]
fn missing_config_file_is_an_error() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/lorawan-coord.toml"))
        .unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn parse_durations() {
    assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
    assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
    assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    assert_eq!(parse_duration(" 5m ").unwrap(), Duration::from_secs(300));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("5 days").is_err());
    assert!(parse_duration("ms").is_err());
}

// ============================================================================
// Context tests
// ============================================================================

#[tokio::test]
async fn shutdown_signal_cancels_context() {
    let (tx, rx) = watch::channel(false);
    let ctx = Context::background().with_shutdown(rx);
    assert!(ctx.check().is_ok());

    let sleeper = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.sleep(Duration::from_secs(30)).await })
    };
    tx.send(true).unwrap();
    let err = sleeper.await.unwrap().unwrap_err();
    assert_eq!(err, StoreError::Canceled);
    assert!(err.is_shutdown());
}

#[tokio::test]
async fn clamp_respects_deadline() {
    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    assert!(ctx.clamp(Duration::from_secs(10)) <= Duration::from_millis(50));
    assert_eq!(
        Context::background().clamp(Duration::from_secs(10)),
        Duration::from_secs(10)
    );
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn error_categories() {
    assert_eq!(StoreError::not_found("k").category(), ErrorCategory::NotFound);
    assert_eq!(
        StoreError::already_exists("d").category(),
        ErrorCategory::AlreadyExists
    );
    assert_eq!(
        StoreError::InvalidFieldmask { path: "x".into() }.category(),
        ErrorCategory::InvalidArgument
    );
    assert_eq!(StoreError::corruption("bad").category(), ErrorCategory::Corruption);
    assert!(StoreError::NoUplinkMatch.is_not_found());
    assert!(!StoreError::corruption("bad").is_retriable());
}

// ============================================================================
// Redis client tests
// ============================================================================

/// Serve one connection, answering the n-th command with `replies[n]`.
///
/// Resolves to the commands received.
async fn scripted_server(replies: Vec<&'static str>) -> (String, JoinHandle<Vec<Vec<Bytes>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut parser = RespParser::new();
        let mut buf = BytesMut::new();
        let mut received = Vec::new();
        let mut replies = replies.into_iter();
        loop {
            match parser.parse(&buf) {
                ParseResult::Ok(RedisValue::Array(parts), consumed) => {
                    let _ = buf.split_to(consumed);
                    received.push(
                        parts
                            .into_iter()
                            .filter_map(|p| p.into_bytes().ok().flatten())
                            .collect(),
                    );
                    match replies.next() {
                        Some(reply) => socket.write_all(reply.as_bytes()).await.unwrap(),
                        None => return received,
                    }
                }
                ParseResult::Ok(other, _) => panic!("unexpected request {other:?}"),
                ParseResult::Error(e) => panic!("protocol error: {e}"),
                ParseResult::Incomplete => {
                    if socket.read_buf(&mut buf).await.unwrap() == 0 {
                        return received;
                    }
                }
            }
        }
    });
    (address, handle)
}

fn client(address: String) -> RedisClient {
    let mut config = common::config().redis;
    config.address = address;
    config.io_timeout_ms = 1_000;
    RedisClient::new(config)
}

#[tokio::test]
async fn client_round_trips_commands() {
    let (address, server) =
        scripted_server(vec!["+OK\r\n", "$5\r\nhello\r\n", "$-1\r\n"]).await;
    let client = client(address);

    let ok = client
        .request(Cmd::new("SET").arg("greeting").arg("hello"))
        .await
        .unwrap();
    assert_eq!(ok, RedisValue::SimpleString("OK".into()));
    let value = client
        .request(Cmd::new("GET").arg("greeting"))
        .await
        .unwrap();
    assert_eq!(value, RedisValue::BulkString(Bytes::from_static(b"hello")));
    assert!(client
        .request(Cmd::new("GET").arg("missing"))
        .await
        .unwrap()
        .is_null());
    drop(client);

    let received = server.await.unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(&received[0][0][..], b"SET");
    assert_eq!(&received[1][1][..], b"greeting");
}

#[tokio::test]
async fn client_maps_error_replies() {
    let (address, _server) =
        scripted_server(vec!["-WRONGTYPE Operation against a key\r\n"]).await;
    let client = client(address);
    let err = client
        .request(Cmd::new("GET").arg("zset"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Corruption);
}

#[tokio::test]
async fn aborted_transaction() {
    let (address, _server) =
        scripted_server(vec!["+OK\r\n", "+QUEUED\r\n", "*-1\r\n"]).await;
    let client = client(address);
    let err = client
        .transaction(vec![Cmd::new("SET").arg("k").arg("v")])
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Aborted);
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = client(address)
        .request(Cmd::new("PING"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Unavailable);
}

// ============================================================================
// Redis backend scripts
// ============================================================================

#[tokio::test]
async fn script_falls_back_to_eval() {
    let (address, server) = scripted_server(vec![
        "$3\r\nabc\r\n",
        "-NOSCRIPT No matching script. Please use EVAL.\r\n",
        "*2\r\n:0\r\n:1500\r\n",
        "*2\r\n:1\r\n:0\r\n",
    ])
    .await;
    let backend = RedisBackend::new(client(address));
    let keys = LockKeys::for_key("dev");

    let held = backend
        .lock_acquire(keys.clone(), "a".into(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(
        held,
        LockAttempt::Held {
            remaining: Duration::from_millis(1500)
        }
    );
    let acquired = backend
        .lock_acquire(keys, "a".into(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(acquired, LockAttempt::Acquired);
    drop(backend);

    let received = server.await.unwrap();
    assert_eq!(received.len(), 4);
    assert_eq!(&received[0][0][..], b"SCRIPT");
    assert_eq!(&received[0][1][..], b"LOAD");
    // EVALSHA sha numkeys lock list id ttl
    assert_eq!(&received[1][0][..], b"EVALSHA");
    assert_eq!(&received[1][1][..], b"abc");
    assert_eq!(&received[1][2][..], b"2");
    assert_eq!(&received[1][3][..], b"dev:lock");
    assert_eq!(&received[1][4][..], b"dev:list");
    assert_eq!(&received[1][5][..], b"a");
    assert_eq!(&received[1][6][..], b"2000");
    assert_eq!(&received[2][0][..], b"EVAL");
    assert_eq!(&received[2][3][..], b"dev:lock");
    // The SHA stays cached after the fallback.
    assert_eq!(&received[3][0][..], b"EVALSHA");
}

#[tokio::test]
async fn deduplicate_script_arguments() {
    let (address, server) = scripted_server(vec!["$3\r\ndef\r\n", ":1\r\n", ":0\r\n"]).await;
    let backend = RedisBackend::new(client(address));

    let first = backend
        .deduplicate(
            LockKeys::for_key("up"),
            Duration::from_millis(250),
            5,
            vec![Bytes::from_static(b"m1")],
        )
        .await
        .unwrap();
    assert!(first);
    let again = backend
        .deduplicate(LockKeys::for_key("up"), Duration::from_millis(250), 5, Vec::new())
        .await
        .unwrap();
    assert!(!again);
    drop(backend);

    let received = server.await.unwrap();
    assert_eq!(&received[1][0][..], b"EVALSHA");
    assert_eq!(&received[1][5][..], b"250");
    assert_eq!(&received[1][6][..], b"5");
    assert_eq!(&received[1][7][..], b"m1");
    assert_eq!(received[2].len(), 7);
}

#[tokio::test]
async fn pending_entries_read_own_history() {
    let (address, server) = scripted_server(vec![
        "*1\r\n*2\r\n$5\r\ninput\r\n*2\r\n*2\r\n$3\r\n1-0\r\n*2\r\n$7\r\npayload\r\n$1\r\nx\r\n*2\r\n$3\r\n2-0\r\n$-1\r\n",
    ])
    .await;
    let backend = RedisBackend::new(client(address));

    let entries = backend
        .xpending_entries("input".into(), "group".into(), "dispatcher".into(), 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, StreamId::new(1, 0));
    assert_eq!(entries[0].field("payload").map(|v| &v[..]), Some(&b"x"[..]));
    drop(backend);

    let received = server.await.unwrap();
    assert_eq!(&received[0][0][..], b"XREADGROUP");
    assert_eq!(received[0].last().map(|v| &v[..]), Some(&b"0"[..]));
}
