use lumen_core::conn::{CheckState, HttpCode, HttpConn, Method, Processed};
use lumen_core::context::Context;
use lumen_core::signals::SignalPipe;
use lumen_core::store::{MemoryStore, StorePool, UserTable};
use lumen_core::syscalls::{Epoll, TrigMode};
use lumen_core::Router;
use std::fs;
use std::io::{Read, Write};
use std::os::fd::IntoRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const BIG_FILE_LEN: usize = 512 * 1024;

struct Fixture {
    _root: TempDir,
    _pipe: SignalPipe,
    ctx: Context,
}

fn publish(root: &Path, name: &str, contents: &[u8], mode: u32) {
    let path = root.join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

fn fixture(trig: TrigMode) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    publish(root.path(), "judge.html", b"<h1>judge</h1>", 0o644);
    publish(root.path(), "form.html", b"<form></form>", 0o644);
    publish(root.path(), "empty.html", b"", 0o644);
    publish(root.path(), "private.html", b"secret", 0o600);
    let big: Vec<u8> = (0..BIG_FILE_LEN).map(|i| (i % 251) as u8).collect();
    publish(root.path(), "big.bin", &big, 0o644);
    fs::create_dir(root.path().join("images")).unwrap();
    fs::set_permissions(root.path().join("images"), fs::Permissions::from_mode(0o755)).unwrap();

    let store = MemoryStore::new();
    let pool = Arc::new(StorePool::connect(&store, 1).unwrap());
    let users = Arc::new(UserTable::load(&pool).unwrap());
    let router = Router::new(root.path(), "judge.html", users, pool);

    let pipe = SignalPipe::new().unwrap();
    let ctx = Context::new(Epoll::new().unwrap(), 4, router, trig, pipe.notifier());
    Fixture {
        _root: root,
        _pipe: pipe,
        ctx,
    }
}

fn connect(ctx: &Context, token: u64) -> (HttpConn, UnixStream) {
    let (server, client) = UnixStream::pair().unwrap();
    let mut conn = HttpConn::new();
    conn.init(server.into_raw_fd(), None, token, ctx).unwrap();
    (conn, client)
}

/// Write the response, then close and return everything the client saw.
fn finish(mut conn: HttpConn, mut client: UnixStream, ctx: &Context) -> String {
    assert!(!conn.write(ctx), "non keep-alive response should ask for close");
    conn.close_conn(ctx);
    let mut out = String::new();
    client.read_to_string(&mut out).unwrap();
    out
}

#[derive(Debug, PartialEq)]
struct Parsed {
    code: HttpCode,
    method: Method,
    target: String,
    host: String,
    content_length: usize,
    keep_alive: bool,
    body: Vec<u8>,
}

fn snapshot(conn: &HttpConn, code: HttpCode) -> Parsed {
    let req = conn.request();
    Parsed {
        code,
        method: req.method,
        target: req.target.clone(),
        host: req.host.clone(),
        content_length: req.content_length,
        keep_alive: req.keep_alive,
        body: conn.body().to_vec(),
    }
}

const POST_REQUEST: &[u8] = b"POST /form.html HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nX-Ignored: yes\r\nContent-Length: 9\r\n\r\nuser=x&pw";

// ═══ incremental parsing ═══

#[test]
fn test_byte_at_a_time_matches_all_at_once() {
    let fx = fixture(TrigMode::Level);

    let (mut whole, mut client) = connect(&fx.ctx, 0);
    client.write_all(POST_REQUEST).unwrap();
    assert!(whole.read_once());
    let code = whole.process_read(&fx.ctx.router);
    assert_eq!(code, HttpCode::FileRequest);
    let expected = snapshot(&whole, code);

    let (mut split, mut client) = connect(&fx.ctx, 1);
    let mut last = HttpCode::NoRequest;
    for (i, byte) in POST_REQUEST.iter().enumerate() {
        client.write_all(&[*byte]).unwrap();
        assert!(split.read_once());
        last = split.process_read(&fx.ctx.router);
        if i + 1 < POST_REQUEST.len() {
            assert_eq!(last, HttpCode::NoRequest, "completed early at byte {}", i);
        }
    }
    assert_eq!(snapshot(&split, last), expected);
    assert_eq!(expected.body, b"user=x&pw");
    assert_eq!(expected.host, "example.com");
    assert!(expected.keep_alive);

    whole.close_conn(&fx.ctx);
    split.close_conn(&fx.ctx);
    assert_eq!(fx.ctx.metrics.live(), 0);
}

#[test]
fn test_edge_triggered_read_drains_socket() {
    let fx = fixture(TrigMode::Edge);
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client.write_all(b"GET /judge.html HTTP/1.1\r\n").unwrap();
    client.write_all(b"Host: x\r\n\r\n").unwrap();

    assert!(conn.read_once());
    assert_eq!(conn.process_read(&fx.ctx.router), HttpCode::FileRequest);
    conn.close_conn(&fx.ctx);
}

#[test]
fn test_root_is_rewritten_to_default_page() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::Ready);
    assert_eq!(conn.request().method, Method::Get);
    assert_eq!(conn.request().target, "/judge.html");

    let out = finish(conn, client, &fx.ctx);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("<h1>judge</h1>"));
}

#[test]
fn test_body_incomplete_until_content_length_arrives() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client
        .write_all(b"POST /form.html HTTP/1.1\r\nContent-Length: 5\r\n\r\nab")
        .unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::NeedMore);
    assert_eq!(conn.check_state(), CheckState::Body);

    client.write_all(b"cd").unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::NeedMore);

    client.write_all(b"e").unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::Ready);
    assert_eq!(conn.body(), b"abcde");
    conn.close_conn(&fx.ctx);
}

#[test]
fn test_read_buffer_exhaustion_fails() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client.write_all(&[b'a'; 3000]).unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::NeedMore);
    assert!(!conn.read_once());
    conn.close_conn(&fx.ctx);
}

#[test]
fn test_peer_close_fails_read() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, client) = connect(&fx.ctx, 0);
    drop(client);
    assert!(!conn.read_once());
    conn.close_conn(&fx.ctx);
}

// ═══ responses ═══

fn respond(fx: &Fixture, request: &[u8]) -> String {
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client.write_all(request).unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::Ready);
    finish(conn, client, &fx.ctx)
}

#[test]
fn test_zero_length_file_gets_empty_page() {
    let fx = fixture(TrigMode::Level);
    let out = respond(&fx, b"GET /empty.html HTTP/1.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Length: 26\r\n"));
    assert!(out.ends_with("\r\n\r\n<html><body></body></html>"));
}

#[test]
fn test_directory_is_bad_request() {
    let fx = fixture(TrigMode::Level);
    let out = respond(&fx, b"GET /images HTTP/1.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_missing_file_is_not_found() {
    let fx = fixture(TrigMode::Level);
    let out = respond(&fx, b"GET /nope.html HTTP/1.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(out.ends_with("The requested file was not found on this server.\n"));
}

#[test]
fn test_unreadable_file_is_forbidden() {
    let fx = fixture(TrigMode::Level);
    let out = respond(&fx, b"GET /private.html HTTP/1.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[test]
fn test_malformed_request_line_is_bad_request() {
    let fx = fixture(TrigMode::Level);
    let out = respond(&fx, b"BREW /pot HTTP/1.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(out.contains("Connection: close\r\n"));
}

#[test]
fn test_header_error_keeps_requested_keep_alive() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client
        .write_all(b"GET /missing HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: abc\r\n\r\n")
        .unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::Ready);
    assert!(conn.write(&fx.ctx), "keep-alive error response should keep the connection");
    assert_eq!(conn.check_state(), CheckState::RequestLine);

    let mut buf = [0u8; 512];
    let n = client.read(&mut buf).unwrap();
    let text = std::str::from_utf8(&buf[..n]).unwrap();
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(text.contains("Connection: keep-alive\r\n"));

    // The same connection still serves the next request.
    client
        .write_all(b"GET /judge.html HTTP/1.1\r\n\r\n")
        .unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::Ready);
    let out = finish(conn, client, &fx.ctx);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("<h1>judge</h1>"));
}

#[test]
fn test_keep_alive_resets_for_next_request() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, mut client) = connect(&fx.ctx, 0);

    for _ in 0..2 {
        client
            .write_all(b"GET /judge.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(conn.read_once());
        assert_eq!(conn.process(&fx.ctx), Processed::Ready);
        assert!(conn.write(&fx.ctx));
        assert_eq!(conn.check_state(), CheckState::RequestLine);
        assert_eq!(conn.bytes_to_send(), 0);

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("<h1>judge</h1>"));
    }
    conn.close_conn(&fx.ctx);
}

// ═══ partial writes ═══

#[test]
fn test_large_file_round_trip_is_exact() {
    let fx = fixture(TrigMode::Level);
    let (mut conn, mut client) = connect(&fx.ctx, 0);
    client.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();
    assert!(conn.read_once());
    assert_eq!(conn.process(&fx.ctx), Processed::Ready);

    let header_len = conn.header_len();
    let total = conn.bytes_to_send();
    assert_eq!(total, header_len + BIG_FILE_LEN);

    let reader = thread::spawn(move || {
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        out
    });

    let mut rounds = 0;
    while conn.write(&fx.ctx) {
        rounds += 1;
        assert!(rounds < 100_000, "write never finished");
        thread::sleep(Duration::from_millis(1));
    }
    conn.close_conn(&fx.ctx);

    let out = reader.join().unwrap();
    assert_eq!(out.len(), total);
    let body = &out[header_len..];
    assert!(body.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    assert_eq!(fx.ctx.metrics.bytes(), total);
}
