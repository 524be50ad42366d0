//! End-to-end tests over real sockets: literal request bytes in, literal
//! reply bytes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use replikv::db::Db;
use replikv::info::ServerInfo;
use replikv::replication::{self, Replicas};
use replikv::server;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

async fn start_master() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let db = Db::new();
    let info = Arc::new(ServerInfo::master());
    let (replicas, commands) = Replicas::new();

    tokio::spawn(replication::notify_loop(Arc::clone(&replicas), commands));
    tokio::spawn(server::run(
        listener,
        db,
        info,
        Some(replicas),
        std::future::pending::<()>(),
    ));

    addr
}

/// A replica-role server without a live master link; enough to observe
/// the read-only gating of user connections.
async fn start_replica() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let db = Db::new();
    let info = Arc::new(ServerInfo::replica());

    tokio::spawn(server::run(
        listener,
        db,
        info,
        None,
        std::future::pending::<()>(),
    ));

    addr
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];

    timeout(READ_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for reply")
        .expect("read failed");

    buf
}

async fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).await.unwrap();

    let reply = read_exactly(stream, expected.len()).await;
    assert_eq!(
        reply,
        expected,
        "got {:?}",
        String::from_utf8_lossy(&reply)
    );
}

#[tokio::test]
async fn ping_answers_pong() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(&mut stream, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;
}

#[tokio::test]
async fn echo_answers_its_argument() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(&mut stream, b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n", b"+hey\r\n").await;
}

#[tokio::test]
async fn set_then_get_returns_the_value() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
        b"+OK\r\n",
    )
    .await;
    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$1\r\nv\r\n").await;
}

#[tokio::test]
async fn get_of_missing_key_is_nil() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn px_expiry_turns_the_value_nil() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nPX\r\n$3\r\n100\r\n",
        b"+OK\r\n",
    )
    .await;

    // still inside the window
    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$1\r\nv\r\n").await;

    sleep(Duration::from_millis(150)).await;

    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn info_reports_the_replication_block() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n")
        .await
        .unwrap();

    // the reply is one bulk frame; read until its closing CRLF
    let mut reply = Vec::new();
    while !reply.ends_with(b"master_repl_offset:0\r\n\r\n") {
        let mut chunk = [0u8; 256];
        let n = timeout(READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for INFO reply")
            .expect("read failed");
        assert!(n > 0, "connection closed mid-reply");
        reply.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with('$'));

    let body_at = text.find("\r\n").unwrap() + 2;
    let body = &text[body_at..];
    assert!(body.starts_with("# Replication\r\nrole:master\r\nmaster_replid:"));

    let replid_at = body.find("master_replid:").unwrap() + "master_replid:".len();
    let replid = &body[replid_at..replid_at + 40];
    assert!(replid.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(body[replid_at + 40..].starts_with("\r\nmaster_repl_offset:0\r\n"));
}

#[tokio::test]
async fn wait_reports_zero_replicas_on_a_fresh_master() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*3\r\n$4\r\nWAIT\r\n$1\r\n0\r\n$1\r\n0\r\n",
        b":0\r\n",
    )
    .await;
}

#[tokio::test]
async fn command_split_across_arbitrary_chunks_is_reassembled() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // one SET delivered in awkward pieces, cutting a length header and a
    // payload in half
    for chunk in [
        &b"*3\r\n$"[..],
        &b"3\r\nSET\r\n$6\r\nchu"[..],
        &b"nky\r\n$1"[..],
        &b"\r\nv\r\n"[..],
    ] {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        sleep(Duration::from_millis(10)).await;
    }

    let reply = read_exactly(&mut stream, b"+OK\r\n".len()).await;
    assert_eq!(reply, b"+OK\r\n");

    roundtrip(
        &mut stream,
        b"*2\r\n$3\r\nGET\r\n$6\r\nchunky\r\n",
        b"$1\r\nv\r\n",
    )
    .await;
}

#[tokio::test]
async fn pipelined_commands_are_answered_in_order() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n*1\r\n$4\r\nPING\r\n",
        b"+PONG\r\n+hi\r\n+PONG\r\n",
    )
    .await;
}

#[tokio::test]
async fn set_on_a_replica_is_rejected_read_only() {
    let addr = start_replica().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
        b"-READONLY You can't write against a read only replica.\r\n",
    )
    .await;

    // the rejected write really did not land
    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn reads_are_served_by_a_replica() {
    let addr = start_replica().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(&mut stream, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;
    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn unknown_command_is_an_error_reply() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*1\r\n$8\r\nFLUSHALL\r\n",
        b"-ERR unknown command flushall\r\n",
    )
    .await;
}

#[tokio::test]
async fn arity_error_keeps_the_connection_open() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    roundtrip(
        &mut stream,
        b"*1\r\n$3\r\nGET\r\n",
        b"-ERR 'get' command accepts 1 param\r\n",
    )
    .await;

    // same connection still serves commands
    roundtrip(&mut stream, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;
}

#[tokio::test]
async fn malformed_frame_gets_an_error_and_a_closed_connection() {
    let addr = start_master().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"%what\r\n").await.unwrap();

    let mut reply = Vec::new();
    timeout(READ_TIMEOUT, stream.read_to_end(&mut reply))
        .await
        .expect("timed out waiting for close")
        .expect("read failed");

    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("-ERR "), "got {:?}", text);
}
