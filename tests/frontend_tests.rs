#![deny(warnings, rust_2018_idioms)]

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use scgi_tunnel::exchange::HttpExchange;
use scgi_tunnel::frontend;

/// Reads one HTTP request from `conn` and returns its body, mirroring the minimal gateway the
/// frontend POSTs to.
async fn read_http_request(conn: &mut TcpStream) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        conn.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:").or_else(|| {
            line.strip_prefix("Content-Length:")
        }))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        conn.read_exact(&mut body).await.unwrap();
    }
    body
}

async fn write_http_response(conn: &mut TcpStream, status: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    );
    conn.write_all(head.as_bytes()).await.unwrap();
    conn.write_all(body).await.unwrap();
}

async fn start_frontend(hop_addr: SocketAddr) -> (SocketAddr, tokio::task::JoinHandle<Result<(), std::io::Error>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let exchange = HttpExchange::new(format!("http://{}/", hop_addr)).unwrap();
    let handle = tokio::spawn(frontend::run(listener, exchange));
    (addr, handle)
}

#[tokio::test]
async fn frontend_forwards_and_polls() {
    let hop_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hop_addr = hop_listener.local_addr().unwrap();

    // Two exchanges: the first carries the client's bytes, the second is an empty poll tick that
    // still pulls bytes back.
    let hop = tokio::spawn(async move {
        let mut seen = Vec::new();
        for reply in [&b"world"[..], &b"again"[..]] {
            let (mut conn, _) = hop_listener.accept().await.unwrap();
            seen.push(read_http_request(&mut conn).await);
            write_http_response(&mut conn, "200 OK", reply).await;
        }
        seen
    });

    let (front_addr, relay) = start_frontend(hop_addr).await;

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"world", &buf);

    // No client traffic: the next tick POSTs an empty body and the reply still comes through.
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(b"again", &buf);

    let seen = hop.await.unwrap();
    assert_eq!(b"hello", &seen[0][..]);
    assert!(seen[1].is_empty());

    // Client hangup ends the session cleanly.
    drop(client);
    relay.await.unwrap().unwrap();
}

#[tokio::test]
async fn non_200_exchange_ends_session_cleanly() {
    let hop_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hop_addr = hop_listener.local_addr().unwrap();

    let hop = tokio::spawn(async move {
        let (mut conn, _) = hop_listener.accept().await.unwrap();
        read_http_request(&mut conn).await;
        write_http_response(&mut conn, "502 Bad Gateway", b"").await;
    });

    let (front_addr, relay) = start_frontend(hop_addr).await;

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    // A broken hop ends the one session, but that is a normal way for it to end.
    relay.await.unwrap().unwrap();
    hop.await.unwrap();

    // The frontend is gone; the client sees EOF.
    let mut buf = [0u8; 1];
    assert_eq!(0, client.read(&mut buf).await.unwrap());
}

#[tokio::test]
async fn client_eof_ends_session_cleanly() {
    let hop_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hop_addr = hop_listener.local_addr().unwrap();

    // Quiet hop: answer however many empty polls happen before the hangup is noticed.
    let hop = tokio::spawn(async move {
        loop {
            let (mut conn, _) = hop_listener.accept().await.unwrap();
            read_http_request(&mut conn).await;
            write_http_response(&mut conn, "200 OK", b"").await;
        }
    });

    let (front_addr, relay) = start_frontend(hop_addr).await;

    let client = TcpStream::connect(front_addr).await.unwrap();
    drop(client);

    relay.await.unwrap().unwrap();
    hop.abort();
}

#[test]
fn backoff_doubles_while_idle_and_resets_on_activity() {
    // Idle ticks are monotone non-decreasing and capped.
    let mut delay = frontend::DELAY_INITIAL;
    let mut last = delay;
    for _ in 0..10 {
        delay = frontend::next_delay(delay, 0, 0);
        assert!(delay >= last);
        assert!(delay <= frontend::DELAY_MAX);
        last = delay;
    }
    assert_eq!(frontend::DELAY_MAX, delay);

    // Any movement in either direction restores the floor.
    assert_eq!(frontend::DELAY_INITIAL, frontend::next_delay(delay, 5, 0));
    assert_eq!(frontend::DELAY_INITIAL, frontend::next_delay(delay, 0, 5));
    assert_eq!(
        frontend::DELAY_INITIAL,
        frontend::next_delay(frontend::DELAY_MAX, 17, 4)
    );
}
