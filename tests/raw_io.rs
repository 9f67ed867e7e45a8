//! Raw channel I/O driven end-to-end, HTTP style.

mod common;

use common::init_logging;
use std::net::SocketAddr;
use std::time::Duration;
use wirecall::{Address, Channel, Context, Endpoint, Resolver};

fn http_exchange(target: &Address, host: &str) -> wirecall::Result<Vec<u8>> {
    let ctx = Context::child_of_current()?;
    ctx.set_timeout(Duration::from_secs(10));
    let _scope = ctx.enter();

    let channel = Channel::stream_for(target)?;
    channel.connect(target)?;

    let request = format!("GET / HTTP/1.0\r\nHost: {host}\r\n\r\n");
    let mut remaining = request.as_bytes();
    while !remaining.is_empty() {
        let written = channel.write(remaining)?;
        remaining = &remaining[written..];
    }

    let mut buf = [0u8; 4096];
    let read = channel.read(&mut buf)?;
    Ok(buf[..read].to_vec())
}

#[test]
fn http_style_exchange_over_loopback() {
    init_logging();
    let any: Address = "127.0.0.1:0".parse::<SocketAddr>().unwrap().into();
    let listener = Channel::stream_for(&any).unwrap();
    listener.bind(&any).unwrap();
    listener.listen(4).unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (conn, _) = listener.accept().unwrap();
        conn.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1024];
        let mut request = Vec::new();
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = conn.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let body = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut remaining: &[u8] = body;
        while !remaining.is_empty() {
            let written = conn.write(remaining).unwrap();
            remaining = &remaining[written..];
        }
        request
    });

    let chunk = http_exchange(&addr, "localhost").unwrap();
    assert!(!chunk.is_empty());
    assert!(chunk.starts_with(b"HTTP/1.0 200 OK"));

    let request = server.join().unwrap();
    assert!(request.starts_with(b"GET / HTTP/1.0\r\n"));
}

#[test]
#[ignore = "requires outbound network access"]
fn http_get_against_a_public_host() {
    init_logging();
    let addresses = Resolver::global()
        .resolve(Endpoint::new("www.example.com", "80"))
        .unwrap();
    let chunk = http_exchange(&addresses[0], "www.example.com").unwrap();
    assert!(!chunk.is_empty());
}
