use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use http::header::{CONTENT_LENGTH, UPGRADE};
use http::{HeaderValue, StatusCode};
use indoc::indoc;
use micro_exchange::exchange::Exchange;
use micro_exchange::handler::{ExchangeHandler, make_handler};
use micro_exchange::server::{Listener, Server};
use tokio::runtime::Handle;

fn start(handler: impl ExchangeHandler) -> (Server, SocketAddr) {
    let mut server = Server::builder()
        .listener(Listener::http("127.0.0.1:0"))
        .io_threads(1)
        .worker_threads(2)
        .shutdown_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let bound = server.start(Arc::new(handler)).unwrap();
    (server, bound[0].local_addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream
}

fn echo(mut exchange: Exchange) {
    exchange.start_blocking().unwrap();
    let mut body = Vec::new();
    if let Some(request_body) = exchange.take_request_body() {
        request_body.into_blocking().unwrap().read_to_end(&mut body).unwrap();
    }

    let mut output = exchange.output_stream().unwrap();
    output.write_all(&body).unwrap();
    output.close().unwrap();
    Handle::current().block_on(exchange.end_exchange());
}

#[test]
fn echoes_body_through_blocking_streams() {
    let (mut server, addr) = start(make_handler(|exchange: Exchange| exchange.dispatch(echo)));

    let mut stream = connect(addr);
    stream
        .write_all(indoc! {"
            POST /echo HTTP/1.1\r
            Host: localhost\r
            Content-Length: 11\r
            Connection: close\r
            \r
            hello world"}
        .as_bytes())
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("transfer-encoding: chunked\r\n"));
    assert!(response.ends_with("B\r\nhello world\r\n0\r\n\r\n"));
    server.stop();
}

#[test]
fn keeps_connection_alive_between_exchanges() {
    let (mut server, addr) = start(make_handler(|exchange: Exchange| {
        exchange.dispatch(|exchange| {
            exchange.set_status(StatusCode::NO_CONTENT);
            Handle::current().block_on(exchange.end_exchange());
        })
    }));

    let mut stream = connect(addr);
    for _ in 0..2 {
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
    server.stop();
}

#[test]
fn handler_runs_on_io_thread_and_refuses_blocking() {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let (mut server, addr) = start(make_handler(move |mut exchange: Exchange| {
        let on_io = exchange.is_in_io_thread();
        let refused = exchange.start_blocking().is_err();
        tx.lock().unwrap().send((on_io, refused)).unwrap();
        exchange.dispatch(|exchange| Handle::current().block_on(exchange.end_exchange()));
    }));

    let mut stream = connect(addr);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), (true, true));
    assert!(response.contains("content-length: 0\r\n"));
    server.stop();
}

#[test]
fn fixed_length_response_when_content_length_is_set() {
    let (mut server, addr) = start(make_handler(|exchange: Exchange| {
        exchange.dispatch(|mut exchange| {
            exchange.insert_response_header(CONTENT_LENGTH, HeaderValue::from_static("5"));
            exchange.start_blocking().unwrap();
            let mut output = exchange.output_stream().unwrap();
            output.write_all(b"12345").unwrap();
            output.close().unwrap();
            // too late, the head is already on its way
            assert!(!exchange.insert_response_header(UPGRADE, HeaderValue::from_static("late")));
            Handle::current().block_on(exchange.end_exchange());
        })
    }));

    let mut stream = connect(addr);
    stream.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.contains("content-length: 5\r\n"));
    assert!(!response.contains("upgrade"));
    assert!(response.ends_with("\r\n\r\n12345"));
    server.stop();
}

#[test]
fn upgrade_hands_over_raw_socket() {
    let (mut server, addr) = start(make_handler(|exchange: Exchange| {
        exchange.dispatch(|exchange| {
            exchange.set_status(StatusCode::SWITCHING_PROTOCOLS);
            exchange.insert_response_header(UPGRADE, HeaderValue::from_static("test-protocol"));
            let raw = Handle::current().block_on(exchange.upgrade()).unwrap();
            let (mut reader, mut writer) = raw.into_blocking().unwrap();

            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).unwrap();
            writer.write_all(&buf).unwrap();
            writer.flush().unwrap();
            writer.shutdown().unwrap();
        })
    }));

    let mut stream = connect(addr);
    stream.write_all(b"GET /chat HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: test-protocol\r\n\r\nping").unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("upgrade: test-protocol\r\n"));
    assert!(response.ends_with("\r\n\r\nping"));
    server.stop();
}

#[test]
fn dropped_exchange_closes_connection() {
    let (mut server, addr) = start(make_handler(drop));

    let mut stream = connect(addr);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    server.stop();
}

#[test]
fn stop_twice_and_start_after_stop() {
    let (mut server, _addr) = start(make_handler(drop));
    server.stop();
    server.stop();
    assert!(server.start(Arc::new(make_handler(drop))).is_err());
}
