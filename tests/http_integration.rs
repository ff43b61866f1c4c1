//! Integration tests for the HTTP client session
//!
//! Each test runs a small blocking server on a loopback listener in its own
//! thread and drives a `Session` against it.

use coolnet::http::{Request, ResponseState, Session};
use coolnet::logging;
use coolnet::net::AsyncConnectResult;
use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Read one request head, returning it as text. Empty once the client
/// hung up.
fn read_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Serve `responses` in order on a single connection, then hang up. The
/// request heads are sent back through the returned channel.
fn serve_one_connection(responses: Vec<&'static str>) -> (u16, mpsc::Receiver<String>) {
    let (listener, port) = listen();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for response in responses {
            let request = read_request(&mut stream);
            if request.is_empty() {
                return;
            }
            tx.send(request).unwrap();
            stream.write_all(response.as_bytes()).unwrap();
        }
    });
    (port, rx)
}

const HELLO: &str = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello";

#[test]
fn test_sync_request() {
    logging::init_for_tests();
    let (port, requests) = serve_one_connection(vec![HELLO]);

    let session = Session::create_http("127.0.0.1", port);
    let response = session.sync_request(Request::new("/greeting"));
    let response = response.borrow();

    assert_eq!(response.state(), ResponseState::Complete);
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.get("Content-Type"), Some("text/plain"));
    assert_eq!(response.body_string(), "hello");
    assert_eq!(session.connection_result(), AsyncConnectResult::Ok);

    let request = requests.recv().unwrap();
    assert!(request.starts_with("GET /greeting HTTP/1.1\r\n"));
    assert!(request.contains(&format!("Host: 127.0.0.1:{}\r\n", port)));
    assert!(request.contains("User-Agent: coolnet HTTP Agent"));
}

#[test]
fn test_keep_alive_reuses_connection() {
    logging::init_for_tests();
    let second = "HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond";
    let (port, requests) = serve_one_connection(vec![HELLO, second]);

    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));

    let first = session.sync_request(Request::new("/one"));
    assert_eq!(first.borrow().body_string(), "hello");
    assert!(session.is_connected());
    let fd = session.fd();

    // The server only ever accepts one connection.
    let second = session.sync_request(Request::new("/two"));
    assert_eq!(second.borrow().state(), ResponseState::Complete);
    assert_eq!(second.borrow().body_string(), "second");
    assert_eq!(session.fd(), fd);

    assert!(requests.recv().unwrap().starts_with("GET /one "));
    assert!(requests.recv().unwrap().starts_with("GET /two "));
}

#[test]
fn test_connection_close_reconnects() {
    logging::init_for_tests();
    let (listener, port) = listen();
    let server = thread::spawn(move || {
        for body in ["first", "again"] {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        }
    });

    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));

    let response = session.sync_request(Request::new("/"));
    assert_eq!(response.borrow().body_string(), "first");
    assert!(!session.is_connected());
    assert_eq!(session.fd(), -1);

    let response = session.sync_request(Request::new("/"));
    assert_eq!(response.borrow().body_string(), "again");
    server.join().unwrap();
}

#[test]
fn test_request_times_out() {
    logging::init_for_tests();
    let (listener, port) = listen();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream);
        // Never answer; hold the connection until the client gave up.
        let _ = done_rx.recv_timeout(Duration::from_secs(10));
    });

    let finished = Rc::new(Cell::new(0));
    let counter = finished.clone();
    let session = Session::create_http("127.0.0.1", port);
    session.set_finished_handler(move |_| counter.set(counter.get() + 1));

    let response = session.sync_request_with_timeout(Request::new("/slow"), Duration::from_millis(300));
    assert_eq!(response.borrow().state(), ResponseState::Timeout);
    assert_eq!(finished.get(), 1);
    assert!(!session.is_connected());
    assert_eq!(session.timeout(), Session::DEFAULT_TIMEOUT);
    done_tx.send(()).unwrap();
}

#[test]
fn test_refused_connection_only_reports_connect_failure() {
    logging::init_for_tests();
    let (listener, port) = listen();
    drop(listener);

    let finished = Rc::new(Cell::new(0));
    let failed = Rc::new(Cell::new(0));
    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));
    let counter = finished.clone();
    session.set_finished_handler(move |_| counter.set(counter.get() + 1));
    let counter = failed.clone();
    session.set_connect_fail_handler(move |_| counter.set(counter.get() + 1));

    let response = session.sync_request(Request::new("/"));
    assert_eq!(response.borrow().state(), ResponseState::Error);
    assert_eq!(session.connection_result(), AsyncConnectResult::ConnectionError);
    assert_eq!(failed.get(), 1);
    assert_eq!(finished.get(), 0);
    assert!(!session.is_connected());
}

#[test]
fn test_async_request_without_poll() {
    logging::init_for_tests();
    let failed = Rc::new(Cell::new(false));
    let session = Session::create_http("127.0.0.1", 9);
    let flag = failed.clone();
    session.set_connect_fail_handler(move |_| flag.set(true));
    session.set_finished_handler(|_| panic!("no request was made"));

    assert!(!session.async_request(Request::new("/"), &Weak::new()));
    assert!(failed.get());
    let response = session.response().unwrap();
    assert_eq!(response.borrow().state(), ResponseState::Error);
}

#[test]
fn test_malformed_response() {
    logging::init_for_tests();
    let (port, _requests) = serve_one_connection(vec!["SPDY/9 what\r\n\r\n"]);

    let finished = Rc::new(Cell::new(0));
    let counter = finished.clone();
    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));
    session.set_finished_handler(move |_| counter.set(counter.get() + 1));

    let response = session.sync_request(Request::new("/"));
    assert_eq!(response.borrow().state(), ResponseState::Error);
    assert_eq!(finished.get(), 1);
    assert!(!session.is_connected());
}

#[test]
fn test_chunked_response() {
    logging::init_for_tests();
    let (port, _requests) = serve_one_connection(vec![
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    ]);

    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));
    let response = session.sync_request(Request::new("/wiki"));
    let response = response.borrow();
    assert_eq!(response.state(), ResponseState::Complete);
    assert_eq!(response.body_string(), "Wikipedia");
    assert_eq!(response.received_body_size(), 9);
}

#[test]
fn test_body_until_close() {
    logging::init_for_tests();
    let (listener, port) = listen();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nstreamed until the end")
            .unwrap();
    });

    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));
    let response = session.sync_request(Request::new("/"));
    assert_eq!(response.borrow().state(), ResponseState::Complete);
    assert_eq!(response.borrow().body_string(), "streamed until the end");
}

#[test]
fn test_sync_download() {
    logging::init_for_tests();
    let (port, _requests) = serve_one_connection(vec![HELLO]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");

    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));
    let response = session.sync_download(Request::new("/hello.txt"), &path);

    assert_eq!(response.borrow().state(), ResponseState::Complete);
    assert!(response.borrow().body().is_empty());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
}

#[test]
fn test_failed_download_keeps_body_in_memory() {
    logging::init_for_tests();
    let (port, _requests) =
        serve_one_connection(vec!["HTTP/1.1 404 Not Found\r\nContent-Length: 7\r\n\r\nmissing"]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.txt");

    let session = Session::create_http("127.0.0.1", port);
    session.set_timeout(Duration::from_secs(5));
    let response = session.sync_download(Request::new("/missing.txt"), &path);

    let response = response.borrow();
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.body_string(), "missing");
    assert_eq!(std::fs::read(&path).unwrap_or_default().len(), 0);
}

#[test]
fn test_get_helper() {
    logging::init_for_tests();
    let (port, requests) = serve_one_connection(vec![HELLO]);

    let url = format!("http://127.0.0.1:{}/search?q=rust", port);
    let response = coolnet::http::get(&url, Duration::from_secs(5)).unwrap();
    assert_eq!(response.borrow().body_string(), "hello");
    assert!(requests.recv().unwrap().starts_with("GET /search?q=rust HTTP/1.1\r\n"));
}
