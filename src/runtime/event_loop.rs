//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls until they would block.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Every worker owns its own poller and its own `SO_REUSEPORT` listener on
//! the shared address, so the kernel spreads incoming connections across
//! workers with no coordination between them.

use crate::config::Config;
use crate::echo::EchoResponder;
use crate::http::response::{self, Status};
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry};
use crate::runtime::request::{process_http, ProcessResult, RequestContext};
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 16 * 1024;

/// Slack on top of head and body limits for chunk-size lines and trailers.
const FRAMING_SLACK: usize = 64 * 1024;

/// Outcome of draining a readable socket.
enum ReadOutcome {
    /// New bytes were appended.
    Data,
    /// Peer closed its write side.
    Eof,
    /// Nothing more to read right now.
    WouldBlock,
}

/// A single-threaded echo worker.
pub struct Worker {
    worker_id: usize,
    poll: Poll,
    listener: TcpListener,
    connections: ConnectionRegistry,
    ctx: RequestContext,
    batch_size: usize,
    /// Read buffer size past which a pending request is rejected.
    read_limit: usize,
}

impl Worker {
    /// Bind this worker's listener and poller.
    pub fn bind(worker_id: usize, config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        // Create listener with SO_REUSEPORT for kernel load balancing
        let listener = create_listener_with_reuseport(config.addr)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        // An ephemeral port is only known once bound.
        let port = match config.port {
            0 => listener.local_addr()?.port(),
            port => port,
        };

        let ctx = RequestContext {
            worker_id,
            pid: std::process::id(),
            responder: EchoResponder::new(&config.host, port, config.html),
            max_header_size: config.max_header_size,
            max_body_size: config.max_body_size,
        };

        Ok(Self {
            worker_id,
            poll,
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            ctx,
            batch_size: config.batch_size,
            read_limit: config
                .max_header_size
                .saturating_add(config.max_body_size)
                .saturating_add(FRAMING_SLACK),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections until a poll error.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.batch_size);

        info!(
            worker = self.worker_id,
            pid = self.ctx.pid,
            addr = %self.local_addr()?,
            "Worker started"
        );

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => {
                        if let Err(e) = self.drive(conn_id) {
                            debug!(worker = self.worker_id, conn_id, error = %e, "Connection closed");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }

                    let conn_id = match self.connections.insert(Connection::new(stream)) {
                        Some(id) => id,
                        None => {
                            warn!(worker = self.worker_id, "Connection limit reached");
                            continue;
                        }
                    };

                    let registered = match self.connections.get_mut(conn_id) {
                        Some(conn) => self.poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(worker = self.worker_id, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(
                        worker = self.worker_id,
                        conn_id,
                        peer = %peer_addr,
                        active = self.connections.len(),
                        "Accepted connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.worker_id, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Process buffered input and flush output until the socket would block.
    ///
    /// Returns an error when the connection should be closed.
    fn drive(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            // Stale event for an already closed connection.
            None => return Ok(()),
        };

        loop {
            match conn.state {
                ConnState::Reading => {
                    match process_http(&conn.read_buf, &mut conn.write_buf, &self.ctx) {
                        ProcessResult::NeedData { expect_continue } => {
                            if expect_continue && !conn.continue_sent {
                                response::write_continue(&mut conn.write_buf);
                                conn.continue_sent = true;
                            }
                            if conn.read_buf.len() >= self.read_limit {
                                conn.read_buf.clear();
                                response::write_error(&mut conn.write_buf, Status::PayloadTooLarge);
                                conn.start_writing(true);
                                continue;
                            }
                            if conn.read_closed {
                                return Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "peer closed mid-request",
                                ));
                            }
                            if !flush(&mut conn.stream, &mut conn.write_buf)? {
                                break;
                            }
                            match read_available(&mut conn.stream, &mut conn.read_buf, self.read_limit)? {
                                ReadOutcome::Data => {}
                                ReadOutcome::Eof => conn.read_closed = true,
                                ReadOutcome::WouldBlock => break,
                            }
                        }
                        ProcessResult::Response {
                            consumed,
                            keep_alive,
                        } => {
                            conn.read_buf.advance(consumed);
                            conn.start_writing(!keep_alive);
                        }
                        ProcessResult::Abort => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "request aborted",
                            ));
                        }
                        ProcessResult::Error(status) => {
                            conn.read_buf.clear();
                            response::write_error(&mut conn.write_buf, status);
                            conn.start_writing(true);
                        }
                    }
                }
                ConnState::Writing { close_after } => {
                    if !flush(&mut conn.stream, &mut conn.write_buf)? {
                        break;
                    }
                    if close_after {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "response complete",
                        ));
                    }
                    conn.start_reading();
                }
            }
        }

        let interest = conn.interest();
        if interest != conn.registered {
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(conn_id), interest)?;
            conn.registered = interest;
        }

        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(worker = self.worker_id, conn_id, "Connection removed");
        }
    }
}

/// Read until the socket would block, the peer closes, or `limit` is reached.
fn read_available(stream: &mut TcpStream, buf: &mut BytesMut, limit: usize) -> io::Result<ReadOutcome> {
    let mut outcome = ReadOutcome::WouldBlock;

    while buf.len() < limit {
        let start = buf.len();
        buf.resize(start + READ_CHUNK, 0);

        match stream.read(&mut buf[start..]) {
            Ok(0) => {
                buf.truncate(start);
                return Ok(ReadOutcome::Eof);
            }
            Ok(n) => {
                buf.truncate(start + n);
                outcome = ReadOutcome::Data;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                buf.truncate(start);
                return Ok(outcome);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                buf.truncate(start);
            }
            Err(e) => {
                buf.truncate(start);
                return Err(e);
            }
        }
    }

    Ok(outcome)
}

/// Write queued bytes. Returns `true` once the buffer is empty.
fn flush(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<bool> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerMode;
    use serde_json::{json, Value};
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            addr: "127.0.0.1:0".parse().unwrap(),
            workers: 1,
            mode: WorkerMode::Thread,
            max_connections: 64,
            batch_size: 64,
            max_header_size: 16 * 1024,
            max_body_size: 1024 * 1024,
            html: true,
            log_level: "info".to_string(),
            worker_id: None,
        }
    }

    /// Start a worker on an ephemeral port and return its address.
    fn spawn_worker() -> SocketAddr {
        let worker = Worker::bind(0, &test_config()).unwrap();
        let addr = worker.local_addr().unwrap();
        std::thread::spawn(move || worker.run());
        addr
    }

    fn connect(addr: SocketAddr) -> BufReader<StdTcpStream> {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        BufReader::new(stream)
    }

    struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Reply {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        fn json(&self) -> Value {
            serde_json::from_slice(&self.body).unwrap()
        }
    }

    /// Read one response framed by Content-Length; `None` on a closed connection.
    fn read_reply(reader: &mut BufReader<StdTcpStream>) -> Option<Reply> {
        let mut reply = read_reply_head(reader)?;
        let length: usize = reply.header("content-length").map_or(0, |v| v.parse().unwrap());
        reply.body = vec![0; length];
        reader.read_exact(&mut reply.body).ok()?;
        Some(reply)
    }

    /// Read a status line and headers, leaving any body unread.
    fn read_reply_head(reader: &mut BufReader<StdTcpStream>) -> Option<Reply> {
        let mut status_line = String::new();
        if reader.read_line(&mut status_line).ok()? == 0 {
            return None;
        }
        let status = status_line.split(' ').nth(1)?.parse().ok()?;

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).ok()?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':')?;
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Some(Reply {
            status,
            headers,
            body: Vec::new(),
        })
    }

    fn exchange(addr: SocketAddr, request: &[u8]) -> Option<Reply> {
        let mut reader = connect(addr);
        reader.get_mut().write_all(request).unwrap();
        read_reply(&mut reader)
    }

    fn assert_closed(reader: &mut BufReader<StdTcpStream>) {
        let mut rest = Vec::new();
        match reader.read_to_end(&mut rest) {
            Ok(_) => assert!(rest.is_empty(), "unexpected bytes: {:?}", String::from_utf8_lossy(&rest)),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    fn test_get_echo() {
        let addr = spawn_worker();
        let reply = exchange(addr, b"GET /foo?x=1 HTTP/1.1\r\nAccept: */*\r\n\r\n").unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("content-type"), Some("application/json"));
        assert_eq!(
            String::from_utf8(reply.body).unwrap(),
            format!(
                r#"{{"method":"GET","url":"http://127.0.0.1:{}/foo?x=1","query_params":{{"x":"1"}},"headers":{{"accept":"*/*"}},"code":200,"version":"1.1"}}"#,
                addr.port()
            )
        );
    }

    #[test]
    fn test_post_json_echo() {
        let addr = spawn_worker();
        let reply = exchange(
            addr,
            b"POST /echo HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 7\r\n\r\n{\"a\":1}",
        )
        .unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["body"], json!({"a": 1}));
    }

    #[test]
    fn test_chunked_raw_body() {
        let addr = spawn_worker();
        let reply = exchange(
            addr,
            b"PATCH /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        )
        .unwrap();

        assert_eq!(reply.json()["body"], "abcde");
        assert_eq!(reply.json()["method"], "PATCH");
    }

    #[test]
    fn test_body_split_across_writes() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader
            .get_mut()
            .write_all(b"PUT /slow HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello")
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        reader.get_mut().write_all(b" world").unwrap();

        let reply = read_reply(&mut reader).unwrap();
        assert_eq!(reply.json()["body"], "hello world");
    }

    #[test]
    fn test_html_format() {
        let addr = spawn_worker();
        let reply = exchange(addr, b"GET /page?format=html HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("content-type"), Some("text/html"));
        let html = String::from_utf8(reply.body).unwrap();
        assert!(html.contains(&format!("GET: http://127.0.0.1:{}/page?format=html", addr.port())));
    }

    #[test]
    fn test_keep_alive_and_pipelining() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader
            .get_mut()
            .write_all(b"GET /one HTTP/1.1\r\n\r\nDELETE /two HTTP/1.1\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();

        let first = read_reply(&mut reader).unwrap();
        let second = read_reply(&mut reader).unwrap();
        assert!(first.json()["url"].as_str().unwrap().ends_with("/one"));
        assert!(second.json()["url"].as_str().unwrap().ends_with("/two"));
        assert_eq!(second.json()["body"], "ok");
        assert_eq!(second.header("connection"), Some("keep-alive"));

        // Still open for a third request.
        reader.get_mut().write_all(b"GET /three HTTP/1.1\r\n\r\n").unwrap();
        let third = read_reply(&mut reader).unwrap();
        assert!(third.json()["url"].as_str().unwrap().ends_with("/three"));
    }

    #[test]
    fn test_head_then_get_stays_in_sync() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader
            .get_mut()
            .write_all(b"HEAD /health HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n")
            .unwrap();

        let head = read_reply_head(&mut reader).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.header("content-type"), Some("application/json"));
        let announced: usize = head.header("content-length").unwrap().parse().unwrap();
        assert!(announced > 0);

        // The next bytes on the wire are the GET's status line.
        let next = read_reply(&mut reader).unwrap();
        assert_eq!(next.status, 200);
        assert_eq!(next.json()["method"], "GET");
        assert!(next.json()["url"].as_str().unwrap().ends_with("/next"));
    }

    #[test]
    fn test_options_echo_has_no_body() {
        let addr = spawn_worker();
        let reply = exchange(
            addr,
            b"OPTIONS /any HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nskip",
        )
        .unwrap();

        assert_eq!(reply.status, 200);
        let value = reply.json();
        assert_eq!(value["method"], "OPTIONS");
        assert!(value.get("body").is_none());
    }

    #[test]
    fn test_connection_close() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader
            .get_mut()
            .write_all(b"GET / HTTP/1.0\r\n\r\n")
            .unwrap();

        let reply = read_reply(&mut reader).unwrap();
        assert_eq!(reply.header("connection"), Some("close"));
        assert_eq!(reply.json()["version"], "1.0");
        assert_closed(&mut reader);
    }

    #[test]
    fn test_expect_continue() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader
            .get_mut()
            .write_all(b"POST /up HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n")
            .unwrap();

        let interim = read_reply(&mut reader).unwrap();
        assert_eq!(interim.status, 100);

        reader.get_mut().write_all(b"data").unwrap();
        let reply = read_reply(&mut reader).unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.json()["body"], "data");
    }

    #[test]
    fn test_malformed_json_drops_only_that_request() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader
            .get_mut()
            .write_all(b"POST / HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\n{oops")
            .unwrap();
        assert_closed(&mut reader);

        // The worker keeps serving.
        let reply = exchange(addr, b"GET /after HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(reply.status, 200);
    }

    #[test]
    fn test_bad_request() {
        let addr = spawn_worker();
        let mut reader = connect(addr);
        reader.get_mut().write_all(b"garbage\r\n\r\n").unwrap();

        let reply = read_reply(&mut reader).unwrap();
        assert_eq!(reply.status, 400);
        assert_closed(&mut reader);
    }

    #[test]
    fn test_workers_share_port() {
        let first = Worker::bind(0, &test_config()).unwrap();
        let addr = first.local_addr().unwrap();

        let mut config = test_config();
        config.addr = addr;
        config.port = addr.port();
        let second = Worker::bind(1, &config).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);

        std::thread::spawn(move || first.run());
        std::thread::spawn(move || second.run());

        for _ in 0..8 {
            let reply = exchange(addr, b"GET /shared HTTP/1.1\r\n\r\n").unwrap();
            assert_eq!(reply.status, 200);
        }
    }
}
