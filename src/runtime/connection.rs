//! Connection state machine for managing HTTP connections.
//!
//! Each connection tracks whether it is reading a request or writing a
//! response, plus its read and write buffers.

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;

/// Initial capacity of per-connection buffers.
const INITIAL_BUFFER: usize = 4 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating request bytes. Interim responses (`100 Continue`) may
    /// still be queued for writing.
    Reading,
    /// Writing a complete response.
    Writing {
        /// Close once the response is flushed.
        close_after: bool,
    },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub state: ConnState,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    /// `100 Continue` already sent for the request being read.
    pub continue_sent: bool,
    /// Peer shut down its write side.
    pub read_closed: bool,
    /// Interest currently registered with the poller.
    pub registered: Interest,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            continue_sent: false,
            read_closed: false,
            registered: Interest::READABLE,
        }
    }

    /// Transition to writing the response queued in `write_buf`.
    pub fn start_writing(&mut self, close_after: bool) {
        self.continue_sent = false;
        self.state = ConnState::Writing { close_after };
    }

    /// Transition back to reading the next request.
    pub fn start_reading(&mut self) {
        self.state = ConnState::Reading;
    }

    /// Readiness this connection needs in its current state.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnState::Reading if self.write_buf.is_empty() => Interest::READABLE,
            ConnState::Reading => Interest::READABLE | Interest::WRITABLE,
            ConnState::Writing { .. } => Interest::WRITABLE,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
