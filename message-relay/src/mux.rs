//! Listener and connection multiplexer.
//!
//! Connections are owned here for their whole lifetime and serviced from a
//! single task. Reads and writes never wait: data is pulled with `try_read`
//! until the socket would block, and output is buffered per connection and
//! pushed with `try_write` whenever the socket accepts it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::protocol::{self, DecodeError};

/// Upper bound on bytes pulled from one connection per loop pass.
const READ_BUDGET: usize = 64 * 1024;
const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Open,
    Eof,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    inbound: BytesMut,
    outbound: BytesMut,
    closing: Option<Instant>,
    /// Complete frames sit in `inbound` but dispatch was paused.
    held_input: bool,
}

impl Connection {
    fn new(id: ConnId, peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            peer,
            stream,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            closing: None,
            held_input: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_some()
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Stops reading from this connection; it is dropped once its output is
    /// flushed or `deadline` passes.
    pub fn begin_close(&mut self, deadline: Instant) {
        self.closing.get_or_insert(deadline);
    }

    /// Pulls whatever the socket has buffered without waiting.
    pub fn fill_inbound(&mut self) -> io::Result<ReadStatus> {
        let mut total = 0;
        loop {
            self.inbound.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.inbound) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(read) => {
                    total += read;
                    if total >= READ_BUDGET {
                        return Ok(ReadStatus::Open);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Open);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Marks whether buffered frames were left undispatched, so the
    /// connection is serviced again without new bytes arriving.
    pub fn hold_input(&mut self, held: bool) {
        self.held_input = held;
    }

    pub fn next_frame(&mut self, limit: usize) -> Result<Option<BytesMut>, DecodeError> {
        protocol::take_frame(&mut self.inbound, limit)
    }

    pub fn queue(&mut self, frame: &[u8]) {
        self.outbound.extend_from_slice(frame);
    }

    /// Writes buffered output until it is gone or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => self.outbound.advance(written),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn activity(&self, max_outbound: usize) {
        let interest = match (self.is_closing(), self.outbound.len()) {
            (true, 0) => return,
            (true, _) => Interest::WRITABLE,
            (false, 0) => Interest::READABLE,
            // Backlogged: only draining output can make progress.
            (false, pending) if pending >= max_outbound => Interest::WRITABLE,
            (false, _) => Interest::READABLE | Interest::WRITABLE,
        };
        let _ = self.stream.ready(interest).await;
    }
}

/// Connections found ready by [`Multiplexer::readiness`].
#[derive(Debug, Default)]
pub struct Readiness {
    pub readable: Vec<ConnId>,
    pub writable: HashSet<ConnId>,
}

pub struct Multiplexer {
    listener: TcpListener,
    connections: BTreeMap<ConnId, Connection>,
    next_id: u64,
    max_outbound: usize,
}

impl Multiplexer {
    pub fn new(listener: TcpListener, max_outbound: usize) -> Self {
        Self {
            listener,
            connections: BTreeMap::new(),
            next_id: 1,
            max_outbound,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn max_outbound(&self) -> usize {
        self.max_outbound
    }

    /// Whether some connection has undispatched frames it may process now.
    pub fn has_held_input(&self) -> bool {
        self.connections
            .values()
            .any(|conn| conn.held_input && self.accepts_input(conn))
    }

    fn accepts_input(&self, conn: &Connection) -> bool {
        !conn.is_closing() && conn.outbound.len() < self.max_outbound
    }

    /// Waits at most `wait` for a new connection, returning early (without
    /// accepting) when an existing connection has work. Accept failures are
    /// logged and otherwise ignored.
    pub async fn accept_nonblocking(&mut self, wait: Duration) -> Option<ConnId> {
        let accepted = {
            let activity = wait_for_activity(&self.connections, self.max_outbound);
            tokio::select! {
                result = self.listener.accept() => Some(result),
                () = activity => None,
                () = tokio::time::sleep(wait) => None,
            }
        };

        match accepted? {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, error = %err, "failed to set TCP_NODELAY");
                }
                let id = ConnId(self.next_id);
                self.next_id += 1;
                self.connections
                    .insert(id, Connection::new(id, peer, stream));
                info!(conn = %id, %peer, "accepted connection");
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
                None
            }
        }
    }

    /// Zero-wait probe of every connection's readiness.
    ///
    /// A connection whose output buffer is full is reported neither readable
    /// nor writable; closing connections are never reported readable. A
    /// connection holding undispatched frames counts as readable.
    pub fn readiness(&self) -> Readiness {
        let mut readiness = Readiness::default();

        for (&id, conn) in &self.connections {
            let accepts_input = self.accepts_input(conn);
            let probe = tokio::task::unconstrained(
                conn.stream.ready(Interest::READABLE | Interest::WRITABLE),
            );
            match probe.now_or_never() {
                Some(Ok(ready)) => {
                    let incoming = ready.is_readable() || ready.is_read_closed();
                    if accepts_input && (incoming || conn.held_input) {
                        readiness.readable.push(id);
                    }
                    if ready.is_writable() && conn.outbound.len() < self.max_outbound {
                        readiness.writable.insert(id);
                    }
                }
                Some(Err(err)) => {
                    debug!(conn = %id, error = %err, "readiness probe failed");
                    if !conn.is_closing() {
                        readiness.readable.push(id);
                    }
                }
                None if accepts_input && conn.held_input => readiness.readable.push(id),
                None => {}
            }
        }

        readiness
    }

    /// Queues `frame` on a connection that has room for it.
    pub fn try_queue(&mut self, id: ConnId, frame: &[u8]) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_closing() && conn.outbound.len() < self.max_outbound => {
                conn.queue(frame);
                true
            }
            _ => false,
        }
    }

    /// Flushes every connection with pending output, returning those whose
    /// socket failed.
    pub fn flush_all(&mut self) -> Vec<(ConnId, io::Error)> {
        self.connections
            .values_mut()
            .filter(|conn| !conn.outbound.is_empty())
            .filter_map(|conn| conn.flush().err().map(|err| (conn.id, err)))
            .collect()
    }

    /// Drops closing connections that are flushed or past their deadline.
    pub fn reap_closing(&mut self, now: Instant) -> Vec<ConnId> {
        let finished: Vec<ConnId> = self
            .connections
            .values()
            .filter(|conn| {
                conn.closing
                    .is_some_and(|deadline| conn.outbound.is_empty() || now >= deadline)
            })
            .map(|conn| conn.id)
            .collect();

        for id in &finished {
            if let Some(conn) = self.connections.remove(id) {
                debug!(conn = %id, peer = %conn.peer, "connection closed");
            }
        }
        finished
    }

    /// Queues `frame` on every connection, flushes best-effort and drops
    /// them all.
    pub fn close_all(&mut self, frame: &[u8]) -> usize {
        let closed = self.connections.len();
        for (id, mut conn) in std::mem::take(&mut self.connections) {
            conn.queue(frame);
            if let Err(err) = conn.flush() {
                debug!(conn = %id, error = %err, "failed to flush during shutdown");
            }
        }
        closed
    }
}

async fn wait_for_activity(connections: &BTreeMap<ConnId, Connection>, max_outbound: usize) {
    let mut waiters: FuturesUnordered<_> = connections
        .values()
        .map(|conn| conn.activity(max_outbound))
        .collect();
    if waiters.is_empty() {
        return std::future::pending().await;
    }
    waiters.next().await;
}
