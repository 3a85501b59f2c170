//! The relay server loop.
//!
//! One task drives every connection: each pass accepts (with a bounded wait),
//! probes readiness, dispatches whatever arrived on readable connections,
//! forwards queued messages to writable ones, then flushes output and reaps
//! closed connections.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::dispatcher::{Dispatcher, Outcome, ServerEvent, Session};
use crate::mux::{ConnId, Multiplexer, ReadStatus};
use crate::protocol::{self, Response, SHUTTING_DOWN};
use crate::store::Persistence;

const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub struct Server {
    mux: Multiplexer,
    dispatcher: Dispatcher,
    events: broadcast::Sender<ServerEvent>,
    accept_timeout: Duration,
    linger: Duration,
    max_frame_bytes: usize,
}

impl Server {
    /// Validates `config` and binds the listener. Nothing is served until
    /// [`Server::run_until`] is called.
    pub async fn bind(config: &Config, store: Arc<dyn Persistence>) -> Result<Self, ServerError> {
        config.validate()?;

        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            mux: Multiplexer::new(listener, config.max_outbound_bytes),
            dispatcher: Dispatcher::new(store, config.retry_policy(), events.clone()),
            events,
            accept_timeout: config.accept_timeout(),
            linger: config.linger(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.mux.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.step() => {}
            }
        }

        self.drain();
    }

    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    /// One loop pass. The only await is the bounded accept, so cancelling a
    /// pass never leaves a request half-dispatched.
    async fn step(&mut self) {
        let wait = self.next_wait(Instant::now());
        self.mux.accept_nonblocking(wait).await;

        let readiness = self.mux.readiness();
        for &id in &readiness.readable {
            self.service_readable(id);
        }
        self.forward_relays(&readiness.writable);
        self.flush_and_reap();
    }

    /// The accept wait, shortened so a deferred relay is retried on time and
    /// skipped while paused frames can be dispatched.
    fn next_wait(&self, now: Instant) -> Duration {
        if self.mux.has_held_input() {
            return Duration::ZERO;
        }
        match self.dispatcher.relay().next_due() {
            Some(due) => self
                .accept_timeout
                .min(due.saturating_duration_since(now)),
            None => self.accept_timeout,
        }
    }

    fn service_readable(&mut self, id: ConnId) {
        let Some(conn) = self.mux.get_mut(id) else {
            return;
        };
        let status = match conn.fill_inbound() {
            Ok(status) => status,
            Err(err) => return self.drop_connection(id, &err),
        };

        self.process_frames(id);

        let open = self.mux.get(id).is_some_and(|conn| !conn.is_closing());
        if status == ReadStatus::Eof && open {
            self.drop_connection(id, &"peer closed the connection");
        }
    }

    /// Dispatches buffered frames until none is complete, the connection
    /// closes, or its output backlog reaches the limit.
    fn process_frames(&mut self, id: ConnId) {
        let max_outbound = self.mux.max_outbound();
        loop {
            let Some(conn) = self.mux.get_mut(id) else {
                return;
            };
            if conn.is_closing() {
                return;
            }
            if conn.pending_output() >= max_outbound {
                conn.hold_input(true);
                return;
            }
            conn.hold_input(false);

            let session = Session {
                id,
                peer: conn.peer(),
            };
            let frame = match conn.next_frame(self.max_frame_bytes) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => return self.drop_connection(id, &err),
            };

            let outcome = self.dispatcher.handle_frame(&session, &frame);
            self.apply(id, outcome);
        }
    }

    fn apply(&mut self, id: ConnId, outcome: Outcome) {
        match outcome {
            Outcome::Silent => {}
            Outcome::Reply(response) => self.reply(id, &response),
            Outcome::Close(response) => {
                if let Some(response) = response {
                    self.reply(id, &response);
                }
                let deadline = Instant::now() + self.linger;
                if let Some(conn) = self.mux.get_mut(id) {
                    conn.begin_close(deadline);
                }
            }
            Outcome::Drop => self.drop_connection(id, &"undecodable frame"),
        }
    }

    fn reply(&mut self, id: ConnId, response: &Response) {
        let frame = match protocol::encode_frame(response) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn = %id, error = %err, "failed to encode response");
                return;
            }
        };

        let Some(conn) = self.mux.get_mut(id) else {
            return;
        };
        conn.queue(&frame);
        if let Err(err) = conn.flush() {
            self.drop_connection(id, &err);
        }
    }

    fn forward_relays(&mut self, writable: &HashSet<ConnId>) {
        if self.dispatcher.relay().is_empty() {
            return;
        }

        let mux = &mut self.mux;
        let report = self
            .dispatcher
            .drain_relay(Instant::now(), |conn, request| {
                if !writable.contains(&conn) {
                    return false;
                }
                match protocol::encode_frame(request) {
                    Ok(frame) => mux.try_queue(conn, &frame),
                    Err(err) => {
                        warn!(conn = %conn, error = %err, "failed to encode relayed message");
                        false
                    }
                }
            });
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            deferred = report.deferred,
            "relay pass"
        );
    }

    fn flush_and_reap(&mut self) {
        for (id, err) in self.mux.flush_all() {
            self.drop_connection(id, &err);
        }
        for id in self.mux.reap_closing(Instant::now()) {
            self.dispatcher.disconnect(id);
        }
    }

    /// Removes a connection after a transport failure. No response is sent.
    fn drop_connection(&mut self, id: ConnId, reason: &dyn fmt::Display) {
        if let Some(conn) = self.mux.remove(id) {
            info!(
                conn = %id,
                peer = %conn.peer(),
                unsent = conn.pending_output(),
                %reason,
                "connection dropped"
            );
        }
        self.dispatcher.disconnect(id);
    }

    fn drain(&mut self) {
        let sessions = self.dispatcher.shutdown();
        let closed = match protocol::encode_frame(&Response::error(SHUTTING_DOWN)) {
            Ok(frame) => self.mux.close_all(&frame),
            Err(err) => {
                warn!(error = %err, "failed to encode shutdown notice");
                self.mux.close_all(&[])
            }
        };
        info!(sessions, connections = closed, "relay shut down");
    }
}
