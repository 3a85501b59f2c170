//! Username-addressed message relay over persistent TCP connections.
//!
//! Clients register a unique username with a `presence` request and then
//! exchange messages addressed by username through the server. The JSON line
//! protocol is described in [`protocol`]. Each module owns one concern:
//!
//! - [`mux`] accepts connections and probes which ones are readable or
//!   writable, without ever blocking on a single peer.
//! - [`registry`] binds usernames to live connections, one to one.
//! - [`dispatcher`] runs the per-connection protocol state machine.
//! - [`relay`] queues messages until their destination can take them.
//! - [`server`] drives all of the above from a single task.
//! - [`store`] is the persistence collaborator for users, contacts and
//!   traffic counters.
//! - [`config`] and [`cli`] cover process configuration; [`client`] is a
//!   terminal client; [`dashboard`] logs registry changes for operators.
//!
//! Integration tests drive a real [`server::Server`] over loopback TCP.

pub mod cli;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod dispatcher;
pub mod mux;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod store;
