//! Exclusive mapping from usernames to live connections.
//!
//! Both directions are indexed so that a username is bound to at most one
//! connection and a connection holds at most one username. The registry is
//! owned by the dispatcher and only mutated from the server loop.

use std::collections::HashMap;

use thiserror::Error;

use crate::mux::ConnId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("name already reserved")]
    NameConflict,
    #[error("connection is already registered as '{0}'")]
    AlreadyRegistered(String),
}

#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `username` to `conn`. Registering the same pair twice succeeds.
    pub fn register(&mut self, username: &str, conn: ConnId) -> Result<(), RegistryError> {
        match self.by_name.get(username) {
            Some(&owner) if owner == conn => return Ok(()),
            Some(_) => return Err(RegistryError::NameConflict),
            None => {}
        }

        if let Some(bound) = self.by_conn.get(&conn) {
            return Err(RegistryError::AlreadyRegistered(bound.clone()));
        }

        self.by_name.insert(username.to_string(), conn);
        self.by_conn.insert(conn, username.to_string());
        Ok(())
    }

    pub fn unregister(&mut self, username: &str) -> Option<ConnId> {
        let conn = self.by_name.remove(username)?;
        self.by_conn.remove(&conn);
        Some(conn)
    }

    pub fn unregister_connection(&mut self, conn: ConnId) -> Option<String> {
        let username = self.by_conn.remove(&conn)?;
        self.by_name.remove(&username);
        Some(username)
    }

    pub fn lookup(&self, username: &str) -> Option<ConnId> {
        self.by_name.get(username).copied()
    }

    pub fn username_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Removes every binding, returning them sorted by username.
    pub fn drain(&mut self) -> Vec<(String, ConnId)> {
        self.by_conn.clear();
        let mut entries: Vec<_> = self.by_name.drain().collect();
        entries.sort();
        entries
    }
}
