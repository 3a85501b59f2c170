//! Persistence collaborator: user, contact and traffic bookkeeping.
//!
//! The relay core only needs the [`Persistence`] trait and tolerates every
//! call failing. [`NoopStore`] is the minimal deployment; [`MemoryStore`]
//! keeps the full model in memory and answers operator queries.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait Persistence: Send + Sync {
    fn user_login(&self, name: &str, addr: SocketAddr) -> Result<(), StoreError>;

    fn user_logout(&self, name: &str) -> Result<(), StoreError>;

    /// Every user the store has ever seen.
    fn users_list(&self) -> Result<Vec<String>, StoreError>;

    fn get_contacts(&self, name: &str) -> Result<Vec<String>, StoreError>;

    fn add_contact(&self, name: &str, contact: &str) -> Result<(), StoreError>;

    fn remove_contact(&self, name: &str, contact: &str) -> Result<(), StoreError>;

    /// Counts one message sent by `sender` and accepted by `destination`.
    fn process_message(&self, sender: &str, destination: &str) -> Result<(), StoreError>;
}

/// Accepts everything and remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl Persistence for NoopStore {
    fn user_login(&self, _name: &str, _addr: SocketAddr) -> Result<(), StoreError> {
        Ok(())
    }

    fn user_logout(&self, _name: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn users_list(&self) -> Result<Vec<String>, StoreError> {
        Ok(vec![])
    }

    fn get_contacts(&self, _name: &str) -> Result<Vec<String>, StoreError> {
        Ok(vec![])
    }

    fn add_contact(&self, _name: &str, _contact: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn remove_contact(&self, _name: &str, _contact: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn process_message(&self, _sender: &str, _destination: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUser {
    pub name: String,
    pub addr: SocketAddr,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub name: String,
    pub addr: SocketAddr,
    pub login_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub name: String,
    pub last_login: DateTime<Utc>,
    pub sent: u64,
    pub accepted: u64,
}

#[derive(Debug)]
struct UserRow {
    last_login: DateTime<Utc>,
    contacts: Vec<String>,
    sent: u64,
    accepted: u64,
}

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<String, UserRow>,
    active: BTreeMap<String, ActiveUser>,
    history: Vec<LoginRecord>,
}

/// In-memory store shared between the server loop and operator tooling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.tables.lock().active.values().cloned().collect()
    }

    /// Login history, optionally restricted to one user, oldest first.
    pub fn login_history(&self, name: Option<&str>) -> Vec<LoginRecord> {
        self.tables
            .lock()
            .history
            .iter()
            .filter(|record| name.is_none_or(|name| record.name == name))
            .cloned()
            .collect()
    }

    pub fn message_stats(&self) -> Vec<MessageStats> {
        self.tables
            .lock()
            .users
            .iter()
            .map(|(name, row)| MessageStats {
                name: name.clone(),
                last_login: row.last_login,
                sent: row.sent,
                accepted: row.accepted,
            })
            .collect()
    }
}

impl Persistence for MemoryStore {
    fn user_login(&self, name: &str, addr: SocketAddr) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock();

        tables
            .users
            .entry(name.to_string())
            .and_modify(|row| row.last_login = now)
            .or_insert_with(|| UserRow {
                last_login: now,
                contacts: Vec::new(),
                sent: 0,
                accepted: 0,
            });
        tables.active.insert(
            name.to_string(),
            ActiveUser {
                name: name.to_string(),
                addr,
                login_time: now,
            },
        );
        tables.history.push(LoginRecord {
            name: name.to_string(),
            addr,
            login_time: now,
        });
        Ok(())
    }

    fn user_logout(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.users.contains_key(name) {
            return Err(StoreError::UnknownUser(name.to_string()));
        }
        tables.active.remove(name);
        Ok(())
    }

    fn users_list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.lock().users.keys().cloned().collect())
    }

    fn get_contacts(&self, name: &str) -> Result<Vec<String>, StoreError> {
        self.tables
            .lock()
            .users
            .get(name)
            .map(|row| row.contacts.clone())
            .ok_or_else(|| StoreError::UnknownUser(name.to_string()))
    }

    fn add_contact(&self, name: &str, contact: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.users.contains_key(contact) {
            return Ok(());
        }

        let row = tables
            .users
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownUser(name.to_string()))?;
        if !row.contacts.iter().any(|known| known == contact) {
            row.contacts.push(contact.to_string());
        }
        Ok(())
    }

    fn remove_contact(&self, name: &str, contact: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let row = tables
            .users
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownUser(name.to_string()))?;
        row.contacts.retain(|known| known != contact);
        Ok(())
    }

    fn process_message(&self, sender: &str, destination: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        for name in [sender, destination] {
            if !tables.users.contains_key(name) {
                return Err(StoreError::UnknownUser(name.to_string()));
            }
        }

        if let Some(row) = tables.users.get_mut(sender) {
            row.sent += 1;
        }
        if let Some(row) = tables.users.get_mut(destination) {
            row.accepted += 1;
        }
        Ok(())
    }
}
