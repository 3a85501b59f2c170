//! Operator view of who is online.
//!
//! Follows the server's event stream and logs the active-user table after
//! every registry change.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::dispatcher::ServerEvent;
use crate::store::{ActiveUser, MemoryStore};

/// Runs until the server drops its event sender. Returns the number of
/// events seen.
pub async fn run(store: Arc<MemoryStore>, mut events: broadcast::Receiver<ServerEvent>) -> usize {
    let mut seen = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                seen += 1;
                match &event {
                    ServerEvent::UserLoggedIn { name, peer } => {
                        info!(username = %name, %peer, "user online");
                    }
                    ServerEvent::UserLoggedOut { name } => {
                        info!(username = %name, "user offline");
                    }
                }
                log_active_users(&store.active_users());
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "dashboard fell behind the event stream");
                log_active_users(&store.active_users());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    seen
}

fn log_active_users(users: &[ActiveUser]) {
    info!(active = users.len(), "active users");
    for user in users {
        info!(
            username = %user.name,
            addr = %user.addr,
            since = %user.login_time.format("%Y-%m-%d %H:%M:%S"),
            "  active"
        );
    }
}
