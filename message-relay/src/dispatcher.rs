//! Per-connection protocol state machine.
//!
//! The dispatcher owns the registry and the relay queue. It never touches a
//! socket: each decoded frame is turned into an [`Outcome`] that the server
//! loop applies to the connection that sent it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::mux::ConnId;
use crate::protocol::{self, NAME_RESERVED, Request, Response};
use crate::registry::{Registry, RegistryError};
use crate::relay::{Delivery, DrainReport, PendingMessage, RelayQueue, RetryPolicy};
use crate::store::Persistence;

/// Registry changes published to observers such as the operator dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    UserLoggedIn { name: String, peer: SocketAddr },
    UserLoggedOut { name: String },
}

/// The connection a frame arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub id: ConnId,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write a response and keep the connection.
    Reply(Response),
    /// Nothing to write.
    Silent,
    /// Write the optional response, then close the connection.
    Close(Option<Response>),
    /// Transport failure: drop the connection without a response.
    Drop,
}

pub struct Dispatcher {
    registry: Registry,
    relay: RelayQueue,
    store: Arc<dyn Persistence>,
    events: broadcast::Sender<ServerEvent>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Persistence>,
        policy: RetryPolicy,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            relay: RelayQueue::new(policy),
            store,
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn relay(&self) -> &RelayQueue {
        &self.relay
    }

    /// Decodes one frame and runs it through the state machine.
    pub fn handle_frame(&mut self, session: &Session, frame: &[u8]) -> Outcome {
        match protocol::decode_request(frame) {
            Ok(request) => self.dispatch(session, request),
            Err(err) if err.is_transport() => {
                debug!(conn = %session.id, error = %err, "undecodable frame");
                Outcome::Drop
            }
            Err(err) => {
                debug!(conn = %session.id, error = %err, "malformed request");
                Outcome::Reply(Response::bad_request())
            }
        }
    }

    pub fn dispatch(&mut self, session: &Session, request: Request) -> Outcome {
        debug!(conn = %session.id, action = request.action(), "dispatching request");
        match request {
            Request::Presence { user, .. } => self.presence(session, &user.account_name),
            Request::Send {
                time,
                sender,
                destination,
                text,
            } => self.send(
                session,
                PendingMessage {
                    sender,
                    destination,
                    text,
                    timestamp: time,
                },
            ),
            Request::Exit { account_name, .. } => self.exit(session, &account_name),
            Request::GetContacts { user, .. } => self.get_contacts(session, &user),
            Request::AddContact {
                user, account_name, ..
            } => self.add_contact(session, &user, &account_name),
            Request::RemoveContact {
                user, account_name, ..
            } => self.remove_contact(session, &user, &account_name),
            Request::UsersRequest { account_name, .. } => self.users(session, &account_name),
        }
    }

    /// Releases whatever the connection holds. Safe to call more than once.
    pub fn disconnect(&mut self, conn: ConnId) {
        let Some(name) = self.registry.unregister_connection(conn) else {
            return;
        };
        info!(conn = %conn, username = %name, "user logged out");
        if let Err(err) = self.store.user_logout(&name) {
            warn!(username = %name, error = %err, "failed to record logout");
        }
        self.publish(ServerEvent::UserLoggedOut { name });
    }

    /// Logs out every registered user and discards undelivered messages.
    /// Returns the number of sessions released.
    pub fn shutdown(&mut self) -> usize {
        let sessions = self.registry.drain();
        for (name, conn) in &sessions {
            info!(conn = %conn, username = %name, "logging out user for shutdown");
            if let Err(err) = self.store.user_logout(name) {
                warn!(username = %name, error = %err, "failed to record logout");
            }
            self.publish(ServerEvent::UserLoggedOut { name: name.clone() });
        }

        let dropped = self.relay.clear();
        if dropped > 0 {
            warn!(dropped, "discarding undelivered messages");
        }
        sessions.len()
    }

    /// Offers every due message to `forward`, which receives the registered
    /// destination connection and the frame to deliver and reports whether
    /// the frame was queued for writing.
    pub fn drain_relay<F>(&mut self, now: Instant, mut forward: F) -> DrainReport
    where
        F: FnMut(ConnId, &Request) -> bool,
    {
        let registry = &self.registry;
        self.relay.drain(now, |message| {
            let Some(conn) = registry.lookup(&message.destination) else {
                return Delivery::NotRegistered;
            };
            if forward(conn, &message.to_request()) {
                Delivery::Delivered
            } else {
                Delivery::NotWritable
            }
        })
    }

    fn presence(&mut self, session: &Session, name: &str) -> Outcome {
        if self.registry.username_of(session.id) == Some(name) {
            return Outcome::Reply(Response::ok());
        }

        match self.registry.register(name, session.id) {
            Ok(()) => {
                info!(conn = %session.id, peer = %session.peer, username = %name, "user logged in");
                if let Err(err) = self.store.user_login(name, session.peer) {
                    warn!(username = %name, error = %err, "failed to record login");
                }
                self.publish(ServerEvent::UserLoggedIn {
                    name: name.to_string(),
                    peer: session.peer,
                });
                Outcome::Reply(Response::ok())
            }
            Err(RegistryError::NameConflict) => {
                warn!(conn = %session.id, peer = %session.peer, username = %name, "name already reserved");
                self.disconnect(session.id);
                Outcome::Close(Some(Response::error(NAME_RESERVED)))
            }
            Err(err @ RegistryError::AlreadyRegistered(_)) => {
                debug!(conn = %session.id, error = %err, "rejected second presence");
                Outcome::Reply(Response::bad_request())
            }
        }
    }

    fn send(&mut self, session: &Session, message: PendingMessage) -> Outcome {
        if self.registry.username_of(session.id) != Some(message.sender.as_str()) {
            debug!(conn = %session.id, sender = %message.sender, "sender is not the bound user");
            return Outcome::Reply(Response::bad_request());
        }

        if let Err(err) = self
            .store
            .process_message(&message.sender, &message.destination)
        {
            warn!(sender = %message.sender, destination = %message.destination, error = %err, "failed to count message");
        }
        self.relay.push(message, Instant::now());
        Outcome::Silent
    }

    fn exit(&mut self, session: &Session, name: &str) -> Outcome {
        if self.registry.username_of(session.id) != Some(name) {
            debug!(conn = %session.id, username = %name, "exit for a name this connection does not hold");
            return Outcome::Reply(Response::bad_request());
        }

        self.disconnect(session.id);
        Outcome::Close(None)
    }

    fn get_contacts(&mut self, session: &Session, user: &str) -> Outcome {
        if !self.owns(session, user) {
            return Outcome::Reply(Response::bad_request());
        }

        match self.store.get_contacts(user) {
            Ok(contacts) => Outcome::Reply(Response::with_payload(contacts)),
            Err(err) => {
                warn!(username = %user, error = %err, "failed to load contacts");
                Outcome::Reply(Response::error(err.to_string()))
            }
        }
    }

    fn add_contact(&mut self, session: &Session, user: &str, contact: &str) -> Outcome {
        if !self.owns(session, user) {
            return Outcome::Reply(Response::bad_request());
        }

        if let Err(err) = self.store.add_contact(user, contact) {
            warn!(username = %user, %contact, error = %err, "failed to add contact");
        }
        Outcome::Reply(Response::ok())
    }

    fn remove_contact(&mut self, session: &Session, user: &str, contact: &str) -> Outcome {
        if !self.owns(session, user) {
            return Outcome::Reply(Response::bad_request());
        }

        if let Err(err) = self.store.remove_contact(user, contact) {
            warn!(username = %user, %contact, error = %err, "failed to remove contact");
        }
        Outcome::Reply(Response::ok())
    }

    fn users(&mut self, session: &Session, account: &str) -> Outcome {
        if !self.owns(session, account) {
            return Outcome::Reply(Response::bad_request());
        }

        match self.store.users_list() {
            Ok(users) => Outcome::Reply(Response::with_payload(users)),
            Err(err) => {
                warn!(error = %err, "failed to load user list");
                Outcome::Reply(Response::error(err.to_string()))
            }
        }
    }

    /// Identity guard: the named user must be registered on this connection.
    fn owns(&self, session: &Session, user: &str) -> bool {
        let owned = self.registry.lookup(user) == Some(session.id);
        if !owned {
            debug!(conn = %session.id, username = %user, "identity guard rejected request");
        }
        owned
    }

    fn publish(&self, event: ServerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BAD_REQUEST, Status};
    use crate::store::{MemoryStore, StoreError};

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<ServerEvent>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (tx, events) = broadcast::channel(16);
        let dispatcher = Dispatcher::new(store.clone(), RetryPolicy::default(), tx);
        Harness {
            dispatcher,
            store,
            events,
        }
    }

    fn session(id: u64) -> Session {
        Session {
            id: ConnId(id),
            peer: SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16)),
        }
    }

    fn login(dispatcher: &mut Dispatcher, id: u64, name: &str) {
        let outcome = dispatcher.dispatch(&session(id), Request::presence(name));
        assert_eq!(outcome, Outcome::Reply(Response::ok()));
    }

    #[test]
    fn presence_registers_and_notifies() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");

        assert_eq!(h.dispatcher.registry().lookup("alice"), Some(ConnId(1)));
        assert_eq!(h.store.active_users()[0].name, "alice");
        assert_eq!(
            h.events.try_recv().expect("login event"),
            ServerEvent::UserLoggedIn {
                name: "alice".into(),
                peer: session(1).peer,
            }
        );
    }

    #[test]
    fn conflicting_presence_closes_new_connection_only() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");

        let outcome = h.dispatcher.dispatch(&session(2), Request::presence("alice"));
        assert_eq!(outcome, Outcome::Close(Some(Response::error(NAME_RESERVED))));
        assert_eq!(h.dispatcher.registry().lookup("alice"), Some(ConnId(1)));
        assert_eq!(h.dispatcher.registry().username_of(ConnId(2)), None);
    }

    #[test]
    fn registered_connection_claiming_taken_name_loses_its_own() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 2, "bob");

        let outcome = h.dispatcher.dispatch(&session(2), Request::presence("alice"));
        assert!(matches!(outcome, Outcome::Close(Some(_))));
        assert_eq!(h.dispatcher.registry().lookup("bob"), None);
        assert_eq!(h.dispatcher.registry().lookup("alice"), Some(ConnId(1)));
    }

    #[test]
    fn second_name_on_same_connection_is_rejected() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 1, "alice");

        let outcome = h.dispatcher.dispatch(&session(1), Request::presence("mallory"));
        assert_eq!(outcome, Outcome::Reply(Response::bad_request()));
        assert_eq!(h.dispatcher.registry().len(), 1);
        assert_eq!(h.store.login_history(Some("alice")).len(), 1);
    }

    #[test]
    fn send_enqueues_and_counts() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 2, "bob");

        let outcome = h
            .dispatcher
            .dispatch(&session(1), Request::send("alice", "bob", "hi"));
        assert_eq!(outcome, Outcome::Silent);
        assert_eq!(h.dispatcher.relay().len(), 1);

        let mut forwarded = Vec::new();
        let report = h.dispatcher.drain_relay(Instant::now(), |conn, frame| {
            forwarded.push((conn, frame.clone()));
            true
        });
        assert_eq!(report.delivered, 1);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, ConnId(2));
        assert!(matches!(
            &forwarded[0].1,
            Request::Send { sender, text, .. } if sender == "alice" && text == "hi"
        ));

        let stats = h.store.message_stats();
        assert_eq!((stats[0].sent, stats[1].accepted), (1, 1));
    }

    #[test]
    fn send_from_unbound_sender_is_rejected() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");

        let spoofed = h
            .dispatcher
            .dispatch(&session(1), Request::send("bob", "alice", "hi"));
        assert_eq!(spoofed, Outcome::Reply(Response::bad_request()));

        let anonymous = h
            .dispatcher
            .dispatch(&session(9), Request::send("alice", "alice", "hi"));
        assert_eq!(anonymous, Outcome::Reply(Response::bad_request()));
        assert!(h.dispatcher.relay().is_empty());
    }

    #[test]
    fn relay_to_unregistered_destination_leaves_sessions_alone() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        h.dispatcher
            .dispatch(&session(1), Request::send("alice", "ghost", "boo"));

        let report = h
            .dispatcher
            .drain_relay(Instant::now(), |_, _| panic!("no destination connection"));
        assert_eq!(report.dropped, 1);
        assert_eq!(h.dispatcher.registry().lookup("alice"), Some(ConnId(1)));
    }

    #[test]
    fn exit_unregisters_and_frees_the_name() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");

        let outcome = h.dispatcher.dispatch(&session(1), Request::exit("alice"));
        assert_eq!(outcome, Outcome::Close(None));
        assert!(h.dispatcher.registry().is_empty());
        assert!(h.store.active_users().is_empty());

        // Closing the connection afterwards must not log out twice.
        h.dispatcher.disconnect(ConnId(1));
        let _ = h.events.try_recv();
        assert_eq!(
            h.events.try_recv().expect("logout event"),
            ServerEvent::UserLoggedOut {
                name: "alice".into()
            }
        );
        assert!(h.events.try_recv().is_err());

        login(&mut h.dispatcher, 3, "alice");
    }

    #[test]
    fn exit_for_another_name_is_rejected() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 2, "bob");

        let outcome = h.dispatcher.dispatch(&session(2), Request::exit("alice"));
        assert_eq!(outcome, Outcome::Reply(Response::bad_request()));
        assert_eq!(h.dispatcher.registry().lookup("alice"), Some(ConnId(1)));
    }

    #[test]
    fn contact_queries_answer_the_owner() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 2, "bob");

        let added = h
            .dispatcher
            .dispatch(&session(1), Request::add_contact("alice", "bob"));
        assert_eq!(added, Outcome::Reply(Response::ok()));

        let contacts = h
            .dispatcher
            .dispatch(&session(1), Request::get_contacts("alice"));
        assert_eq!(
            contacts,
            Outcome::Reply(Response::with_payload(vec!["bob".into()]))
        );

        let users = h
            .dispatcher
            .dispatch(&session(1), Request::users_request("alice"));
        assert_eq!(
            users,
            Outcome::Reply(Response::with_payload(vec!["alice".into(), "bob".into()]))
        );

        let removed = h
            .dispatcher
            .dispatch(&session(1), Request::remove_contact("alice", "bob"));
        assert_eq!(removed, Outcome::Reply(Response::ok()));
        assert!(h.store.get_contacts("alice").expect("contacts").is_empty());
    }

    #[test]
    fn identity_guard_blocks_other_users_data() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 2, "bob");
        h.store.add_contact("alice", "bob").expect("seed contact");

        let requests = [
            Request::get_contacts("alice"),
            Request::add_contact("alice", "alice"),
            Request::remove_contact("alice", "bob"),
            Request::users_request("alice"),
        ];
        for request in requests {
            let outcome = h.dispatcher.dispatch(&session(2), request);
            assert_eq!(outcome, Outcome::Reply(Response::bad_request()));
        }
        assert_eq!(h.store.get_contacts("alice").expect("contacts"), vec!["bob"]);
    }

    #[test]
    fn identity_guard_fails_closed_for_unregistered_users() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");

        let outcome = h
            .dispatcher
            .dispatch(&session(1), Request::get_contacts("nobody"));
        assert_eq!(outcome, Outcome::Reply(Response::bad_request()));

        let outcome = h
            .dispatcher
            .dispatch(&session(5), Request::users_request("nobody"));
        assert_eq!(outcome, Outcome::Reply(Response::bad_request()));
    }

    #[test]
    fn frames_are_classified_before_dispatch() {
        let mut h = harness();
        let malformed = h
            .dispatcher
            .handle_frame(&session(1), br#"{"action":"presence","time":1.0}"#);
        assert_eq!(malformed, Outcome::Reply(Response::bad_request()));

        let garbage = h.dispatcher.handle_frame(&session(1), b"\x00\x01garbage");
        assert_eq!(garbage, Outcome::Drop);
    }

    #[test]
    fn shutdown_logs_everyone_out() {
        let mut h = harness();
        login(&mut h.dispatcher, 1, "alice");
        login(&mut h.dispatcher, 2, "bob");
        h.dispatcher
            .dispatch(&session(1), Request::send("alice", "bob", "late"));

        assert_eq!(h.dispatcher.shutdown(), 2);
        assert!(h.dispatcher.registry().is_empty());
        assert!(h.dispatcher.relay().is_empty());
        assert!(h.store.active_users().is_empty());
    }

    struct FailingStore;

    impl Persistence for FailingStore {
        fn user_login(&self, _: &str, _: SocketAddr) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        fn user_logout(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        fn users_list(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        fn get_contacts(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        fn add_contact(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        fn remove_contact(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        fn process_message(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    #[test]
    fn store_failures_do_not_break_relaying() {
        let (tx, _rx) = broadcast::channel(16);
        let mut dispatcher = Dispatcher::new(Arc::new(FailingStore), RetryPolicy::default(), tx);

        login(&mut dispatcher, 1, "alice");
        login(&mut dispatcher, 2, "bob");
        let sent = dispatcher.dispatch(&session(1), Request::send("alice", "bob", "hi"));
        assert_eq!(sent, Outcome::Silent);
        assert_eq!(dispatcher.relay().len(), 1);

        let added = dispatcher.dispatch(&session(1), Request::add_contact("alice", "bob"));
        assert_eq!(added, Outcome::Reply(Response::ok()));

        let Outcome::Reply(response) =
            dispatcher.dispatch(&session(1), Request::get_contacts("alice"))
        else {
            panic!("expected a reply");
        };
        assert_eq!(response.status, Status::BadRequest);
        assert_ne!(response.error.as_deref(), Some(BAD_REQUEST));
    }
}
