//! Request routing.
//!
//! The [`Dispatcher`] owns the name → [`Session`] map and the document store.
//! It routes each decoded request to the right session, creating a session on
//! the first successful load for a JOIN and destroying it (save + release)
//! when its last member leaves.
//!
//! Output is a list of [`RouteAction`]s. Membership changes are reported as
//! `Joined`/`Left` so the caller can keep its per-peer index in step.

use std::collections::HashMap;

use gridsync_proto::{Command, Message, keys};

use crate::{
    driver::LogLevel,
    registry::PeerId,
    session::{Session, SessionAction},
    storage::{DocumentStore, StoreError},
};

/// Reply text for requests naming a document with no live session.
pub const NO_SESSION: &str = "There is no session for the requested spreadsheet";
/// Reply text for JOIN of a document the store does not have.
pub const NO_DOCUMENT: &str = "The requested spreadsheet does not exist";
/// Reply text for JOIN with the wrong password.
pub const BAD_PASSWORD: &str = "The provided password did not match the requested password";
/// Reply text for CREATE of a name that is already taken.
pub const ALREADY_EXISTS: &str = "The spreadsheet already exists";

/// Output of routing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Reply to the requesting peer
    Reply(Message),

    /// Deliver to a set of peers
    Broadcast {
        /// Recipients
        recipients: Vec<PeerId>,
        /// Message to deliver
        message: Message,
    },

    /// The requesting peer became a member of `document`
    Joined {
        /// Document name
        document: String,
    },

    /// The requesting peer is no longer a member of `document`
    Left {
        /// Document name
        document: String,
    },

    /// Operator-facing log line
    Log {
        /// Severity
        level: LogLevel,
        /// Message text
        message: String,
    },
}

/// Routes requests to per-document sessions.
pub struct Dispatcher<S: DocumentStore> {
    store: S,
    sessions: HashMap<String, Session>,
}

impl<S: DocumentStore> Dispatcher<S> {
    /// Create a dispatcher with no live sessions.
    pub fn new(store: S) -> Self {
        Self { store, sessions: HashMap::new() }
    }

    /// Route one request from `peer`.
    pub fn dispatch(&mut self, peer: PeerId, message: &Message) -> Vec<RouteAction> {
        let name = message.get(keys::NAME).unwrap_or_default();

        match message.command() {
            Command::Create => {
                self.handle_create(name, message.get(keys::PASSWORD).unwrap_or_default())
            },
            Command::Join => {
                self.handle_join(peer, name, message.get(keys::PASSWORD).unwrap_or_default())
            },
            Command::Change => {
                let version = message.get(keys::VERSION).unwrap_or_default();
                let cell = message.get(keys::CELL).unwrap_or_default();
                let text = message.get(keys::CONTENT).unwrap_or_default();
                match self.sessions.get_mut(name) {
                    Some(session) => convert(session.change(peer, version, cell, text)),
                    None => vec![no_session(Command::ChangeFail, name)],
                }
            },
            Command::Undo => {
                let version = message.get(keys::VERSION).unwrap_or_default();
                match self.sessions.get_mut(name) {
                    Some(session) => convert(session.undo(peer, version)),
                    None => vec![no_session(Command::UndoFail, name)],
                }
            },
            Command::Save => match self.sessions.get_mut(name) {
                Some(session) => convert(session.save(peer, &self.store)),
                None => vec![no_session(Command::SaveFail, name)],
            },
            Command::Leave => self.handle_leave(peer, name),
            other => vec![RouteAction::Log {
                level: LogLevel::Debug,
                message: format!("ignoring non-request command {other} from peer {peer}"),
            }],
        }
    }

    /// Drop `peer` from each named session, destroying sessions left empty.
    pub fn disconnect<'a>(
        &mut self,
        peer: PeerId,
        documents: impl IntoIterator<Item = &'a str>,
    ) -> Vec<RouteAction> {
        let mut actions = Vec::new();
        for name in documents {
            if let Some(session) = self.sessions.get_mut(name) {
                session.drop_peer(peer);
                if session.is_empty() {
                    actions.extend(self.destroy(name));
                }
            }
        }
        actions
    }

    /// Save and release every live session.
    pub fn shutdown(&mut self) -> Vec<RouteAction> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort_unstable();

        names.iter().flat_map(|name| self.destroy(name)).collect()
    }

    /// Live session for a document. `None` if not open.
    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Document store backing the sessions.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn handle_create(&mut self, name: &str, password: &str) -> Vec<RouteAction> {
        match self.store.create(name, password) {
            Ok(_) => vec![
                RouteAction::Reply(
                    Message::new(Command::CreateOk)
                        .with(keys::NAME, name)
                        .with(keys::PASSWORD, password),
                ),
                RouteAction::Log {
                    level: LogLevel::Info,
                    message: format!("document {name} created"),
                },
            ],
            Err(StoreError::AlreadyExists(_)) => {
                vec![failure(Command::CreateFail, name, ALREADY_EXISTS)]
            },
            Err(e) => vec![failure(Command::CreateFail, name, &e.to_string()), RouteAction::Log {
                level: LogLevel::Error,
                message: format!("failed to create document {name}: {e}"),
            }],
        }
    }

    fn handle_join(&mut self, peer: PeerId, name: &str, password: &str) -> Vec<RouteAction> {
        let mut actions = Vec::new();

        if !self.sessions.contains_key(name) {
            match self.store.load(name) {
                Ok(document) => {
                    self.sessions.insert(name.to_string(), Session::open(document));
                    actions.push(RouteAction::Log {
                        level: LogLevel::Info,
                        message: format!("session opened for document {name}"),
                    });
                },
                Err(StoreError::NotFound(_)) => {
                    return vec![failure(Command::JoinFail, name, NO_DOCUMENT)];
                },
                Err(e) => {
                    return vec![failure(Command::JoinFail, name, &e.to_string()), RouteAction::Log {
                        level: LogLevel::Error,
                        message: format!("failed to load document {name}: {e}"),
                    }];
                },
            }
        }

        let Some(session) = self.sessions.get_mut(name) else {
            return actions;
        };

        if session.admit(peer, password) {
            actions.push(RouteAction::Reply(session.describe_for_join()));
            actions.push(RouteAction::Joined { document: name.to_string() });
        } else {
            actions.push(failure(Command::JoinFail, name, BAD_PASSWORD));
        }
        actions
    }

    fn handle_leave(&mut self, peer: PeerId, name: &str) -> Vec<RouteAction> {
        let Some(session) = self.sessions.get_mut(name) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        if session.drop_peer(peer) {
            actions.push(RouteAction::Left { document: name.to_string() });
        }
        if session.is_empty() {
            actions.extend(self.destroy(name));
        }
        actions
    }

    /// Remove a session, saving its document.
    fn destroy(&mut self, name: &str) -> Vec<RouteAction> {
        let Some(session) = self.sessions.remove(name) else {
            return Vec::new();
        };

        match session.close(&self.store) {
            Ok(()) => vec![RouteAction::Log {
                level: LogLevel::Info,
                message: format!("session for document {name} saved and closed"),
            }],
            Err(e) => vec![RouteAction::Log {
                level: LogLevel::Error,
                message: format!("failed to save document {name} on close: {e}"),
            }],
        }
    }
}

impl<S: DocumentStore> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("session_count", &self.sessions.len()).finish()
    }
}

fn convert(actions: Vec<SessionAction>) -> Vec<RouteAction> {
    actions
        .into_iter()
        .map(|action| match action {
            SessionAction::Reply(message) => RouteAction::Reply(message),
            SessionAction::Broadcast { recipients, message } => {
                RouteAction::Broadcast { recipients, message }
            },
            SessionAction::StoreFailed { document, error } => RouteAction::Log {
                level: LogLevel::Error,
                message: format!("failed to save document {document}: {error}"),
            },
        })
        .collect()
}

fn failure(command: Command, name: &str, reason: &str) -> RouteAction {
    RouteAction::Reply(Message::new(command).with(keys::NAME, name).with(keys::MESSAGE, reason))
}

fn no_session(command: Command, name: &str) -> RouteAction {
    failure(command, name, NO_SESSION)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::storage::{ChaoticStore, MemoryStore};

    fn request(command: Command, params: &[(&str, &str)]) -> Message {
        params.iter().fold(Message::new(command), |m, (k, v)| m.with(*k, *v))
    }

    fn replies(actions: &[RouteAction]) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                RouteAction::Reply(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn join(dispatcher: &mut Dispatcher<MemoryStore>, peer: PeerId, pw: &str) -> Vec<RouteAction> {
        dispatcher.dispatch(
            peer,
            &request(Command::Join, &[(keys::NAME, "budget"), (keys::PASSWORD, pw)]),
        )
    }

    fn dispatcher_with_document() -> Dispatcher<MemoryStore> {
        let store = MemoryStore::new();
        store.create("budget", "pw").unwrap();
        Dispatcher::new(store)
    }

    #[test]
    fn create_replies_ok_then_already_exists() {
        let mut dispatcher = Dispatcher::new(MemoryStore::new());
        let create = request(Command::Create, &[(keys::NAME, "budget"), (keys::PASSWORD, "pw")]);

        let first = dispatcher.dispatch(1, &create);
        assert_eq!(replies(&first)[0].command(), Command::CreateOk);
        assert_eq!(replies(&first)[0].get(keys::PASSWORD), Some("pw"));

        let second = dispatcher.dispatch(1, &create);
        assert_eq!(second, vec![failure(Command::CreateFail, "budget", ALREADY_EXISTS)]);
        assert_eq!(dispatcher.session_count(), 0);
    }

    #[test]
    fn join_unknown_document_fails_without_session() {
        let mut dispatcher = Dispatcher::new(MemoryStore::new());
        let actions = join(&mut dispatcher, 1, "pw");

        assert_eq!(actions, vec![failure(Command::JoinFail, "budget", NO_DOCUMENT)]);
        assert_eq!(dispatcher.session_count(), 0);
    }

    #[test]
    fn join_opens_session_and_reports_membership() {
        let mut dispatcher = dispatcher_with_document();
        let actions = join(&mut dispatcher, 1, "pw");

        assert_eq!(replies(&actions)[0].command(), Command::JoinOk);
        assert!(actions.contains(&RouteAction::Joined { document: "budget".to_string() }));
        assert!(dispatcher.session("budget").unwrap().is_member(1));
    }

    #[test]
    fn wrong_password_keeps_session() {
        let mut dispatcher = dispatcher_with_document();
        join(&mut dispatcher, 1, "pw");

        let actions = join(&mut dispatcher, 2, "nope");
        assert_eq!(actions, vec![failure(Command::JoinFail, "budget", BAD_PASSWORD)]);

        let session = dispatcher.session("budget").unwrap();
        assert_eq!(session.member_count(), 1);
        assert!(!session.is_member(2));
    }

    #[test]
    fn wrong_password_on_first_join_still_opens_session() {
        let mut dispatcher = dispatcher_with_document();
        let actions = join(&mut dispatcher, 1, "nope");

        assert_eq!(replies(&actions)[0].command(), Command::JoinFail);
        assert!(dispatcher.session("budget").unwrap().is_empty());
    }

    #[test]
    fn requests_without_session_fail() {
        let mut dispatcher = dispatcher_with_document();

        for (command, fail) in [
            (Command::Change, Command::ChangeFail),
            (Command::Undo, Command::UndoFail),
            (Command::Save, Command::SaveFail),
        ] {
            let actions = dispatcher.dispatch(1, &request(command, &[(keys::NAME, "budget")]));
            assert_eq!(actions, vec![failure(fail, "budget", NO_SESSION)]);
        }
    }

    #[test]
    fn leave_without_session_is_silent() {
        let mut dispatcher = dispatcher_with_document();
        let actions = dispatcher.dispatch(1, &request(Command::Leave, &[(keys::NAME, "budget")]));
        assert!(actions.is_empty());
    }

    #[test]
    fn last_leave_saves_and_destroys() {
        let mut dispatcher = dispatcher_with_document();
        join(&mut dispatcher, 1, "pw");
        dispatcher.dispatch(
            1,
            &request(Command::Change, &[
                (keys::NAME, "budget"),
                (keys::VERSION, "0"),
                (keys::CELL, "A1"),
                (keys::LENGTH, "1"),
                (keys::CONTENT, "3"),
            ]),
        );

        let actions = dispatcher.dispatch(1, &request(Command::Leave, &[(keys::NAME, "budget")]));
        assert!(actions.contains(&RouteAction::Left { document: "budget".to_string() }));
        assert_eq!(dispatcher.session_count(), 0);
        assert_eq!(dispatcher.store().load("budget").unwrap().cell("A1"), "3");

        // Rejoin starts a fresh session at version 0
        let actions = join(&mut dispatcher, 1, "pw");
        assert_eq!(replies(&actions)[0].get(keys::VERSION), Some("0"));
    }

    #[test]
    fn disconnect_destroys_emptied_sessions_only() {
        let store = MemoryStore::new();
        store.create("a", "pw").unwrap();
        store.create("b", "pw").unwrap();
        let mut dispatcher = Dispatcher::new(store);

        for (peer, name) in [(1, "a"), (1, "b"), (2, "b")] {
            dispatcher.dispatch(
                peer,
                &request(Command::Join, &[(keys::NAME, name), (keys::PASSWORD, "pw")]),
            );
        }

        dispatcher.disconnect(1, ["a", "b"]);
        assert!(dispatcher.session("a").is_none());
        assert_eq!(dispatcher.session("b").unwrap().member_count(), 1);
    }

    #[test]
    fn shutdown_saves_every_session() {
        let mut dispatcher = dispatcher_with_document();
        join(&mut dispatcher, 1, "pw");

        let actions = dispatcher.shutdown();
        assert_eq!(dispatcher.session_count(), 0);
        assert!(matches!(actions[0], RouteAction::Log { level: LogLevel::Info, .. }));
    }

    #[test]
    fn store_failure_on_create_is_reported() {
        let mut dispatcher = Dispatcher::new(ChaoticStore::new(MemoryStore::new(), 1.0));
        let actions = dispatcher
            .dispatch(1, &request(Command::Create, &[(keys::NAME, "x"), (keys::PASSWORD, "pw")]));

        assert_eq!(replies(&actions)[0].command(), Command::CreateFail);
        assert!(actions.iter().any(|a| matches!(a, RouteAction::Log { level: LogLevel::Error, .. })));
    }

    #[test]
    fn reply_commands_are_ignored() {
        let mut dispatcher = dispatcher_with_document();
        let actions = dispatcher.dispatch(1, &request(Command::SaveOk, &[(keys::NAME, "budget")]));

        assert!(replies(&actions).is_empty());
        assert_eq!(dispatcher.session_count(), 0);
    }
}
