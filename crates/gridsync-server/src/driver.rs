//! Server driver.
//!
//! Ties together the connection registry (peer → joined documents) and the
//! dispatcher (document → session). The driver is Sans-IO: the runtime feeds
//! it [`ServerEvent`]s and executes the [`ServerAction`]s it returns.

use gridsync_proto::{DecodeError, Message};

use crate::{
    dispatcher::{Dispatcher, RouteAction},
    error::DriverError,
    registry::{ConnectionRegistry, PeerId, PeerInfo},
    storage::DocumentStore,
};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { max_connections: 10_000 }
    }
}

/// Events that the server driver processes.
///
/// These are produced by the runtime (or a test harness).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        peer: PeerId,
        /// Connection metadata
        info: PeerInfo,
    },

    /// A complete request was decoded from a connection
    MessageReceived {
        /// Connection that sent the request
        peer: PeerId,
        /// The decoded request
        message: Message,
    },

    /// The connection's decoder rejected its input
    MalformedInput {
        /// Connection that sent the input
        peer: PeerId,
        /// What was wrong
        error: DecodeError,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        peer: PeerId,
        /// Reason for closure
        reason: String,
    },

    /// The server is draining: save every session, close every connection
    Shutdown,
}

/// Actions that the server driver produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Send a message to one peer
    SendToPeer {
        /// Target peer
        peer: PeerId,
        /// Message to send
        message: Message,
    },

    /// Send the same message to several peers
    Broadcast {
        /// Target peers
        peers: Vec<PeerId>,
        /// Message to send
        message: Message,
    },

    /// Close a connection
    ClosePeer {
        /// Peer to close
        peer: PeerId,
        /// Reason for closure
        reason: String,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Action-based server driver.
pub struct ServerDriver<S: DocumentStore> {
    /// Peer/document registry
    registry: ConnectionRegistry,
    /// Session routing
    dispatcher: Dispatcher<S>,
    /// Driver configuration
    config: DriverConfig,
    /// Set once `Shutdown` has been processed
    shutting_down: bool,
}

impl<S: DocumentStore> ServerDriver<S> {
    /// Create a new server driver.
    pub fn new(store: S, config: DriverConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            dispatcher: Dispatcher::new(store),
            config,
            shutting_down: false,
        }
    }

    /// Process a server event and return actions to execute.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, DriverError> {
        match event {
            ServerEvent::ConnectionAccepted { peer, info } => {
                self.handle_connection_accepted(peer, info)
            },
            ServerEvent::MessageReceived { peer, message } => {
                self.handle_message_received(peer, &message)
            },
            ServerEvent::MalformedInput { peer, error } => self.handle_malformed(peer, &error),
            ServerEvent::ConnectionClosed { peer, reason } => {
                Ok(self.handle_connection_closed(peer, &reason))
            },
            ServerEvent::Shutdown => Ok(self.handle_shutdown()),
        }
    }

    fn handle_connection_accepted(
        &mut self,
        peer: PeerId,
        info: PeerInfo,
    ) -> Result<Vec<ServerAction>, DriverError> {
        // Connections racing the shutdown are never registered, so nothing
        // would close them later.
        if self.shutting_down {
            return Ok(vec![ServerAction::ClosePeer {
                peer,
                reason: "server shutting down".to_string(),
            }]);
        }

        if self.registry.peer_count() >= self.config.max_connections {
            return Ok(vec![ServerAction::ClosePeer {
                peer,
                reason: "max connections exceeded".to_string(),
            }]);
        }

        let addr = info.remote_addr;
        if !self.registry.register_peer(peer, info) {
            return Err(DriverError::PeerAlreadyExists(peer));
        }

        let message = match addr {
            Some(addr) => format!("peer {peer} connected from {addr}"),
            None => format!("peer {peer} connected"),
        };
        Ok(vec![ServerAction::Log { level: LogLevel::Debug, message }])
    }

    fn handle_message_received(
        &mut self,
        peer: PeerId,
        message: &Message,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if !self.registry.has_peer(peer) {
            return Err(DriverError::PeerNotFound(peer));
        }

        let route_actions = self.dispatcher.dispatch(peer, message);
        Ok(self.apply_route_actions(peer, route_actions))
    }

    fn handle_malformed(
        &mut self,
        peer: PeerId,
        error: &DecodeError,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if !self.registry.has_peer(peer) {
            return Err(DriverError::PeerNotFound(peer));
        }

        Ok(vec![ServerAction::SendToPeer { peer, message: Message::error() }, ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("malformed input from peer {peer}: {error}"),
        }])
    }

    fn handle_connection_closed(&mut self, peer: PeerId, reason: &str) -> Vec<ServerAction> {
        let Some((_info, documents)) = self.registry.unregister_peer(peer) else {
            return Vec::new();
        };

        let mut names: Vec<&str> = documents.iter().map(String::as_str).collect();
        names.sort_unstable();

        let mut actions = vec![ServerAction::Log {
            level: LogLevel::Info,
            message: format!("peer {peer} closed: {reason}, was in {} documents", names.len()),
        }];
        let route_actions = self.dispatcher.disconnect(peer, names);
        actions.extend(self.apply_route_actions(peer, route_actions));
        actions
    }

    fn handle_shutdown(&mut self) -> Vec<ServerAction> {
        self.shutting_down = true;
        let route_actions = self.dispatcher.shutdown();
        let mut actions = Vec::new();
        for action in route_actions {
            if let RouteAction::Log { level, message } = action {
                actions.push(ServerAction::Log { level, message });
            }
        }

        let mut peers: Vec<PeerId> = self.registry.peers().collect();
        peers.sort_unstable();
        for peer in peers {
            self.registry.unregister_peer(peer);
            actions.push(ServerAction::ClosePeer { peer, reason: "server shutdown".to_string() });
        }

        actions
    }

    /// Convert dispatcher output to server actions, keeping the registry in
    /// step with session membership.
    fn apply_route_actions(&mut self, peer: PeerId, actions: Vec<RouteAction>) -> Vec<ServerAction> {
        let mut out = Vec::with_capacity(actions.len());

        for action in actions {
            match action {
                RouteAction::Reply(message) => out.push(ServerAction::SendToPeer { peer, message }),
                RouteAction::Broadcast { recipients, message } => {
                    if !recipients.is_empty() {
                        out.push(ServerAction::Broadcast { peers: recipients, message });
                    }
                },
                RouteAction::Joined { document } => {
                    self.registry.join(peer, &document);
                    out.push(ServerAction::Log {
                        level: LogLevel::Debug,
                        message: format!("peer {peer} joined document {document}"),
                    });
                },
                RouteAction::Left { document } => {
                    self.registry.leave(peer, &document);
                    out.push(ServerAction::Log {
                        level: LogLevel::Debug,
                        message: format!("peer {peer} left document {document}"),
                    });
                },
                RouteAction::Log { level, message } => out.push(ServerAction::Log { level, message }),
            }
        }

        out
    }

    /// All peers that joined a document.
    pub fn peers_in_document(&self, document: &str) -> impl Iterator<Item = PeerId> + '_ {
        self.registry.peers_in_document(document)
    }

    /// Whether `Shutdown` has been processed.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.dispatcher.session_count()
    }

    /// Current version of a live session. `None` if no session is open.
    pub fn session_version(&self, document: &str) -> Option<u64> {
        self.dispatcher.session(document).map(crate::session::Session::version)
    }

    /// Document store backing the sessions.
    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    /// Names of every document in the store.
    pub fn stored_documents(&self) -> Result<Vec<String>, DriverError> {
        let mut names = self.dispatcher.store().list_documents()?;
        names.sort_unstable();
        Ok(names)
    }
}

impl<S: DocumentStore> std::fmt::Debug for ServerDriver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connection_count", &self.registry.peer_count())
            .field("session_count", &self.dispatcher.session_count())
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use gridsync_proto::{Command, keys};

    use super::*;
    use crate::storage::MemoryStore;

    fn accept(driver: &mut ServerDriver<MemoryStore>, peer: PeerId) -> Vec<ServerAction> {
        driver
            .process_event(ServerEvent::ConnectionAccepted { peer, info: PeerInfo::default() })
            .unwrap()
    }

    fn send(driver: &mut ServerDriver<MemoryStore>, peer: PeerId, message: Message) -> Vec<ServerAction> {
        driver.process_event(ServerEvent::MessageReceived { peer, message }).unwrap()
    }

    fn join_message(name: &str) -> Message {
        Message::new(Command::Join).with(keys::NAME, name).with(keys::PASSWORD, "pw")
    }

    fn driver_with_document() -> ServerDriver<MemoryStore> {
        let store = MemoryStore::new();
        store.create("budget", "pw").unwrap();
        ServerDriver::new(store, DriverConfig::default())
    }

    #[test]
    fn server_accepts_connection() {
        let mut driver = driver_with_document();
        let actions = accept(&mut driver, 1);

        assert_eq!(driver.connection_count(), 1);
        assert!(matches!(actions[0], ServerAction::Log { level: LogLevel::Debug, .. }));
    }

    #[test]
    fn duplicate_peer_is_an_error() {
        let mut driver = driver_with_document();
        accept(&mut driver, 1);

        let result =
            driver.process_event(ServerEvent::ConnectionAccepted { peer: 1, info: PeerInfo::default() });
        assert!(matches!(result, Err(DriverError::PeerAlreadyExists(1))));
    }

    #[test]
    fn connection_limit_closes_excess_peers() {
        let mut driver = ServerDriver::new(MemoryStore::new(), DriverConfig { max_connections: 1 });
        accept(&mut driver, 1);

        let actions = accept(&mut driver, 2);
        assert!(matches!(actions[0], ServerAction::ClosePeer { peer: 2, .. }));
        assert_eq!(driver.connection_count(), 1);
    }

    #[test]
    fn message_from_unknown_peer_is_an_error() {
        let mut driver = driver_with_document();
        let result =
            driver.process_event(ServerEvent::MessageReceived { peer: 7, message: join_message("budget") });
        assert!(matches!(result, Err(DriverError::PeerNotFound(7))));
    }

    #[test]
    fn malformed_input_replies_error() {
        let mut driver = driver_with_document();
        accept(&mut driver, 1);

        let actions = driver
            .process_event(ServerEvent::MalformedInput {
                peer: 1,
                error: DecodeError::UnknownCommand("HELLO".to_string()),
            })
            .unwrap();
        assert_eq!(actions[0], ServerAction::SendToPeer { peer: 1, message: Message::error() });
    }

    #[test]
    fn join_registers_membership() {
        let mut driver = driver_with_document();
        accept(&mut driver, 1);

        let actions = send(&mut driver, 1, join_message("budget"));
        assert!(matches!(&actions[1], ServerAction::SendToPeer { peer: 1, message } if message.command() == Command::JoinOk));
        assert_eq!(driver.peers_in_document("budget").collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn disconnect_drops_membership_and_destroys_session() {
        let mut driver = driver_with_document();
        accept(&mut driver, 1);
        send(&mut driver, 1, join_message("budget"));
        assert_eq!(driver.session_count(), 1);

        driver
            .process_event(ServerEvent::ConnectionClosed { peer: 1, reason: "eof".to_string() })
            .unwrap();

        assert_eq!(driver.session_count(), 0);
        assert_eq!(driver.connection_count(), 0);
        assert_eq!(driver.peers_in_document("budget").count(), 0);
    }

    #[test]
    fn shutdown_closes_every_peer() {
        let mut driver = driver_with_document();
        accept(&mut driver, 1);
        accept(&mut driver, 2);
        send(&mut driver, 1, join_message("budget"));

        let actions = driver.process_event(ServerEvent::Shutdown).unwrap();
        let closed: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ServerAction::ClosePeer { peer, .. } => Some(*peer),
                _ => None,
            })
            .collect();

        assert_eq!(closed, vec![1, 2]);
        assert_eq!(driver.session_count(), 0);
        assert_eq!(driver.connection_count(), 0);
    }

    #[test]
    fn connection_accepted_after_shutdown_is_closed() {
        let mut driver = driver_with_document();
        accept(&mut driver, 1);
        driver.process_event(ServerEvent::Shutdown).unwrap();
        assert!(driver.is_shutting_down());

        let actions = accept(&mut driver, 2);
        assert_eq!(actions, vec![ServerAction::ClosePeer {
            peer: 2,
            reason: "server shutting down".to_string()
        }]);
        assert_eq!(driver.connection_count(), 0);

        // Its disconnect is a no-op
        let actions = driver
            .process_event(ServerEvent::ConnectionClosed { peer: 2, reason: "closed by server".into() })
            .unwrap();
        assert!(actions.is_empty());
    }
}
