//! Gridsync collaborative spreadsheet server.
//!
//! Clients connect over TCP, join named documents, and edit cells under
//! optimistic version control. Every accepted edit is broadcast to the other
//! members of the document's session and can be undone until the next save.
//!
//! # Architecture
//!
//! [`ServerDriver`] is Sans-IO: it consumes [`ServerEvent`]s and returns
//! [`ServerAction`]s. [`Server`] is the tokio runtime around it: one read task
//! per connection owning that connection's [`Decoder`], one writer task per
//! connection draining an unbounded outbound queue, and a single lock around
//! the driver so session mutations are serialized.
//!
//! # Components
//!
//! - [`ServerDriver`]: event → action orchestrator (pure logic, no I/O)
//! - [`Dispatcher`]: document name → [`Session`] routing
//! - [`Session`]: per-document membership, version, and undo state
//! - [`ConnectionRegistry`]: peer → joined documents index
//! - [`storage`]: [`DocumentStore`] trait and its backends
//! - [`Server`]: TCP runtime that executes driver actions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dispatcher;
mod driver;
mod error;
mod registry;
mod session;
pub mod storage;

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
pub use dispatcher::{
    ALREADY_EXISTS, BAD_PASSWORD, Dispatcher, NO_DOCUMENT, NO_SESSION, RouteAction,
};
pub use driver::{DriverConfig, LogLevel, ServerAction, ServerDriver, ServerEvent};
pub use error::{DriverError, ServerError};
use gridsync_proto::{DecodeEvent, Decoder, DecoderConfig};
pub use registry::{ConnectionRegistry, PeerId, PeerInfo};
pub use session::{NOT_MEMBER, Session, SessionAction};
pub use storage::{ChaoticStore, Document, DocumentStore, MemoryStore, RedbStore, StoreError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, Notify, RwLock, mpsc},
    task::JoinSet,
};

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:2112")
    pub bind_address: String,
    /// Per-connection decoder limits
    pub decoder: DecoderConfig,
    /// Driver configuration (limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2112".to_string(),
            decoder: DecoderConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

/// Item on a connection's outbound queue.
#[derive(Debug)]
enum Outbound {
    /// Encoded message
    Frame(Bytes),
    /// Flush what is queued, then close the connection
    Close,
}

/// Shared state for all connections.
struct SharedState {
    /// Peer ID → outbound queue. Sends never block the caller.
    outbound: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Outbound>>>,
    next_peer: AtomicU64,
}

impl SharedState {
    fn allocate_peer(&self) -> PeerId {
        self.next_peer.fetch_add(1, Ordering::Relaxed)
    }
}

/// Production gridsync server.
///
/// Wraps [`ServerDriver`] with a tokio TCP listener.
pub struct Server<S: DocumentStore> {
    driver: ServerDriver<S>,
    listener: TcpListener,
    decoder: DecoderConfig,
}

impl<S: DocumentStore> Server<S> {
    /// Create and bind a new server over `store`.
    pub async fn bind(config: ServerRuntimeConfig, store: S) -> Result<Self, ServerError> {
        let driver = ServerDriver::new(store, config.driver);

        let documents = driver.stored_documents()?;
        tracing::info!(documents = documents.len(), "document store ready");

        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            ServerError::Transport(format!("failed to bind {}: {e}", config.bind_address))
        })?;

        Ok(Self { driver, listener, decoder: config.decoder })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until the process is killed.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` completes, then drain.
    ///
    /// Draining stops accepting, saves and closes every session, closes every
    /// connection, and waits for the connection tasks to finish.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.listener.local_addr()?);

        let Self { driver, listener, decoder } = self;
        let driver = Arc::new(Mutex::new(driver));
        let shared = Arc::new(SharedState {
            outbound: RwLock::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        });
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let peer = shared.allocate_peer();
                        let driver = Arc::clone(&driver);
                        let shared = Arc::clone(&shared);

                        connections.spawn(async move {
                            if let Err(e) =
                                handle_connection(peer, stream, addr, driver, shared, decoder).await
                            {
                                tracing::error!(peer, error = %e, "connection error");
                            }
                        });
                    },
                    Err(e) => tracing::error!(error = %e, "accept error"),
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {},
            }
        }

        tracing::info!("shutting down");
        drop(listener);
        {
            let mut driver = driver.lock().await;
            let actions = driver.process_event(ServerEvent::Shutdown)?;
            execute_actions(actions, &shared).await;
        }

        while connections.join_next().await.is_some() {}
        tracing::info!("shutdown complete");

        Ok(())
    }
}

/// Serve one TCP connection until either side closes it.
async fn handle_connection<S: DocumentStore>(
    peer: PeerId,
    stream: TcpStream,
    addr: SocketAddr,
    driver: Arc<Mutex<ServerDriver<S>>>,
    shared: Arc<SharedState>,
    decoder: DecoderConfig,
) -> Result<(), ServerError> {
    tracing::debug!(peer, %addr, "new connection");

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer, error = %e, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Notify::new());

    shared.outbound.write().await.insert(peer, tx);
    let writer_task = tokio::spawn(write_loop(peer, writer, rx, Arc::clone(&closed)));

    {
        let mut driver = driver.lock().await;
        let actions = driver
            .process_event(ServerEvent::ConnectionAccepted { peer, info: PeerInfo::with_addr(addr) })?;
        execute_actions(actions, &shared).await;
    }

    let reason = read_loop(peer, reader, &driver, &shared, &closed, decoder).await;

    shared.outbound.write().await.remove(&peer);

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(ServerEvent::ConnectionClosed { peer, reason })?;
        execute_actions(actions, &shared).await;
    }

    if let Err(e) = writer_task.await {
        tracing::warn!(peer, error = %e, "writer task failed");
    }

    Ok(())
}

/// Decode inbound bytes and feed the driver. Returns the close reason.
async fn read_loop<S: DocumentStore>(
    peer: PeerId,
    mut reader: OwnedReadHalf,
    driver: &Mutex<ServerDriver<S>>,
    shared: &SharedState,
    closed: &Notify,
    config: DecoderConfig,
) -> String {
    let mut decoder = Decoder::new(config);
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        buf.clear();
        tokio::select! {
            () = closed.notified() => return "closed by server".to_string(),

            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => return "connection closed by peer".to_string(),
                Ok(_) => {
                    let events = decoder.decode(&buf);
                    if events.is_empty() {
                        continue;
                    }

                    let mut driver = driver.lock().await;
                    for event in events {
                        let event = match event {
                            DecodeEvent::Message(message) => {
                                ServerEvent::MessageReceived { peer, message }
                            },
                            DecodeEvent::Malformed(error) => {
                                ServerEvent::MalformedInput { peer, error }
                            },
                        };

                        match driver.process_event(event) {
                            Ok(actions) => execute_actions(actions, shared).await,
                            Err(e) => tracing::warn!(peer, error = %e, "event processing error"),
                        }
                    }
                },
                Err(e) => return format!("read error: {e}"),
            },
        }
    }
}

/// Drain a connection's outbound queue onto the socket.
async fn write_loop(
    peer: PeerId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closed: Arc<Notify>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!(peer, error = %e, "write failed");
                    break;
                }
            },
            Outbound::Close => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(peer, error = %e, "shutdown failed");
    }
    closed.notify_one();
}

/// Execute server actions.
///
/// Each message is encoded once; broadcasts queue a clone of the same buffer
/// per recipient.
async fn execute_actions(actions: Vec<ServerAction>, shared: &SharedState) {
    if actions.is_empty() {
        return;
    }
    let outbound = shared.outbound.read().await;

    for action in actions {
        match action {
            ServerAction::SendToPeer { peer, message } => {
                tracing::trace!(peer, command = %message.command(), "send");
                match outbound.get(&peer) {
                    Some(tx) => {
                        if tx.send(Outbound::Frame(message.to_bytes())).is_err() {
                            tracing::debug!(peer, "send to closed connection");
                        }
                    },
                    None => tracing::warn!(peer, "SendToPeer: peer not found"),
                }
            },

            ServerAction::Broadcast { peers, message } => {
                tracing::trace!(recipients = peers.len(), command = %message.command(), "broadcast");
                let bytes = message.to_bytes();
                for peer in peers {
                    if let Some(tx) = outbound.get(&peer) {
                        if tx.send(Outbound::Frame(bytes.clone())).is_err() {
                            tracing::debug!(peer, "broadcast to closed connection");
                        }
                    }
                }
            },

            ServerAction::ClosePeer { peer, reason } => {
                tracing::info!(peer, %reason, "closing connection");
                if let Some(tx) = outbound.get(&peer) {
                    if tx.send(Outbound::Close).is_err() {
                        tracing::debug!(peer, "close of closed connection");
                    }
                }
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
