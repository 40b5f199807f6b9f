//! Fuzz target for the server driver under arbitrary request sequences
//!
//! Prevent session state corruption from hostile or confused clients
//!
//! # Strategy
//!
//! - Peers: up to 4 connections that come and go
//! - Requests: every request kind with valid, stale, and garbage versions
//! - Passwords: right and wrong
//! - Store: in-memory, optionally wrapped to fail a share of operations
//!
//! # Invariants
//!
//! - Every request from a connected peer gets exactly one reply, except LEAVE
//! - A session's version never decreases while it is live
//! - UPDATE broadcasts never include the sender
//! - A LEAVE never leaves the named document with an empty session
//! - Shutdown closes every connection and leaves no session

#![no_main]

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use gridsync_proto::{Command, Message, keys};
use gridsync_server::{
    DocumentStore, DriverConfig, PeerInfo, ServerAction, ServerDriver, ServerEvent,
    storage::{ChaoticStore, MemoryStore},
};
use libfuzzer_sys::fuzz_target;

const DOCUMENTS: [&str; 2] = ["alpha", "beta"];

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    seed: u64,
    chaotic: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Connect { peer: u8 },
    Disconnect { peer: u8 },
    Request { peer: u8, document: bool, request: Request },
}

#[derive(Debug, Clone, Arbitrary)]
enum Request {
    Create { right_password: bool },
    Join { right_password: bool },
    Change { version: VersionChoice, cell: u8, text: String },
    Undo { version: VersionChoice },
    Save,
    Leave,
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionChoice {
    Current,
    Offset(i8),
    Garbage(String),
}

fn version_text(choice: &VersionChoice, current: u64) -> String {
    match choice {
        VersionChoice::Current => current.to_string(),
        VersionChoice::Offset(delta) => current.saturating_add_signed(i64::from(*delta)).to_string(),
        VersionChoice::Garbage(text) => text.clone(),
    }
}

fn build(name: &str, request: &Request, current: u64) -> Message {
    let base = |command| Message::new(command).with(keys::NAME, name);
    let password = |right: bool| if right { "pw" } else { "nope" };

    match request {
        Request::Create { right_password } => {
            base(Command::Create).with(keys::PASSWORD, password(*right_password))
        },
        Request::Join { right_password } => {
            base(Command::Join).with(keys::PASSWORD, password(*right_password))
        },
        Request::Change { version, cell, text } => base(Command::Change)
            .with(keys::VERSION, version_text(version, current))
            .with(keys::CELL, format!("A{}", cell % 8))
            .with(keys::LENGTH, text.len().to_string())
            .with(keys::CONTENT, text.as_str()),
        Request::Undo { version } => {
            base(Command::Undo).with(keys::VERSION, version_text(version, current))
        },
        Request::Save => base(Command::Save),
        Request::Leave => base(Command::Leave),
    }
}

fn run<S: DocumentStore>(store: S, steps: &[Step]) {
    let mut driver = ServerDriver::new(store, DriverConfig::default());
    let mut connected: HashSet<u64> = HashSet::new();
    let mut versions: HashMap<&str, u64> = HashMap::new();

    for step in steps.iter().take(256) {
        match step {
            Step::Connect { peer } => {
                let peer = u64::from(peer % 4);
                let result = driver
                    .process_event(ServerEvent::ConnectionAccepted { peer, info: PeerInfo::default() });
                assert_eq!(result.is_ok(), connected.insert(peer));
            },
            Step::Disconnect { peer } => {
                let peer = u64::from(peer % 4);
                connected.remove(&peer);
                let result = driver
                    .process_event(ServerEvent::ConnectionClosed { peer, reason: "fuzz".to_string() });
                assert!(result.is_ok());
            },
            Step::Request { peer, document, request } => {
                let peer = u64::from(peer % 4);
                let name = DOCUMENTS[usize::from(*document)];
                let current = driver.session_version(name).unwrap_or(0);
                let message = build(name, request, current);

                let result = driver.process_event(ServerEvent::MessageReceived { peer, message });
                let Ok(actions) = result else {
                    assert!(!connected.contains(&peer));
                    continue;
                };

                let replies = actions
                    .iter()
                    .filter(|a| matches!(a, ServerAction::SendToPeer { peer: p, .. } if *p == peer))
                    .count();
                let expected = usize::from(!matches!(request, Request::Leave));
                assert_eq!(replies, expected);

                for action in &actions {
                    if let ServerAction::Broadcast { peers, message } = action {
                        assert_eq!(message.command(), Command::Update);
                        assert!(!peers.contains(&peer));
                    }
                }
            },
        }

        for name in DOCUMENTS {
            match driver.session_version(name) {
                Some(version) => {
                    let previous = versions.insert(name, version).unwrap_or(0);
                    assert!(version >= previous, "version went backwards");
                },
                None => {
                    versions.remove(name);
                },
            }
        }

        if let Step::Request { document, request: Request::Leave, .. } = step {
            let name = DOCUMENTS[usize::from(*document)];
            if driver.session_version(name).is_some() {
                assert!(driver.peers_in_document(name).next().is_some(), "empty session after LEAVE");
            }
        }
    }

    let actions = driver.process_event(ServerEvent::Shutdown);
    assert!(actions.is_ok());
    assert_eq!(driver.session_count(), 0);
    assert_eq!(driver.connection_count(), 0);
}

fuzz_target!(|scenario: Scenario| {
    if scenario.chaotic {
        run(ChaoticStore::with_seed(MemoryStore::new(), 0.3, scenario.seed), &scenario.steps);
    } else {
        run(MemoryStore::new(), &scenario.steps);
    }
});
