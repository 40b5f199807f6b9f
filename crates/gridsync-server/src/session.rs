//! Per-document session state machine.
//!
//! A [`Session`] is the live coordination state for one open document: the
//! working copy, the member set, the version counter, and the undo stack.
//! Every operation produces exactly one reply for the requester and, for
//! accepted mutations, one UPDATE broadcast for the other members.
//!
//! # Invariants
//!
//! - `version` starts at 0 and grows by exactly 1 per accepted change or undo.
//!   It is never decremented while the session is live.
//! - A rejected request (not a member, stale version) leaves the document,
//!   version and undo stack untouched.
//! - The undo stack holds one entry per accepted change since the last save.
//!   Undo pops the most recent entry; there is no redo.

use std::collections::HashSet;

use gridsync_proto::{Command, Message, keys};

use crate::{
    registry::PeerId,
    storage::{Document, DocumentStore, StoreError, normalize_cell_key},
};

/// Reply text for requests from peers that have not joined.
pub const NOT_MEMBER: &str = "Client not member of spreadsheet session";

/// Output of a session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Reply to the requesting peer
    Reply(Message),

    /// Deliver to other members of the session
    Broadcast {
        /// Members receiving the message; never includes the requester
        recipients: Vec<PeerId>,
        /// Message to deliver
        message: Message,
    },

    /// Persisting the document failed
    StoreFailed {
        /// Document that failed to persist
        document: String,
        /// Store error
        error: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UndoEntry {
    cell: String,
    prior_text: String,
}

/// Live state for one open document.
#[derive(Debug)]
pub struct Session {
    document: Document,
    version: u64,
    /// Cached at open; a later password change in the store does not apply
    password: String,
    members: HashSet<PeerId>,
    undo_history: Vec<UndoEntry>,
}

impl Session {
    /// Open a session over a loaded document. Version starts at 0.
    pub fn open(document: Document) -> Self {
        let password = document.password().to_string();
        Self { document, version: 0, password, members: HashSet::new(), undo_history: Vec::new() }
    }

    /// Document name.
    pub fn name(&self) -> &str {
        self.document.name()
    }

    /// Current session version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Working copy of the document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Check if a peer has joined.
    pub fn is_member(&self, peer: PeerId) -> bool {
        self.members.contains(&peer)
    }

    /// Current members, in no particular order.
    pub fn members(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.members.iter().copied()
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// No members left.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of changes that can still be undone.
    pub fn undo_depth(&self) -> usize {
        self.undo_history.len()
    }

    /// Add `peer` as a member if `password` matches.
    pub fn admit(&mut self, peer: PeerId, password: &str) -> bool {
        if password != self.password {
            return false;
        }
        self.members.insert(peer);
        true
    }

    /// Remove `peer` from the member set. Returns whether it was a member.
    pub fn drop_peer(&mut self, peer: PeerId) -> bool {
        self.members.remove(&peer)
    }

    /// JOIN OK reply carrying the current snapshot.
    pub fn describe_for_join(&self) -> Message {
        let snapshot = self.document.render_snapshot();
        Message::new(Command::JoinOk)
            .with(keys::NAME, self.name())
            .with(keys::VERSION, self.version.to_string())
            .with(keys::LENGTH, snapshot.len().to_string())
            .with(keys::XML, snapshot)
    }

    /// Set one cell, gated on membership and version.
    pub fn change(
        &mut self,
        peer: PeerId,
        version: &str,
        cell: &str,
        text: &str,
    ) -> Vec<SessionAction> {
        if !self.is_member(peer) {
            return vec![self.failure(Command::ChangeFail, NOT_MEMBER)];
        }
        if !self.version_matches(version) {
            return vec![SessionAction::Reply(self.versioned(Command::ChangeWait))];
        }

        let cell = normalize_cell_key(cell);
        let prior_text = self.document.cell(&cell).to_string();
        self.undo_history.push(UndoEntry { cell: cell.clone(), prior_text });
        self.document.set_cell(&cell, text);
        self.version += 1;

        vec![
            SessionAction::Reply(self.versioned(Command::ChangeOk)),
            self.broadcast_update(peer, &cell, text),
        ]
    }

    /// Revert the most recent unsaved change, gated like [`Session::change`].
    pub fn undo(&mut self, peer: PeerId, version: &str) -> Vec<SessionAction> {
        if !self.is_member(peer) {
            return vec![self.failure(Command::UndoFail, NOT_MEMBER)];
        }
        if !self.version_matches(version) {
            return vec![SessionAction::Reply(self.versioned(Command::UndoWait))];
        }

        let Some(UndoEntry { cell, prior_text }) = self.undo_history.pop() else {
            return vec![SessionAction::Reply(self.versioned(Command::UndoEnd))];
        };

        self.document.set_cell(&cell, prior_text.as_str());
        self.version += 1;

        let reply = Message::new(Command::UndoOk)
            .with(keys::NAME, self.name())
            .with(keys::VERSION, self.version.to_string())
            .with(keys::CELL, cell.as_str())
            .with(keys::LENGTH, prior_text.len().to_string())
            .with(keys::CONTENTS, prior_text.as_str());

        vec![SessionAction::Reply(reply), self.broadcast_update(peer, &cell, &prior_text)]
    }

    /// Persist the document and clear the undo stack.
    ///
    /// On store failure the undo stack is kept and the requester gets
    /// SAVE FAIL carrying the store error.
    pub fn save(&mut self, peer: PeerId, store: &impl DocumentStore) -> Vec<SessionAction> {
        if !self.is_member(peer) {
            return vec![self.failure(Command::SaveFail, NOT_MEMBER)];
        }

        match store.save(&self.document) {
            Ok(()) => {
                self.undo_history.clear();
                vec![SessionAction::Reply(Message::new(Command::SaveOk).with(keys::NAME, self.name()))]
            },
            Err(error) => vec![
                self.failure(Command::SaveFail, &error.to_string()),
                SessionAction::StoreFailed { document: self.name().to_string(), error },
            ],
        }
    }

    /// Persist and release the document.
    pub fn close(self, store: &impl DocumentStore) -> Result<(), StoreError> {
        store.save(&self.document)
    }

    fn version_matches(&self, supplied: &str) -> bool {
        supplied.parse::<u64>().is_ok_and(|v| v == self.version)
    }

    fn versioned(&self, command: Command) -> Message {
        Message::new(command)
            .with(keys::NAME, self.name())
            .with(keys::VERSION, self.version.to_string())
    }

    fn failure(&self, command: Command, reason: &str) -> SessionAction {
        SessionAction::Reply(
            Message::new(command).with(keys::NAME, self.name()).with(keys::MESSAGE, reason),
        )
    }

    fn broadcast_update(&self, sender: PeerId, cell: &str, text: &str) -> SessionAction {
        let message = Message::new(Command::Update)
            .with(keys::NAME, self.name())
            .with(keys::VERSION, self.version.to_string())
            .with(keys::CELL, cell)
            .with(keys::LENGTH, text.len().to_string())
            .with(keys::CONTENT, text);

        let mut recipients: Vec<PeerId> =
            self.members.iter().copied().filter(|p| *p != sender).collect();
        recipients.sort_unstable();

        SessionAction::Broadcast { recipients, message }
    }
}
