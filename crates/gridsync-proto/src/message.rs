//! Protocol messages and their wire encoding.
//!
//! A [`Message`] is a command plus an ordered list of `(key, value)` string
//! parameters. Keys are unique within a message and insertion order is the
//! emission order on the wire.
//!
//! # Wire format
//!
//! ```text
//! CHANGE OK\n          <- command keyword
//! Name:budget\n        <- header param (key starts with A-Z)
//! Version:4\n
//! ```
//!
//! Parameters whose key does not start with an upper-case ASCII letter are
//! blob-style (`content`, `contents`, `xml`, `message`) and are written as the
//! bare value. Every line, the command line included, ends with `\n`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Parameter keys used by the protocol.
pub mod keys {
    /// Document name
    pub const NAME: &str = "Name";
    /// Document password
    pub const PASSWORD: &str = "Password";
    /// Session version
    pub const VERSION: &str = "Version";
    /// Cell key
    pub const CELL: &str = "Cell";
    /// Byte length of the following blob
    pub const LENGTH: &str = "Length";
    /// Cell text in CHANGE requests and UPDATE broadcasts
    pub const CONTENT: &str = "content";
    /// Restored cell text in UNDO OK replies
    pub const CONTENTS: &str = "contents";
    /// Document snapshot in JOIN OK replies
    pub const XML: &str = "xml";
    /// Human-readable failure reason
    pub const MESSAGE: &str = "message";
}

/// Closed set of commands, requests (client to server) and replies (server to
/// client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Create a new document
    Create,
    /// Document created
    CreateOk,
    /// Document not created
    CreateFail,
    /// Join a document session
    Join,
    /// Joined; carries the snapshot
    JoinOk,
    /// Join refused
    JoinFail,
    /// Set one cell
    Change,
    /// Change applied
    ChangeOk,
    /// Change rejected: stale version
    ChangeWait,
    /// Change refused
    ChangeFail,
    /// Revert the most recent unsaved change
    Undo,
    /// Undo applied
    UndoOk,
    /// Nothing left to undo
    UndoEnd,
    /// Undo rejected: stale version
    UndoWait,
    /// Undo refused
    UndoFail,
    /// Another member changed a cell
    Update,
    /// Persist the document
    Save,
    /// Document persisted
    SaveOk,
    /// Document not persisted
    SaveFail,
    /// Leave a document session
    Leave,
    /// Malformed input
    Error,
}

impl Command {
    /// The six request commands a client may send.
    pub const REQUESTS: [Self; 6] =
        [Self::Create, Self::Join, Self::Change, Self::Save, Self::Undo, Self::Leave];

    /// Keyword written on the command line.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::CreateOk => "CREATE OK",
            Self::CreateFail => "CREATE FAIL",
            Self::Join => "JOIN",
            Self::JoinOk => "JOIN OK",
            Self::JoinFail => "JOIN FAIL",
            Self::Change => "CHANGE",
            Self::ChangeOk => "CHANGE OK",
            Self::ChangeWait => "CHANGE WAIT",
            Self::ChangeFail => "CHANGE FAIL",
            Self::Undo => "UNDO",
            Self::UndoOk => "UNDO OK",
            Self::UndoEnd => "UNDO END",
            Self::UndoWait => "UNDO WAIT",
            Self::UndoFail => "UNDO FAIL",
            Self::Update => "UPDATE",
            Self::Save => "SAVE",
            Self::SaveOk => "SAVE OK",
            Self::SaveFail => "SAVE FAIL",
            Self::Leave => "LEAVE",
            Self::Error => "ERROR",
        }
    }

    /// Match a line against the request keywords. Reply keywords never match.
    pub fn from_request_keyword(line: &str) -> Option<Self> {
        Self::REQUESTS.into_iter().find(|cmd| cmd.keyword() == line)
    }

    /// Whether this is a client request.
    pub fn is_request(self) -> bool {
        Self::REQUESTS.contains(&self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: Command,
    params: Vec<(String, String)>,
}

impl Message {
    /// Create a message with no parameters.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, params: Vec::new() }
    }

    /// Bare `ERROR` message.
    #[must_use]
    pub fn error() -> Self {
        Self::new(Command::Error)
    }

    /// Builder form of [`Message::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a parameter. An existing key keeps its position and gets the new
    /// value; a new key is appended.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
    }

    /// The message command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Value of a parameter. `None` if absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Parameters in emission order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Encode into the wire format.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(self.command.keyword().as_bytes());
        dst.put_u8(b'\n');

        for (key, value) in &self.params {
            if key.starts_with(|c: char| c.is_ascii_uppercase()) {
                dst.put_slice(key.as_bytes());
                dst.put_u8(b':');
            }
            dst.put_slice(value.as_bytes());
            dst.put_u8(b'\n');
        }
    }

    /// Exact size of the encoded message in bytes.
    pub fn encoded_len(&self) -> usize {
        let params: usize = self
            .params
            .iter()
            .map(|(key, value)| {
                let header = if key.starts_with(|c: char| c.is_ascii_uppercase()) {
                    key.len() + 1
                } else {
                    0
                };
                header + value.len() + 1
            })
            .sum();
        self.command.keyword().len() + 1 + params
    }

    /// Encode into a frozen buffer, ready to be shared between recipients.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf.freeze()
    }
}
