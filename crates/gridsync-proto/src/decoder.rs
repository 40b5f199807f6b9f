//! Incremental decoder for the inbound byte stream.
//!
//! Bytes arrive in arbitrary chunks. The decoder assembles lines, matches each
//! line against the token it currently expects, and emits a [`DecodeEvent`]
//! for every completed message or protocol violation. The output depends only
//! on the concatenated input, never on how it was split into chunks.
//!
//! # State machine
//!
//! Each request kind has a fixed token sequence:
//!
//! ```text
//! CREATE / JOIN : Name, Password
//! SAVE / LEAVE  : Name
//! UNDO          : Name, Version
//! CHANGE        : Name, Version, Cell, Length, <blob>
//! ```
//!
//! Lines end in `\n`; a `\r` directly before the `\n` is dropped, even when the
//! two bytes arrive in different chunks. The blob is counted in raw bytes and
//! is never CR-stripped. The message completes as soon as the blob reaches its
//! announced length, and one line terminator following the blob is consumed.
//!
//! On any violation the partial message is abandoned, a
//! [`DecodeEvent::Malformed`] is emitted, and the decoder goes back to waiting
//! for a command line.

use crate::{
    errors::DecodeError,
    message::{Command, Message, keys},
};

/// Limits applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Longest line accepted, terminator excluded
    pub max_line_len: usize,
    /// Largest `Length:` value accepted
    pub max_blob_len: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { max_line_len: 64 * 1024, max_blob_len: 16 * 1024 * 1024 }
    }
}

/// Output of the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// A complete, well-formed request
    Message(Message),
    /// A protocol violation. The caller answers with `ERROR`.
    Malformed(DecodeError),
}

/// Token the decoder is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expecting {
    /// A request keyword line
    Command,
    /// `Name:` line
    Name,
    /// `Password:` line
    Password,
    /// `Version:` line
    Version,
    /// `Cell:` line
    Cell,
    /// `Length:` line
    Length,
    /// Raw blob bytes
    Blob,
}

impl Expecting {
    /// Line prefix for header tokens.
    fn delimiter(self) -> &'static str {
        match self {
            Self::Name => "Name:",
            Self::Password => "Password:",
            Self::Version => "Version:",
            Self::Cell => "Cell:",
            Self::Length => "Length:",
            Self::Command | Self::Blob => "",
        }
    }

    /// Message parameter the token is stored under.
    fn key(self) -> &'static str {
        match self {
            Self::Name => keys::NAME,
            Self::Password => keys::PASSWORD,
            Self::Version => keys::VERSION,
            Self::Cell => keys::CELL,
            Self::Length => keys::LENGTH,
            Self::Blob => keys::CONTENT,
            Self::Command => "",
        }
    }
}

/// Token sequence following the command line of a request.
fn token_sequence(command: Command) -> &'static [Expecting] {
    use Expecting::{Blob, Cell, Length, Name, Password, Version};

    match command {
        Command::Create | Command::Join => &[Name, Password],
        Command::Save | Command::Leave => &[Name],
        Command::Undo => &[Name, Version],
        Command::Change => &[Name, Version, Cell, Length, Blob],
        _ => &[],
    }
}

/// Token expected after `current` for a message of kind `command`. `None`
/// means the message is complete.
fn next_token(command: Command, current: Expecting) -> Option<Expecting> {
    let sequence = token_sequence(command);
    let position = sequence.iter().position(|t| *t == current)?;
    sequence.get(position + 1).copied()
}

/// Per-connection stream decoder.
#[derive(Debug)]
pub struct Decoder {
    config: DecoderConfig,
    expecting: Expecting,
    /// Message under construction. `Some` whenever `expecting != Command`.
    pending: Option<Message>,
    /// Current line, or blob bytes while `expecting == Blob`
    buf: Vec<u8>,
    blob_len: usize,
    /// A `\r` was seen and not yet resolved
    pending_cr: bool,
    /// Dropping an overlong line until its terminator
    discarding: bool,
    /// A blob just completed; an immediately following empty line is its
    /// terminator
    after_blob: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl Decoder {
    /// Create a decoder waiting for a command line.
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            expecting: Expecting::Command,
            pending: None,
            buf: Vec::new(),
            blob_len: 0,
            pending_cr: false,
            discarding: false,
            after_blob: false,
        }
    }

    /// Token currently expected.
    pub fn expecting(&self) -> Expecting {
        self.expecting
    }

    /// Bytes buffered for the current line or blob.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and collect the events it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        self.decode_into(chunk, &mut events);
        events
    }

    /// Feed a chunk, appending completed events to `out`.
    pub fn decode_into(&mut self, chunk: &[u8], out: &mut Vec<DecodeEvent>) {
        for &byte in chunk {
            self.push_byte(byte, out);
        }
    }

    fn push_byte(&mut self, byte: u8, out: &mut Vec<DecodeEvent>) {
        if self.expecting == Expecting::Blob {
            self.buf.push(byte);
            if self.buf.len() == self.blob_len {
                self.finish_blob(out);
            }
            return;
        }

        if self.pending_cr {
            self.pending_cr = false;
            if byte == b'\n' {
                self.end_of_line(out);
                return;
            }
            self.push_line_byte(b'\r', out);
        }

        match byte {
            b'\r' => self.pending_cr = true,
            b'\n' => self.end_of_line(out),
            _ => self.push_line_byte(byte, out),
        }
    }

    fn push_line_byte(&mut self, byte: u8, out: &mut Vec<DecodeEvent>) {
        self.after_blob = false;
        if self.discarding {
            return;
        }
        if self.buf.len() >= self.config.max_line_len {
            self.buf.clear();
            self.discarding = true;
            self.reject(DecodeError::LineTooLong { max: self.config.max_line_len }, out);
            return;
        }
        self.buf.push(byte);
    }

    fn end_of_line(&mut self, out: &mut Vec<DecodeEvent>) {
        if std::mem::take(&mut self.after_blob) && self.buf.is_empty() {
            return;
        }
        if std::mem::take(&mut self.discarding) {
            self.buf.clear();
            return;
        }

        let line = std::mem::take(&mut self.buf);
        match String::from_utf8(line) {
            Ok(line) => self.process_line(line, out),
            Err(_) => self.reject(DecodeError::InvalidUtf8, out),
        }
    }

    fn process_line(&mut self, line: String, out: &mut Vec<DecodeEvent>) {
        let token = self.expecting;
        if token == Expecting::Command {
            match Command::from_request_keyword(&line) {
                Some(command) => {
                    self.pending = Some(Message::new(command));
                    self.advance(command, token, out);
                },
                None => self.reject(DecodeError::UnknownCommand(line), out),
            }
            return;
        }

        let delimiter = token.delimiter();
        if line.len() < delimiter.len() {
            self.reject(DecodeError::LineTooShort { expected: delimiter }, out);
            return;
        }
        if !line.starts_with(delimiter) {
            self.reject(DecodeError::UnexpectedToken { expected: delimiter, found: line }, out);
            return;
        }
        let value = &line[delimiter.len()..];

        let Some(message) = self.pending.as_mut() else {
            self.reset();
            return;
        };
        message.set(token.key(), value);
        let command = message.command();
        self.advance(command, token, out);
    }

    /// Move past `current`, completing the message when the sequence ends.
    fn advance(&mut self, command: Command, current: Expecting, out: &mut Vec<DecodeEvent>) {
        let next = if current == Expecting::Command {
            token_sequence(command).first().copied()
        } else {
            next_token(command, current)
        };

        match next {
            Some(Expecting::Blob) => self.begin_blob(out),
            Some(token) => self.expecting = token,
            None => self.dispatch(out),
        }
    }

    fn begin_blob(&mut self, out: &mut Vec<DecodeEvent>) {
        let announced = self.pending.as_ref().and_then(|m| m.get(keys::LENGTH)).unwrap_or_default();
        let size = match announced.parse::<usize>() {
            Ok(size) => size,
            Err(_) => {
                let announced = announced.to_owned();
                self.reject(DecodeError::InvalidLength(announced), out);
                return;
            },
        };
        if size > self.config.max_blob_len {
            self.reject(DecodeError::BlobTooLarge { size, max: self.config.max_blob_len }, out);
            return;
        }

        self.expecting = Expecting::Blob;
        self.blob_len = size;
        self.buf.clear();
        if size == 0 {
            self.finish_blob(out);
        }
    }

    fn finish_blob(&mut self, out: &mut Vec<DecodeEvent>) {
        let blob = std::mem::take(&mut self.buf);
        self.after_blob = true;

        match String::from_utf8(blob) {
            Ok(content) => {
                if let Some(message) = self.pending.as_mut() {
                    message.set(keys::CONTENT, content);
                }
                self.dispatch(out);
            },
            Err(_) => self.reject(DecodeError::InvalidUtf8, out),
        }
    }

    fn dispatch(&mut self, out: &mut Vec<DecodeEvent>) {
        if let Some(message) = self.pending.take() {
            out.push(DecodeEvent::Message(message));
        }
        self.reset();
    }

    fn reject(&mut self, error: DecodeError, out: &mut Vec<DecodeEvent>) {
        out.push(DecodeEvent::Malformed(error));
        self.reset();
    }

    fn reset(&mut self) {
        self.pending = None;
        self.expecting = Expecting::Command;
        self.blob_len = 0;
        if !self.discarding {
            self.buf.clear();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn messages(events: &[DecodeEvent]) -> Vec<&Message> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Message(m) => Some(m),
                DecodeEvent::Malformed(_) => None,
            })
            .collect()
    }

    fn error_count(events: &[DecodeEvent]) -> usize {
        events.iter().filter(|e| matches!(e, DecodeEvent::Malformed(_))).count()
    }

    #[test]
    fn decodes_create() {
        let events = Decoder::default().decode(b"CREATE\nName:budget\nPassword:pw\n");

        assert_eq!(events.len(), 1);
        let msg = messages(&events)[0];
        assert_eq!(msg.command(), Command::Create);
        assert_eq!(msg.get(keys::NAME), Some("budget"));
        assert_eq!(msg.get(keys::PASSWORD), Some("pw"));
    }

    #[test]
    fn decodes_change_with_multiline_blob() {
        let input = b"CHANGE\nName:s\nVersion:0\nCell:a1\nLength:5\nx\ny\nz\n";
        let events = Decoder::default().decode(input);

        assert_eq!(events.len(), 1);
        let msg = messages(&events)[0];
        assert_eq!(msg.get(keys::CELL), Some("a1"));
        assert_eq!(msg.get(keys::LENGTH), Some("5"));
        assert_eq!(msg.get(keys::CONTENT), Some("x\ny\nz"));
    }

    #[test]
    fn blob_completes_before_terminator_arrives() {
        let mut decoder = Decoder::default();
        let events = decoder.decode(b"CHANGE\nName:s\nVersion:0\nCell:A1\nLength:2\nhi");
        assert_eq!(messages(&events).len(), 1);

        // The terminator is swallowed, not treated as an empty command line.
        let events = decoder.decode(b"\r\nSAVE\nName:s\n");
        assert_eq!(error_count(&events), 0);
        assert_eq!(messages(&events)[0].command(), Command::Save);
    }

    #[test]
    fn zero_length_blob_completes_immediately() {
        let mut decoder = Decoder::default();
        let events = decoder.decode(b"CHANGE\nName:s\nVersion:0\nCell:A1\nLength:0\n");

        assert_eq!(messages(&events)[0].get(keys::CONTENT), Some(""));
        assert!(decoder.decode(b"\n").is_empty());
    }

    #[test]
    fn blob_keeps_carriage_returns() {
        let input = b"CHANGE\nName:s\nVersion:0\nCell:A1\nLength:3\na\r\n\n";
        let events = Decoder::default().decode(input);
        assert_eq!(messages(&events)[0].get(keys::CONTENT), Some("a\r\n"));
    }

    #[test]
    fn crlf_lines_are_stripped_across_chunks() {
        let mut decoder = Decoder::default();
        let mut events = decoder.decode(b"SAVE\r");
        events.extend(decoder.decode(b"\nName:s\r"));
        events.extend(decoder.decode(b"\n"));

        assert_eq!(events.len(), 1);
        assert_eq!(messages(&events)[0].get(keys::NAME), Some("s"));
    }

    #[test]
    fn lone_carriage_return_is_kept() {
        let events = Decoder::default().decode(b"SAVE\nName:a\rb\n");
        assert_eq!(messages(&events)[0].get(keys::NAME), Some("a\rb"));
    }

    #[test]
    fn unknown_command_reports_and_resyncs() {
        let mut decoder = Decoder::default();
        let events = decoder.decode(b"HELLO\nLEAVE\nName:s\n");

        assert_eq!(
            events[0],
            DecodeEvent::Malformed(DecodeError::UnknownCommand("HELLO".to_owned()))
        );
        assert_eq!(messages(&events)[0].command(), Command::Leave);
    }

    #[test]
    fn empty_line_in_command_state_is_an_error() {
        let events = Decoder::default().decode(b"\n");
        assert_eq!(error_count(&events), 1);
    }

    #[test]
    fn wrong_delimiter_abandons_message() {
        let mut decoder = Decoder::default();
        let events = decoder.decode(b"JOIN\nName:s\nVersion:1\n");

        assert_eq!(error_count(&events), 1);
        assert_eq!(decoder.expecting(), Expecting::Command);
    }

    #[test]
    fn short_line_abandons_message() {
        let events = Decoder::default().decode(b"JOIN\nNa\n");
        assert_eq!(
            events,
            vec![DecodeEvent::Malformed(DecodeError::LineTooShort { expected: "Name:" })]
        );
    }

    #[test]
    fn command_keyword_mid_message_is_a_delimiter_mismatch() {
        let mut decoder = Decoder::default();
        let events = decoder.decode(b"CREATE\nCREATE\nName:x\nPassword:y\n");

        // The second CREATE is the unexpected token; the following lines then
        // fail to match a command keyword.
        assert!(messages(&events).is_empty());
        assert_eq!(error_count(&events), 3);
    }

    #[test]
    fn non_numeric_length_resyncs() {
        let mut decoder = Decoder::default();
        let events = decoder.decode(b"CHANGE\nName:s\nVersion:0\nCell:A1\nLength:abc\nSAVE\nName:s\n");

        assert_eq!(
            events[0],
            DecodeEvent::Malformed(DecodeError::InvalidLength("abc".to_owned()))
        );
        assert_eq!(messages(&events)[0].command(), Command::Save);
    }

    #[test]
    fn negative_length_is_invalid() {
        let events = Decoder::default().decode(b"CHANGE\nName:s\nVersion:0\nCell:A1\nLength:-1\n");
        assert_eq!(
            events,
            vec![DecodeEvent::Malformed(DecodeError::InvalidLength("-1".to_owned()))]
        );
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let config = DecoderConfig { max_line_len: 1024, max_blob_len: 4 };
        let events = Decoder::new(config).decode(b"CHANGE\nName:s\nVersion:0\nCell:A1\nLength:5\n");

        assert_eq!(
            events,
            vec![DecodeEvent::Malformed(DecodeError::BlobTooLarge { size: 5, max: 4 })]
        );
    }

    #[test]
    fn overlong_line_reports_once_and_discards() {
        let config = DecoderConfig { max_line_len: 8, max_blob_len: 1024 };
        let mut decoder = Decoder::new(config);

        let mut events = decoder.decode(b"SAVE\nName:abcdefghijkl");
        events.extend(decoder.decode(b"mnopqrstuvwxyz"));
        assert_eq!(events, vec![DecodeEvent::Malformed(DecodeError::LineTooLong { max: 8 })]);
        assert_eq!(decoder.buffered_len(), 0);

        let events = decoder.decode(b"\nSAVE\nName:ok\n");
        assert_eq!(events.len(), 1);
        assert_eq!(messages(&events)[0].get(keys::NAME), Some("ok"));
    }

    #[test]
    fn invalid_utf8_line_is_malformed() {
        let events = Decoder::default().decode(b"SAVE\nName:\xff\xfe\n");
        assert_eq!(events, vec![DecodeEvent::Malformed(DecodeError::InvalidUtf8)]);
    }

    #[test]
    fn reply_keywords_are_not_requests() {
        let events = Decoder::default().decode(b"SAVE OK\n");
        assert_eq!(error_count(&events), 1);
    }

    #[test]
    fn byte_at_a_time_matches_whole_input() {
        let input = b"CREATE\r\nName:a\r\nPassword:b\r\nCHANGE\nName:a\nVersion:0\nCell:B2\nLength:3\n1\r2\nUNDO\nName:a\nVersion:1\n";

        let whole = Decoder::default().decode(input);
        let mut decoder = Decoder::default();
        let split: Vec<_> = input.iter().flat_map(|b| decoder.decode(&[*b])).collect();

        assert_eq!(whole, split);
        assert_eq!(messages(&whole).len(), 3);
    }
}
