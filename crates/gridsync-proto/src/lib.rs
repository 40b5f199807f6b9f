//! Gridsync wire protocol.
//!
//! Clients and the server exchange line-oriented messages over a byte stream.
//! Each message starts with a command keyword line, followed by `Key:Value`
//! header lines and, for cell contents, a length-prefixed blob.
//!
//! This crate is Sans-IO: [`Decoder`] consumes arbitrary byte chunks and
//! produces [`DecodeEvent`]s, and [`Message::encode`] writes into any
//! [`bytes::BufMut`]. Sockets live in the server.

#![forbid(unsafe_code)]

pub mod decoder;
pub mod errors;
pub mod message;

pub use decoder::{DecodeEvent, Decoder, DecoderConfig, Expecting};
pub use errors::{DecodeError, Result};
pub use message::{Command, Message, keys};
