//! # duplex-core
//!
//! Shared vocabulary for request/response exchanges carried over a single
//! persistent, message-oriented connection:
//!
//! - **Messages**: [`Request`], [`Response`] and the decoded [`Message`] envelope
//! - **Codec**: the [`MessageCodec`] seam plus the default [`JsonCodec`]
//! - **Close codes**: [`CloseCode`] values shared with the peer
//! - **Errors**: decode/encode failures and outbound request failures
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod logging;
pub mod messages;

pub use codec::{JsonCodec, MessageCodec};
pub use errors::{CloseCode, DecodeError, EncodeError, RequestError};
pub use messages::{Headers, Message, Request, Response};
