//! Close codes and error types shared by both ends of a connection.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// CloseCode
// ─────────────────────────────────────────────────────────────────────────────

/// `WebSocket` close status code.
///
/// The codes this layer emits are part of the wire contract with the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure.
    pub const NORMAL: Self = Self(1000);
    /// Endpoint going away: idle timeout or server shutdown.
    pub const GOING_AWAY: Self = Self(1001);
    /// Close frame carried no status code. Never sent on the wire.
    pub const NO_STATUS: Self = Self(1005);
    /// Connection dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: Self = Self(1006);
    /// Internal error: authentication failure, unexpected exception, transport error.
    pub const SERVER_ERROR: Self = Self(1011);
    /// Payload could not be decoded, or was of an unknown kind.
    pub const BADLY_FORMATTED: Self = Self(1018);

    /// Longest close reason a close frame can carry, in bytes.
    pub const MAX_REASON_LEN: usize = 123;

    /// The numeric code.
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Reason text sent alongside this code by this layer.
    pub fn default_reason(self) -> &'static str {
        match self {
            Self::NORMAL => "Normal closure",
            Self::GOING_AWAY => "Going away",
            Self::NO_STATUS => "No status",
            Self::ABNORMAL => "Disconnected",
            Self::SERVER_ERROR => "Server error",
            Self::BADLY_FORMATTED => "Badly formatted",
            _ => "",
        }
    }

    /// Whether this code may be put in a close frame.
    ///
    /// 1004 is unassigned; 1005, 1006 and 1015 only report what happened locally.
    pub fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 1016..=4999)
    }

    /// `reason` cut to fit a close frame, on a char boundary.
    pub fn truncate_reason(reason: &str) -> &str {
        if reason.len() <= Self::MAX_REASON_LEN {
            return reason;
        }
        let mut end = Self::MAX_REASON_LEN;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        &reason[..end]
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec errors
// ─────────────────────────────────────────────────────────────────────────────

/// Inbound payload could not be turned into a [`Message`](crate::Message).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload is not a valid envelope.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A body field was not valid base64.
    #[error("invalid body encoding: {0}")]
    Body(#[from] base64::DecodeError),
}

/// Outbound message could not be serialized.
#[derive(Debug, Error)]
#[error("failed to encode message: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

// ─────────────────────────────────────────────────────────────────────────────
// RequestError
// ─────────────────────────────────────────────────────────────────────────────

/// Why an outbound request did not produce a response.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The connection closed before the peer answered, or was already closed.
    #[error("Connection closed!")]
    ConnectionClosed,

    /// The request could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// No response arrived within the caller's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The pending entry was removed without a response.
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    /// Whether the failure was caused by the connection going away.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
