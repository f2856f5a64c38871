// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy of the capability transport.

use std::io;

/// Everything that can go wrong above the platform layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rendezvous mismatch or timeout; the connection was never established.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A worker died or a region vanished; the connection is unusable.
    #[error("channel closed")]
    ChannelClosed,

    /// Payload exceeds the region capacity; nothing was sent.
    #[error("frame payload of {size} bytes exceeds region capacity of {capacity} bytes")]
    FrameTooLarge { size: usize, capacity: usize },

    /// No matching reply before the deadline. A late reply is still cached.
    #[error("timed out waiting for reply to request {sequence}")]
    Timeout { sequence: u32 },

    #[error("unknown capability `{0}`")]
    UnknownCapability(String),

    #[error("capability `{0}` was unregistered")]
    CapabilityDropped(String),

    #[error("capability `{capability}` has no method `{method}`")]
    UnknownMethod { capability: String, method: String },

    /// Argument failed structural validation; nothing was sent.
    #[error("argument `{argument}` of `{method}`: {reason}")]
    TypeMismatch {
        method: String,
        argument: String,
        reason: String,
    },

    /// Failure reported by the daemon inside a reply.
    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("not connected")]
    NotConnected,

    /// Undecodable frame or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the connection that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::HandshakeFailed(_) | Error::ChannelClosed)
    }

    pub(crate) fn handshake(msg: impl Into<String>) -> Self {
        Error::HandshakeFailed(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_handshake_and_closed_are_fatal() {
        assert!(Error::ChannelClosed.is_fatal());
        assert!(Error::handshake("x").is_fatal());
        assert!(!Error::Timeout { sequence: 1 }.is_fatal());
        assert!(!Error::FrameTooLarge { size: 2, capacity: 1 }.is_fatal());
        assert!(!Error::RemoteError("boom".into()).is_fatal());
    }

    #[test]
    fn messages_name_the_offender() {
        let e = Error::TypeMismatch {
            method: "move".into(),
            argument: "x".into(),
            reason: "expected Number".into(),
        };
        assert_eq!(e.to_string(), "argument `x` of `move`: expected Number");
    }
}
