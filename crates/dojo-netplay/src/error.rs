//! Netplay error types.

use dojo_netproto::messages::session::{DisconnectReason, RejectReason};
use thiserror::Error;

use crate::replay::ReplayError;

#[derive(Error, Debug)]
pub enum NetplayError {
    /// Incompatible protocol, game or configuration. The session never opens.
    #[error("handshake mismatch: {0:?}")]
    HandshakeMismatch(RejectReason),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The link to the peer is gone and reconnection did not recover it.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] dojo_netproto::error::ProtoError),

    #[error("session closed")]
    SessionClosed,

    #[error("frame {got} resolved out of order (next is {expected})")]
    NotNextFrame { expected: u64, got: u64 },

    #[error("port {0} is not sampled locally")]
    NotLocalPort(u8),

    #[error("backfill exhausted on port {port} at frame {frame}")]
    BackfillExhausted { port: u8, frame: u64 },

    #[error("no host registered for match code {0:?}")]
    MatchNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel send error")]
    ChannelSend,
}

/// Why a session reached its `Closed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `Session::disconnect` was called locally.
    LocalDisconnect,
    /// The peer sent an explicit disconnect notice.
    PeerDisconnected(DisconnectReason),
    /// The link failed and reconnection gave up.
    ConnectionLost(String),
    /// The primary peer sent malformed data.
    ProtocolError(String),
    /// A backfill streak ran past the configured depth under the disconnect policy.
    BackfillExhausted { port: u8, frame: u64 },
}
