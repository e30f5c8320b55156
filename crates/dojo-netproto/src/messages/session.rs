use serde::{Deserialize, Serialize};

/// Truncated digest identifying the game image both peers must run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GameIdentity(pub [u8; 16]);

impl GameIdentity {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Session-wide delay settings. Fixed after the handshake.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayConfig {
    /// Frames added to every local sample before it is applied.
    pub base_delay: u8,
    /// Redundant sends per local sample.
    pub packets_per_frame: u8,
    /// Consecutive frames a missing remote input may be substituted. 0 disables.
    pub backfill_depth: u8,
    /// Capacity of each inbound queue, in frames.
    pub rx_buffer_frames: u32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            base_delay: 1,
            packets_per_frame: 2,
            backfill_depth: 3,
            rx_buffer_frames: 1800,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRole {
    Player,
    Spectator,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub proto_version: u8,
    pub role: JoinRole,
    pub match_code: String,
    pub game: GameIdentity,
    pub delay: DelayConfig,
    pub player_name: String,
    /// Token from a previous `Welcome` when re-attaching after a link loss.
    pub resume_token: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub session_token: u64,
    pub peer_id: u32,
    /// Port the joining peer contributes. `None` for spectators.
    pub local_port: Option<u8>,
    /// Bit `n` set when port `n` carries live input.
    pub active_ports: u8,
    pub delay: DelayConfig,
    pub host_name: String,
    pub game_name: String,
    /// First frame the joining peer will resolve.
    pub start_frame: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ProtocolVersion { host: u8, peer: u8 },
    GameMismatch,
    MatchCodeMismatch,
    DelayMismatch,
    SessionFull,
    UnknownResumeToken,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    pub reason: RejectReason,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    UserQuit,
    HostClosing,
    ProtocolError,
    ConnectionLost,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: DisconnectReason,
}

/// Ask the peer to re-send its retained input from `from_frame` on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReq {
    pub from_frame: u64,
}
