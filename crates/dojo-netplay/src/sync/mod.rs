//! Frame synchronization.
//!
//! Each port moves through `Pending -> Buffered -> Resolved` per frame:
//! - local samples are buffered at `frame + base_delay`
//! - remote packets are buffered by frame index, in any arrival order
//! - a frame resolves once every active port has a buffered value, or when it
//!   is due and the missing ports can be backfilled from their last resolved value
//!
//! Resolved frames are final. Late or duplicate packets never change them.

pub mod backfill;
pub mod inbound;
pub mod synchronizer;

use clap::ValueEnum;
use dojo_netproto::{constants::MAX_PORTS, input::PortInputState, messages::session::DelayConfig};
use serde::{Deserialize, Serialize};

pub use backfill::BackfillWindow;
pub use inbound::{InboundQueues, PushOutcome};
pub use synchronizer::{FrameSynchronizer, IngestOutcome};

/// Policy once a port has been backfilled for more consecutive frames than
/// the configured depth.
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackfillOverflow {
    /// Keep repeating the last known input and warn once per streak.
    #[default]
    Repeat,
    /// Stop substituting and wait for the real input.
    Stall,
    /// Give up on the peer.
    Disconnect,
}

/// Who supplies input for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    /// Never awaited; always resolves to the neutral state.
    Inactive,
    /// Sampled on this instance.
    Local,
    /// Received from the network.
    Remote,
}

/// Per-(port, frame) position in the resolution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Buffered(PortInputState),
    Resolved(PortInputState),
}

/// Recoverable divergence surfaced to the emulator core. Emulation continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncWarning {
    /// The inbound queue for `port` filled up and dropped its oldest entries.
    ReceiveOverflow { port: u8 },
    /// `port` has been backfilled for more than the configured depth.
    BackfillStreak { port: u8, frame: u64, streak: u32 },
}

/// The agreed input for every port on one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub frame: u64,
    pub inputs: [PortInputState; MAX_PORTS],
    /// Bit `n` set when port `n` was backfilled rather than received.
    pub substituted: u8,
}

impl ResolvedFrame {
    pub fn port(&self, port: u8) -> PortInputState {
        self.inputs[port as usize]
    }

    pub fn was_substituted(&self, port: u8) -> bool {
        self.substituted & (1 << port) != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub delay: DelayConfig,
    pub overflow: BackfillOverflow,
    pub neutral: PortInputState,
}

impl SyncOptions {
    pub fn new(delay: DelayConfig) -> Self {
        Self {
            delay,
            overflow: BackfillOverflow::default(),
            neutral: PortInputState::NEUTRAL,
        }
    }

    pub fn with_overflow(mut self, overflow: BackfillOverflow) -> Self {
        self.overflow = overflow;
        self
    }
}

/// Counters for diagnostics overlays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub resolved_frames: u64,
    pub substitutions: u64,
    pub duplicates: u64,
    pub late_packets: u64,
    pub overflow_drops: u64,
}
