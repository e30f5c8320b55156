//! Message size limits for the netplay protocol.

use crate::{constants::HEADER_LEN, input::INPUT_RECORD_LEN, msg_id::MsgId};

// ============================================================================
// Core Size Limits
// ============================================================================

/// Maximum payload size for control messages (4 KB).
///
/// Handshake, disconnect, resync, keepalive and rendezvous messages all fit
/// well inside this.
pub const MAX_CONTROL_PAYLOAD: usize = 4 * 1024;

/// Maximum payload size for UDP packets (1200 bytes).
///
/// Kept below typical path MTU to reduce fragmentation risk.
pub const MAX_UDP_PAYLOAD: usize = 1200;

// ============================================================================
// Derived Limits
// ============================================================================

/// Maximum TCP frame size (header + payload).
pub const MAX_TCP_FRAME: usize = HEADER_LEN + MAX_CONTROL_PAYLOAD;

/// Initial TCP receive buffer size.
pub const TCP_RX_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// Message Classification
// ============================================================================

/// Returns the maximum payload size allowed for the given message ID.
///
/// Input-bearing kinds must carry exactly one record; everything else is
/// bounded by [`MAX_CONTROL_PAYLOAD`].
#[inline]
pub const fn max_payload_for(msg_id: MsgId) -> usize {
    if msg_id.is_input() {
        INPUT_RECORD_LEN
    } else {
        MAX_CONTROL_PAYLOAD
    }
}
