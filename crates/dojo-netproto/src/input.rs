//! Fixed-layout input records.
//!
//! Record layout (16 bytes, little-endian):
//! - 0..8   frame index (u64)
//! - 8      port (0..4)
//! - 9      sub_index (position within a packets-per-frame burst)
//! - 10..12 button bitmask (u16)
//! - 12..16 axes (4 x i8: left trigger, right trigger, stick X, stick Y)

use serde::{Deserialize, Serialize};

use crate::{
    constants::MAX_PORTS,
    error::ProtoError,
    header::{read_u16_le, read_u64_le},
};

pub const AXIS_LT: usize = 0;
pub const AXIS_RT: usize = 1;
pub const AXIS_X: usize = 2;
pub const AXIS_Y: usize = 3;

/// Encoded size of one [`PortInputState`].
pub const PORT_STATE_LEN: usize = 6;

/// Encoded size of one [`InputPacket`].
pub const INPUT_RECORD_LEN: usize = 16;

/// Controller state for one port on one frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortInputState {
    pub buttons: u16,
    pub axes: [i8; 4],
}

impl PortInputState {
    pub const NEUTRAL: PortInputState = PortInputState {
        buttons: 0,
        axes: [0; 4],
    };

    pub const fn new(buttons: u16, axes: [i8; 4]) -> Self {
        Self { buttons, axes }
    }

    pub fn encode_into(&self, out: &mut [u8; PORT_STATE_LEN]) {
        out[0..2].copy_from_slice(&self.buttons.to_le_bytes());
        for (dst, axis) in out[2..6].iter_mut().zip(self.axes) {
            *dst = axis as u8;
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() != PORT_STATE_LEN {
            return Err(ProtoError::LengthMismatch);
        }
        let buttons = read_u16_le(buf, 0)?;
        let mut axes = [0i8; 4];
        for (dst, src) in axes.iter_mut().zip(&buf[2..6]) {
            *dst = *src as i8;
        }
        Ok(Self { buttons, axes })
    }
}

/// One input sample on the wire.
///
/// Unique per (frame, port, origin peer); `sub_index` only distinguishes the
/// redundant copies of a burst and never affects resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPacket {
    pub frame: u64,
    pub port: u8,
    pub sub_index: u8,
    pub state: PortInputState,
}

impl InputPacket {
    pub fn new(frame: u64, port: u8, state: PortInputState) -> Self {
        Self {
            frame,
            port,
            sub_index: 0,
            state,
        }
    }

    pub fn with_sub_index(mut self, sub_index: u8) -> Self {
        self.sub_index = sub_index;
        self
    }

    pub fn encode(&self) -> [u8; INPUT_RECORD_LEN] {
        let mut out = [0u8; INPUT_RECORD_LEN];
        out[0..8].copy_from_slice(&self.frame.to_le_bytes());
        out[8] = self.port;
        out[9] = self.sub_index;
        let mut state = [0u8; PORT_STATE_LEN];
        self.state.encode_into(&mut state);
        out[10..16].copy_from_slice(&state);
        out
    }

    /// Rejects anything that is not exactly one record, or names a port the
    /// protocol does not have. Nothing is returned for a malformed record.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() != INPUT_RECORD_LEN {
            return Err(ProtoError::LengthMismatch);
        }
        let port = buf[8];
        if port as usize >= MAX_PORTS {
            return Err(ProtoError::InvalidPort(port));
        }
        Ok(Self {
            frame: read_u64_le(buf, 0)?,
            port,
            sub_index: buf[9],
            state: PortInputState::decode(&buf[10..16])?,
        })
    }
}
