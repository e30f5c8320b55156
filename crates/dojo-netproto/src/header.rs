use crate::{
    constants::{HEADER_LEN, MAGIC, VERSION},
    error::ProtoError,
};

/// Packet header (wire format).
///
/// Encoding rules:
/// - Fixed size: exactly `HEADER_LEN` bytes.
/// - Integer fields are little-endian.
/// - Layout is defined by `encode_into()` / `decode()` offsets below.
///
/// Decode rules:
/// - Requires `buf.len() >= HEADER_LEN`.
/// - Requires `buf[0..2] == MAGIC`.
/// - Requires `version == VERSION`.
/// - Requires `buf.len() == HEADER_LEN + payload_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Wire-format version. `decode()` rejects versions != `VERSION`.
    pub version: u8,

    /// Packet kind tag. `decode()` does not validate it; the codecs do.
    pub msg_id: u8,

    /// Per-packet flags. Stored only.
    pub flags: u8,

    /// Host-assigned peer identifier. 0 means "not assigned yet" (or the host itself).
    pub peer_id: u32,

    /// Sender sequence number, increasing per connection.
    pub seq: u32,

    /// Last frame index the sender has resolved. The receiver keeps it as the
    /// peer's last-acknowledged frame.
    pub ack_frame: u64,

    /// Payload length in bytes. `decode()` requires `buf.len() == HEADER_LEN + payload_len`.
    pub payload_len: u32,
}

impl Header {
    /// Header size in bytes for the current wire layout.
    pub const LEN: usize = HEADER_LEN;

    /// Create a header with default values and a specific `msg_id`.
    pub fn new(msg_id: u8) -> Self {
        Self {
            version: VERSION,
            msg_id,
            flags: 0,
            peer_id: 0,
            seq: 0,
            ack_frame: 0,
            payload_len: 0,
        }
    }

    /// Encode this header into `out` using the current fixed wire layout.
    ///
    /// Offsets (bytes):
    /// - 0..2   magic
    /// - 2      version
    /// - 3      msg_id
    /// - 4      flags
    /// - 5      reserved (always 0)
    /// - 6..10  peer_id (u32 LE)
    /// - 10..14 seq (u32 LE)
    /// - 14..22 ack_frame (u64 LE)
    /// - 22..26 payload_len (u32 LE)
    pub fn encode_into(&self, out: &mut [u8; HEADER_LEN]) {
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.msg_id;
        out[4] = self.flags;
        out[5] = 0; // reserved

        out[6..10].copy_from_slice(&self.peer_id.to_le_bytes());
        out[10..14].copy_from_slice(&self.seq.to_le_bytes());
        out[14..22].copy_from_slice(&self.ack_frame.to_le_bytes());
        out[22..26].copy_from_slice(&self.payload_len.to_le_bytes());
    }

    /// Decode a packet buffer that contains exactly `[Header][Payload]`.
    ///
    /// On success, returns `(Header, payload_slice)`.
    pub fn decode(buf: &[u8]) -> Result<(Header, &[u8]), ProtoError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtoError::TooShort);
        }
        if buf[0..2] != MAGIC {
            return Err(ProtoError::BadMagic);
        }

        let version = buf[2];
        if version != VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let h = Header {
            version,
            msg_id: buf[3],
            flags: buf[4],
            peer_id: read_u32_le(buf, 6)?,
            seq: read_u32_le(buf, 10)?,
            ack_frame: read_u64_le(buf, 14)?,
            payload_len: read_u32_le(buf, 22)?,
        };

        if buf.len() != HEADER_LEN + h.payload_len as usize {
            return Err(ProtoError::LengthMismatch);
        }

        Ok((h, &buf[HEADER_LEN..]))
    }
}

pub(crate) fn read_u32_le(buf: &[u8], start: usize) -> Result<u32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn read_u64_le(buf: &[u8], start: usize) -> Result<u64, ProtoError> {
    let bytes: [u8; 8] = buf
        .get(start..start + 8)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u64::from_le_bytes(bytes))
}

pub(crate) fn read_u16_le(buf: &[u8], start: usize) -> Result<u16, ProtoError> {
    let bytes: [u8; 2] = buf
        .get(start..start + 2)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(u16::from_le_bytes(bytes))
}
