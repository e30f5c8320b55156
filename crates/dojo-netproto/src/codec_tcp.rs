use crate::{
    constants::{HEADER_LEN, TCP_LEN_PREFIX},
    error::ProtoError,
    header::Header,
    input::InputPacket,
    limits::{MAX_TCP_FRAME, max_payload_for},
    messages::Message,
    msg_id::MsgId,
    packet::PacketView,
};

/// Frame an already-encoded payload as `[u32 len][Header][Payload]`.
pub fn encode_tcp_raw(
    mut header: Header,
    msg_id: MsgId,
    payload: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    if payload.len() > max_payload_for(msg_id) {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }

    header.msg_id = msg_id as u8;
    header.payload_len = payload.len() as u32;

    let frame_len = HEADER_LEN + payload.len();
    if frame_len > MAX_TCP_FRAME {
        return Err(ProtoError::FrameTooLarge(frame_len));
    }

    let mut out = Vec::with_capacity(TCP_LEN_PREFIX + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_le_bytes());

    let mut hbuf = [0u8; HEADER_LEN];
    header.encode_into(&mut hbuf);
    out.extend_from_slice(&hbuf);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a control message with postcard and frame it.
pub fn encode_tcp_message<M: Message>(header: Header, msg: &M) -> Result<Vec<u8>, ProtoError> {
    let payload = postcard::to_stdvec(msg)?;
    encode_tcp_raw(header, M::msg_id(), &payload)
}

/// Frame one input record as `msg_id` (`Input` or `Resolved`).
pub fn encode_tcp_input(
    header: Header,
    msg_id: MsgId,
    input: &InputPacket,
) -> Result<Vec<u8>, ProtoError> {
    if !msg_id.is_input() {
        return Err(ProtoError::UnexpectedMessage(msg_id));
    }
    encode_tcp_raw(header, msg_id, &input.encode())
}

/// Decode every complete frame at the front of `in_buf`.
///
/// Returns the decoded packets and the number of bytes consumed. A trailing
/// partial frame is left in place for the next read. Any malformed frame fails
/// the whole call so nothing past it is applied.
pub fn try_decode_tcp_frames<'a>(
    in_buf: &'a [u8],
) -> Result<(Vec<PacketView<'a>>, usize), ProtoError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    loop {
        if in_buf.len().saturating_sub(offset) < TCP_LEN_PREFIX {
            break;
        }
        let frame_len = crate::header::read_u32_le(in_buf, offset)? as usize;

        if frame_len < HEADER_LEN {
            return Err(ProtoError::LengthMismatch);
        }
        if frame_len > MAX_TCP_FRAME {
            return Err(ProtoError::FrameTooLarge(frame_len));
        }

        let total_needed = TCP_LEN_PREFIX + frame_len;
        if in_buf.len().saturating_sub(offset) < total_needed {
            break;
        }

        let frame = &in_buf[offset + TCP_LEN_PREFIX..offset + total_needed];
        let (h, payload) = Header::decode(frame)?;
        let msg = MsgId::from_repr(h.msg_id).ok_or(ProtoError::UnknownMsgId(h.msg_id))?;
        if payload.len() > max_payload_for(msg) {
            return Err(ProtoError::PayloadTooLarge(payload.len()));
        }

        frames.push(PacketView::new(h, msg, payload));
        offset += total_needed;
    }

    Ok((frames, offset))
}
