use crate::{
    constants::HEADER_LEN,
    error::ProtoError,
    header::Header,
    limits::MAX_UDP_PAYLOAD,
    messages::Message,
    msg_id::MsgId,
    packet::PacketView,
};

/// Encode `msg` as a single datagram `[Header][Payload]`.
pub fn encode_udp<M: Message>(mut header: Header, msg: &M) -> Result<Vec<u8>, ProtoError> {
    let payload_bytes = postcard::to_stdvec(msg)?;
    if payload_bytes.len() > MAX_UDP_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge(payload_bytes.len()));
    }

    header.msg_id = M::msg_id() as u8;
    header.payload_len = payload_bytes.len() as u32;

    let mut out = vec![0u8; HEADER_LEN + payload_bytes.len()];
    let mut hbuf = [0u8; HEADER_LEN];
    header.encode_into(&mut hbuf);
    out[..HEADER_LEN].copy_from_slice(&hbuf);
    out[HEADER_LEN..].copy_from_slice(&payload_bytes);
    Ok(out)
}

pub fn decode_udp(datagram: &[u8]) -> Result<PacketView<'_>, ProtoError> {
    if datagram.len() < HEADER_LEN {
        return Err(ProtoError::TooShort);
    }
    if datagram.len() > HEADER_LEN + MAX_UDP_PAYLOAD {
        return Err(ProtoError::FrameTooLarge(datagram.len()));
    }

    let (h, payload) = Header::decode(datagram)?;
    let msg = MsgId::from_repr(h.msg_id).ok_or(ProtoError::UnknownMsgId(h.msg_id))?;
    Ok(PacketView::new(h, msg, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::lobby::Announce;

    #[test]
    fn announce_survives_a_datagram() {
        let announce = Announce {
            host_addr: "192.168.1.20:6000".parse().unwrap(),
            game_name: "mvsc2".into(),
            player_name: "Player".into(),
        };
        let bytes = encode_udp(Header::new(0), &announce).unwrap();
        let view = decode_udp(&bytes).unwrap();
        assert_eq!(view.msg_id(), MsgId::Announce);
        let decoded: Announce = view.message().unwrap();
        assert_eq!(decoded, announce);
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let junk = vec![0u8; HEADER_LEN + MAX_UDP_PAYLOAD + 1];
        assert!(matches!(
            decode_udp(&junk),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }
}
