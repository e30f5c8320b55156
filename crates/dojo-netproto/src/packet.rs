use crate::{
    error::ProtoError,
    header::Header,
    input::InputPacket,
    messages::{Message, decode_message},
    msg_id::MsgId,
};

/// A decoded packet borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub header: Header,
    pub msg_id: MsgId,
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(header: Header, msg_id: MsgId, payload: &'a [u8]) -> Self {
        Self {
            header,
            msg_id,
            payload,
        }
    }

    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// Decode the payload as `M`, checking that the kind tag matches.
    pub fn message<M: Message>(&self) -> Result<M, ProtoError> {
        if self.msg_id != M::msg_id() {
            return Err(ProtoError::UnexpectedMessage(self.msg_id));
        }
        decode_message(self.payload)
    }

    /// Decode the payload as a fixed input record.
    pub fn input(&self) -> Result<InputPacket, ProtoError> {
        if !self.msg_id.is_input() {
            return Err(ProtoError::UnexpectedMessage(self.msg_id));
        }
        InputPacket::decode(self.payload)
    }
}
