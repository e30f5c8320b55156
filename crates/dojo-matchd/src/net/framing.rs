use bytes::{Buf, Bytes, BytesMut};
use dojo_netproto::{
    codec_tcp::try_decode_tcp_frames, error::ProtoError, header::Header, messages::Message,
    msg_id::MsgId, packet::PacketView,
};

/// A decoded request that owns its payload bytes.
#[derive(Debug, Clone)]
pub struct PacketOwned {
    pub header: Header,
    pub msg_id: MsgId,
    pub payload: Bytes,
}

impl PacketOwned {
    pub fn message<M: Message>(&self) -> Result<M, ProtoError> {
        PacketView::new(self.header, self.msg_id, &self.payload).message()
    }
}

/// Receive buffer that yields whole frames and keeps the partial tail.
pub struct TcpFramer {
    buf: BytesMut,
}

impl TcpFramer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    /// Typical usage: `reserve`, then `socket.read_buf(framer.buf_mut())`.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode every complete frame and drop its bytes from the buffer.
    pub fn drain_packets(&mut self) -> Result<Vec<PacketOwned>, ProtoError> {
        let (views, consumed) = try_decode_tcp_frames(&self.buf)?;
        let out = views
            .into_iter()
            .map(|v| PacketOwned {
                header: v.header,
                msg_id: v.msg_id,
                payload: Bytes::copy_from_slice(v.payload),
            })
            .collect();
        self.buf.advance(consumed);
        Ok(out)
    }
}
