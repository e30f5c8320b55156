//! Per-connection TCP channel.
//!
//! Each connection gets a reader task and a writer task. Decoded packets and a
//! single terminal `Closed` event flow to the session handler over one shared
//! event channel; outgoing frames are queued on a bounded command channel.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use dojo_netproto::{
    codec_tcp::try_decode_tcp_frames, header::Header, limits::TCP_RX_BUFFER_SIZE, msg_id::MsgId,
    packet::PacketView,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::NetplayError;

/// Outgoing frames queued per connection before `try_send` reports `Full`.
pub const CHANNEL_QUEUE_DEPTH: usize = 256;

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A decoded packet with owned payload data.
#[derive(Debug, Clone)]
pub struct PacketOwned {
    pub header: Header,
    pub msg_id: MsgId,
    pub payload: Bytes,
}

impl<'a> From<PacketView<'a>> for PacketOwned {
    fn from(view: PacketView<'a>) -> Self {
        Self {
            header: view.header,
            msg_id: view.msg_id,
            payload: Bytes::copy_from_slice(view.payload),
        }
    }
}

impl PacketOwned {
    pub fn view(&self) -> PacketView<'_> {
        PacketView::new(self.header, self.msg_id, &self.payload)
    }
}

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkClosed {
    /// The peer closed its side.
    Eof,
    Io(String),
    /// The peer sent bytes that do not decode.
    Protocol(String),
    /// Closed locally.
    Cancelled,
}

#[derive(Debug)]
pub enum ChannelEvent {
    Packet { conn_id: ConnId, packet: PacketOwned },
    /// Sent exactly once per channel, after the last packet.
    Closed { conn_id: ConnId, cause: LinkClosed },
}

#[derive(Debug)]
enum ChannelCommand {
    SendRaw(Bytes),
    /// Flush what is queued, then shut the write half down.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Full,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelHandle {
    conn_id: ConnId,
    peer: SocketAddr,
    cmd_tx: mpsc::Sender<ChannelCommand>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue an encoded frame without waiting.
    pub fn try_send(&self, bytes: impl Into<Bytes>) -> Result<(), Backpressure> {
        self.cmd_tx
            .try_send(ChannelCommand::SendRaw(bytes.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Backpressure::Full,
                mpsc::error::TrySendError::Closed(_) => Backpressure::Closed,
            })
    }

    /// Queue an encoded frame, waiting for room.
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<(), NetplayError> {
        self.cmd_tx
            .send(ChannelCommand::SendRaw(bytes.into()))
            .await
            .map_err(|_| NetplayError::ChannelSend)
    }

    /// Flush queued frames and close.
    pub fn close(&self) {
        if self.cmd_tx.try_send(ChannelCommand::Disconnect).is_err() {
            self.cancel.cancel();
        }
    }

    /// Close immediately, dropping anything still queued.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Open a TCP connection, mapping failures to [`NetplayError::ConnectionFailed`].
pub async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetplayError> {
    info!("Connecting to netplay peer at {}", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetplayError::ConnectionFailed(format!("connect to {addr} timed out")))?
        .map_err(|e| NetplayError::ConnectionFailed(format!("Failed to connect to {addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Start the reader and writer tasks for an established stream.
///
/// `initial` holds bytes already read past the handshake; they are decoded
/// before anything else. Cancelling `parent` stops the channel.
pub fn spawn_channel(
    stream: TcpStream,
    initial: BytesMut,
    events: mpsc::Sender<ChannelEvent>,
    parent: &CancellationToken,
) -> Result<ChannelHandle, NetplayError> {
    let peer = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    Ok(spawn_channel_io(read_half, write_half, peer, initial, events, parent))
}

pub(crate) fn spawn_channel_io<R, W>(
    read: R,
    write: W,
    peer: SocketAddr,
    initial: BytesMut,
    events: mpsc::Sender<ChannelEvent>,
    parent: &CancellationToken,
) -> ChannelHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let cancel = parent.child_token();
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
    let write_failure = Arc::new(Mutex::new(None));

    tokio::spawn(writer_loop(
        write,
        cmd_rx,
        cancel.clone(),
        write_failure.clone(),
    ));
    tokio::spawn(reader_loop(
        read,
        initial,
        conn_id,
        events,
        cancel.clone(),
        write_failure,
    ));

    debug!(conn_id, %peer, "channel started");
    ChannelHandle {
        conn_id,
        peer,
        cmd_tx,
        cancel,
    }
}

/// Writer task: receives commands and writes to socket.
async fn writer_loop(
    mut write: impl AsyncWrite + Unpin,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    cancel: CancellationToken,
    failure: Arc<Mutex<Option<LinkClosed>>>,
) {
    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::SendRaw(bytes)) => {
                    trace!("Sending {} bytes", bytes.len());
                    if let Err(e) = write.write_all(&bytes).await {
                        warn!("Write error: {}", e);
                        *failure.lock() = Some(LinkClosed::Io(e.to_string()));
                        break;
                    }
                }
                Some(ChannelCommand::Disconnect) | None => {
                    debug!("Channel writer stopping");
                    break;
                }
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Attempt graceful shutdown
    let _ = write.shutdown().await;
    cancel.cancel();
}

/// Reader task: decodes frames and forwards them, then reports why it stopped.
async fn reader_loop(
    mut read: impl AsyncRead + Unpin,
    mut buf: BytesMut,
    conn_id: ConnId,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    write_failure: Arc<Mutex<Option<LinkClosed>>>,
) {
    let cause = loop {
        let packets = match try_decode_tcp_frames(&buf) {
            Ok((views, consumed)) => {
                let packets: Vec<PacketOwned> = views.into_iter().map(PacketOwned::from).collect();
                buf.advance(consumed);
                packets
            }
            Err(e) => {
                warn!(conn_id, "Protocol decode error: {}", e);
                break LinkClosed::Protocol(e.to_string());
            }
        };
        for packet in packets {
            trace!(conn_id, msg = ?packet.msg_id, "received");
            if events
                .send(ChannelEvent::Packet { conn_id, packet })
                .await
                .is_err()
            {
                cancel.cancel();
                return;
            }
        }

        if buf.len() >= TCP_RX_BUFFER_SIZE {
            break LinkClosed::Protocol("receive buffer exceeded".to_string());
        }

        buf.reserve(4096);
        tokio::select! {
            _ = cancel.cancelled() => {
                break write_failure.lock().take().unwrap_or(LinkClosed::Cancelled);
            }
            res = read.read_buf(&mut buf) => match res {
                Ok(0) => {
                    info!(conn_id, "Peer closed connection");
                    break LinkClosed::Eof;
                }
                Ok(n) => trace!(conn_id, "Received {} bytes", n),
                Err(e) => {
                    warn!(conn_id, "Read error: {}", e);
                    break LinkClosed::Io(e.to_string());
                }
            }
        }
    };

    cancel.cancel();
    let _ = events.send(ChannelEvent::Closed { conn_id, cause }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dojo_netproto::{
        codec_tcp::encode_tcp_message,
        messages::sync::{Ping, Pong},
    };
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn ping(t_ms: u32) -> Vec<u8> {
        encode_tcp_message(Header::new(MsgId::Ping as u8), &Ping { t_ms }).unwrap()
    }

    #[test]
    fn packet_owned_conversion() {
        let header = Header::new(MsgId::Ping as u8);
        let payload = &[1, 2, 3];
        let view = PacketView::new(header, MsgId::Ping, payload);

        let owned = PacketOwned::from(view);
        assert_eq!(owned.msg_id, MsgId::Ping);
        assert_eq!(&owned.payload[..], payload);
        assert_eq!(owned.view().payload, payload);
    }

    #[tokio::test]
    async fn packets_flow_between_channels() {
        let (a, b) = pair().await;
        let cancel = CancellationToken::new();
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let ha = spawn_channel(a, BytesMut::new(), tx_a, &cancel).unwrap();
        let hb = spawn_channel(b, BytesMut::new(), tx_b, &cancel).unwrap();

        ha.send(ping(7)).await.unwrap();
        match rx_b.recv().await.unwrap() {
            ChannelEvent::Packet { conn_id, packet } => {
                assert_eq!(conn_id, hb.conn_id());
                assert_eq!(packet.view().message::<Ping>().unwrap(), Ping { t_ms: 7 });
            }
            other => panic!("unexpected {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn leftover_handshake_bytes_are_decoded_first() {
        let (a, b) = pair().await;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let (tx_a, _rx_a) = mpsc::channel(16);
        let _ha = spawn_channel(a, BytesMut::new(), tx_a, &cancel).unwrap();

        let mut initial = BytesMut::new();
        initial.extend_from_slice(&ping(1));
        let _hb = spawn_channel(b, initial, tx, &cancel).unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Packet { packet, .. } => assert_eq!(packet.msg_id, MsgId::Ping),
            other => panic!("unexpected {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn garbage_closes_with_protocol_error() {
        let (mut a, b) = pair().await;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _hb = spawn_channel(b, BytesMut::new(), tx, &cancel).unwrap();

        let mut frame =
            encode_tcp_message(Header::new(MsgId::Pong as u8), &Pong { t_ms: 0 }).unwrap();
        frame[4 + 3] = 0xEE;
        a.write_all(&frame).await.unwrap();

        match rx.recv().await.unwrap() {
            ChannelEvent::Closed { cause, .. } => {
                assert!(matches!(cause, LinkClosed::Protocol(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn graceful_close_reaches_peer_as_eof() {
        let (a, b) = pair().await;
        let cancel = CancellationToken::new();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let ha = spawn_channel(a, BytesMut::new(), tx_a, &cancel).unwrap();
        let _hb = spawn_channel(b, BytesMut::new(), tx_b, &cancel).unwrap();

        ha.send(ping(3)).await.unwrap();
        ha.close();

        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ChannelEvent::Packet { .. }
        ));
        match rx_b.recv().await.unwrap() {
            ChannelEvent::Closed { cause, .. } => assert_eq!(cause, LinkClosed::Eof),
            other => panic!("unexpected {other:?}"),
        }
        match rx_a.recv().await.unwrap() {
            ChannelEvent::Closed { cause, .. } => {
                assert!(matches!(cause, LinkClosed::Cancelled | LinkClosed::Eof));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ha.is_closed());
    }
}
