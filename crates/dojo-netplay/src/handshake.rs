//! Hello / Welcome / Reject exchange.
//!
//! The handshake runs on the raw stream before the channel tasks start. Bytes
//! read past the first packet are handed back so the channel can decode them.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use dojo_netproto::{
    codec_tcp::{encode_tcp_message, try_decode_tcp_frames},
    constants::{HEADER_LEN, TCP_LEN_PREFIX, VERSION},
    error::ProtoError,
    header::Header,
    limits::TCP_RX_BUFFER_SIZE,
    messages::{
        Message,
        session::{DelayConfig, GameIdentity, Hello, JoinRole, Reject, RejectReason, Welcome},
    },
    msg_id::MsgId,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, warn};

use crate::{error::NetplayError, transport::PacketOwned};

/// What the host currently offers to a joining peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimarySlot {
    Open,
    Taken,
    /// The primary dropped and may re-attach with this token.
    AwaitingResume(u64),
}

#[derive(Debug, Clone)]
pub struct HostTerms<'a> {
    pub game: GameIdentity,
    /// Empty accepts any code.
    pub match_code: &'a str,
    pub delay: DelayConfig,
    pub allow_spectators: bool,
    pub primary: PrimarySlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Primary,
    Resume,
    Spectator,
}

/// Decide whether a `Hello` may join. Pure; the caller sends the reply.
pub fn validate_hello(terms: &HostTerms<'_>, hello: &Hello) -> Result<Admission, RejectReason> {
    if hello.proto_version != VERSION {
        return Err(RejectReason::ProtocolVersion {
            host: VERSION,
            peer: hello.proto_version,
        });
    }
    if hello.game != terms.game {
        return Err(RejectReason::GameMismatch);
    }
    if !terms.match_code.is_empty() && hello.match_code != terms.match_code {
        return Err(RejectReason::MatchCodeMismatch);
    }

    match hello.role {
        JoinRole::Spectator if terms.allow_spectators => Ok(Admission::Spectator),
        JoinRole::Spectator => Err(RejectReason::SessionFull),
        JoinRole::Player => {
            if hello.delay != terms.delay {
                return Err(RejectReason::DelayMismatch);
            }
            match terms.primary {
                PrimarySlot::Open => Ok(Admission::Primary),
                PrimarySlot::Taken => Err(RejectReason::SessionFull),
                PrimarySlot::AwaitingResume(token) if hello.resume_token == Some(token) => {
                    Ok(Admission::Resume)
                }
                PrimarySlot::AwaitingResume(_) => Err(RejectReason::UnknownResumeToken),
            }
        }
    }
}

/// Which side of the exchange decoded a foreign header version.
#[derive(Debug, Clone, Copy)]
enum Side {
    Host,
    Joiner,
}

fn handshake_error(e: ProtoError, side: Side) -> NetplayError {
    match (e, side) {
        (ProtoError::UnsupportedVersion(v), Side::Host) => {
            NetplayError::HandshakeMismatch(RejectReason::ProtocolVersion {
                host: VERSION,
                peer: v,
            })
        }
        (ProtoError::UnsupportedVersion(v), Side::Joiner) => {
            NetplayError::HandshakeMismatch(RejectReason::ProtocolVersion {
                host: v,
                peer: VERSION,
            })
        }
        (e, _) => NetplayError::Protocol(e),
    }
}

async fn read_first_packet(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    side: Side,
) -> Result<PacketOwned, NetplayError> {
    loop {
        let first = {
            let (views, _) = try_decode_tcp_frames(buf).map_err(|e| handshake_error(e, side))?;
            views.first().map(|view| {
                (
                    PacketOwned::from(*view),
                    TCP_LEN_PREFIX + HEADER_LEN + view.payload.len(),
                )
            })
        };
        if let Some((packet, used)) = first {
            buf.advance(used);
            return Ok(packet);
        }
        if buf.len() >= TCP_RX_BUFFER_SIZE {
            return Err(NetplayError::Protocol(ProtoError::FrameTooLarge(buf.len())));
        }

        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Err(NetplayError::ConnectionFailed(
                "peer closed the connection during handshake".to_string(),
            ));
        }
    }
}

pub(crate) async fn write_message<M: Message>(
    stream: &mut TcpStream,
    peer_id: u32,
    msg: &M,
) -> Result<(), NetplayError> {
    let mut header = Header::new(M::msg_id() as u8);
    header.peer_id = peer_id;
    let bytes = encode_tcp_message(header, msg)?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Send a `Reject` and close. Errors are logged only.
pub(crate) async fn reject(mut stream: TcpStream, reason: RejectReason) {
    if let Err(e) = write_message(&mut stream, 0, &Reject { reason }).await {
        debug!("Failed to deliver reject: {}", e);
    }
    let _ = stream.shutdown().await;
}

/// Host side: wait for the joining peer's `Hello`.
///
/// A peer speaking another header version is rejected here. Returns the
/// `Hello` and any bytes that followed it.
pub async fn accept_hello(
    stream: &mut TcpStream,
    timeout: Duration,
) -> Result<(Hello, BytesMut), NetplayError> {
    let mut buf = BytesMut::with_capacity(1024);
    let packet = tokio::time::timeout(timeout, read_first_packet(stream, &mut buf, Side::Host))
        .await
        .map_err(|_| NetplayError::HandshakeTimeout)?;

    let packet = match packet {
        Err(NetplayError::HandshakeMismatch(reason)) => {
            let _ = write_message(stream, 0, &Reject { reason }).await;
            return Err(NetplayError::HandshakeMismatch(reason));
        }
        other => other?,
    };

    match packet.msg_id {
        MsgId::Hello => Ok((packet.view().message::<Hello>()?, buf)),
        other => Err(NetplayError::Protocol(ProtoError::UnexpectedMessage(other))),
    }
}

/// Read one reply of type `M` on a request/response connection.
pub(crate) async fn read_reply<M: Message>(
    stream: &mut TcpStream,
    timeout: Duration,
) -> Result<M, NetplayError> {
    let mut buf = BytesMut::with_capacity(256);
    let packet = tokio::time::timeout(timeout, read_first_packet(stream, &mut buf, Side::Joiner))
        .await
        .map_err(|_| NetplayError::ConnectionFailed(format!("no {:?} reply", M::msg_id())))??;
    Ok(packet.view().message::<M>()?)
}

/// Joining side: send `Hello` and wait for `Welcome` or `Reject`.
pub async fn client_handshake(
    stream: &mut TcpStream,
    hello: &Hello,
    timeout: Duration,
) -> Result<(Welcome, BytesMut), NetplayError> {
    let exchange = async {
        write_message(stream, 0, hello).await?;
        let mut buf = BytesMut::with_capacity(1024);
        let packet = read_first_packet(stream, &mut buf, Side::Joiner).await?;
        match packet.msg_id {
            MsgId::Welcome => Ok((packet.view().message::<Welcome>()?, buf)),
            MsgId::Reject => {
                let Reject { reason } = packet.view().message::<Reject>()?;
                warn!(?reason, "Host rejected handshake");
                Err(NetplayError::HandshakeMismatch(reason))
            }
            other => Err(NetplayError::Protocol(ProtoError::UnexpectedMessage(other))),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NetplayError::HandshakeTimeout)?
}
