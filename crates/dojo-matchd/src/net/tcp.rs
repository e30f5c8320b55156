use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use dojo_netproto::{
    codec_tcp::encode_tcp_message,
    header::Header,
    limits::TCP_RX_BUFFER_SIZE,
    messages::matchmaking::{MatchAddress, MatchQuery, MatchRegister, MatchRegistered},
    msg_id::MsgId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::framing::{PacketOwned, TcpFramer};
use super::rate_limit::IpRateLimiter;
use crate::directory::Directory;

/// Run the accept loop on an existing listener.
pub async fn run_tcp_listener_with_listener(
    listener: TcpListener,
    directory: Arc<Directory>,
    ip_rate_limiter: Option<Arc<IpRateLimiter>>,
    idle_timeout: Duration,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;

        if let Some(ref limiter) = ip_rate_limiter
            && !limiter.check(peer.ip())
        {
            warn!(%peer, "Connection rejected: IP rate limit exceeded");
            drop(stream);
            continue;
        }

        let directory = directory.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, directory, idle_timeout).await;
        });
    }
}

/// Serve requests on one connection until it closes, idles out or misbehaves.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    directory: Arc<Directory>,
    idle_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);
    let mut framer = TcpFramer::new(1024);

    loop {
        let packets = match framer.drain_packets() {
            Ok(p) => p,
            Err(e) => {
                warn!(%peer, "Protocol decode error: {}", e);
                return;
            }
        };
        for packet in packets {
            let reply = match handle_request(&directory, peer, &packet, Instant::now()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(%peer, "Bad request: {}", e);
                    return;
                }
            };
            if let Err(e) = stream.write_all(&reply).await {
                debug!(%peer, "Write failed: {}", e);
                return;
            }
        }
        if framer.buffered() >= TCP_RX_BUFFER_SIZE {
            warn!(%peer, "Receive buffer exceeded");
            return;
        }

        framer.buf_mut().reserve(1024);
        match tokio::time::timeout(idle_timeout, stream.read_buf(framer.buf_mut())).await {
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(%peer, "Read failed: {}", e);
                return;
            }
            Err(_) => {
                debug!(%peer, "Idle connection closed");
                return;
            }
        }
    }
}

/// Answer one request. Anything but a register or query is an error.
pub fn handle_request(
    directory: &Directory,
    peer: SocketAddr,
    packet: &PacketOwned,
    now: Instant,
) -> anyhow::Result<Vec<u8>> {
    match packet.msg_id {
        MsgId::MatchRegister => {
            let req: MatchRegister = packet.message()?;
            let host = SocketAddr::new(peer.ip(), req.port);
            if !directory.register(&req.code, host, now) {
                bail!("unusable match code {:?}", req.code);
            }
            info!(code = %req.code, %host, "Registered host");
            let reply = MatchRegistered {
                code: req.code,
                ttl_secs: directory.ttl().as_secs().min(u64::from(u32::MAX)) as u32,
            };
            Ok(encode_tcp_message(
                Header::new(MsgId::MatchRegistered as u8),
                &reply,
            )?)
        }
        MsgId::MatchQuery => {
            let req: MatchQuery = packet.message()?;
            let addr = directory.lookup(&req.code, now);
            debug!(code = %req.code, found = addr.is_some(), "Lookup");
            Ok(encode_tcp_message(
                Header::new(MsgId::MatchAddress as u8),
                &MatchAddress {
                    code: req.code,
                    addr,
                },
            )?)
        }
        other => bail!("unexpected {:?}", other),
    }
}
