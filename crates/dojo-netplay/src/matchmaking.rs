//! Match-code rendezvous against a `dojo-matchd` directory.
//!
//! Each request is one short TCP exchange: the host registers its listening
//! port under a code, the joiner looks the code up.

use std::{net::SocketAddr, time::Duration};

use dojo_netproto::messages::{
    Message,
    matchmaking::{MatchAddress, MatchQuery, MatchRegister, MatchRegistered},
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::NetplayError, handshake, transport};

const RETRY_AFTER_FAILURE: Duration = Duration::from_secs(5);

/// Resolve a `host:port` directory address.
pub async fn resolve_server(addr: &str) -> Result<SocketAddr, NetplayError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| NetplayError::ConnectionFailed(format!("cannot resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| NetplayError::ConnectionFailed(format!("no address for {addr}")))
}

async fn request<Req: Message, Resp: Message>(
    server: SocketAddr,
    req: &Req,
    timeout: Duration,
) -> Result<Resp, NetplayError> {
    let mut stream = transport::dial(server, timeout).await?;
    handshake::write_message(&mut stream, 0, req).await?;
    let resp = handshake::read_reply::<Resp>(&mut stream, timeout).await;
    let _ = stream.shutdown().await;
    resp
}

/// Publish `port` under `code`. Returns how long the registration lives.
pub async fn register(
    server: SocketAddr,
    code: &str,
    port: u16,
    timeout: Duration,
) -> Result<Duration, NetplayError> {
    let reply: MatchRegistered = request(
        server,
        &MatchRegister {
            code: code.to_string(),
            port,
        },
        timeout,
    )
    .await?;
    info!(code, ttl_secs = reply.ttl_secs, "Registered match code");
    Ok(Duration::from_secs(u64::from(reply.ttl_secs)))
}

/// Find the host registered under `code`.
pub async fn lookup(
    server: SocketAddr,
    code: &str,
    timeout: Duration,
) -> Result<SocketAddr, NetplayError> {
    let reply: MatchAddress = request(
        server,
        &MatchQuery {
            code: code.to_string(),
        },
        timeout,
    )
    .await?;
    reply
        .addr
        .ok_or_else(|| NetplayError::MatchNotFound(code.to_string()))
}

/// Refresh a registration at half its lifetime until cancelled.
pub async fn keep_registered(
    server: SocketAddr,
    code: String,
    port: u16,
    ttl: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut wait = refresh_interval(ttl);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        wait = match register(server, &code, port, timeout).await {
            Ok(ttl) => refresh_interval(ttl),
            Err(e) => {
                warn!(code = %code, "Match code refresh failed: {}", e);
                RETRY_AFTER_FAILURE
            }
        };
    }
    debug!(code = %code, "Stopped refreshing match code");
}

fn refresh_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_at_half_ttl_with_floor() {
        assert_eq!(refresh_interval(Duration::from_secs(600)), Duration::from_secs(300));
        assert_eq!(refresh_interval(Duration::ZERO), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        assert_eq!(
            resolve_server("127.0.0.1:52001").await.unwrap(),
            "127.0.0.1:52001".parse().unwrap()
        );
        assert!(resolve_server("no port here").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_server_fails_to_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = lookup(addr, "ABCD", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, NetplayError::ConnectionFailed(_)));
    }
}
