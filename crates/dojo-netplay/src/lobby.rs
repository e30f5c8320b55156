//! LAN lobby: hosts announce themselves over UDP multicast or broadcast and
//! listeners keep a list of recently seen sessions.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use dojo_netproto::{
    codec_udp::{decode_udp, encode_udp},
    constants::HEADER_LEN,
    header::Header,
    limits::MAX_UDP_PAYLOAD,
    messages::lobby::Announce,
    msg_id::MsgId,
};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::NetplayError;

/// An entry disappears after this many missed announcements.
pub const LOBBY_EXPIRY_INTERVALS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyEntry {
    pub host_addr: SocketAddr,
    pub game_name: String,
    pub player_name: String,
    pub last_seen: Instant,
}

/// Sessions seen on the LAN, keyed by host address.
#[derive(Debug)]
pub struct LobbyList {
    entries: HashMap<SocketAddr, LobbyEntry>,
    expiry: Duration,
}

impl LobbyList {
    pub fn new(announce_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            expiry: announce_interval * LOBBY_EXPIRY_INTERVALS,
        }
    }

    /// Record an announcement received from `src`. Returns `true` for a host
    /// not currently listed.
    ///
    /// Hosts bound to a wildcard address announce it as such; the datagram's
    /// source address stands in for it.
    pub fn observe(&mut self, announce: Announce, src: SocketAddr, now: Instant) -> bool {
        let mut host_addr = announce.host_addr;
        if host_addr.ip().is_unspecified() {
            host_addr.set_ip(src.ip());
        }
        self.entries
            .insert(
                host_addr,
                LobbyEntry {
                    host_addr,
                    game_name: announce.game_name,
                    player_name: announce.player_name,
                    last_seen: now,
                },
            )
            .is_none()
    }

    /// Drop entries not refreshed within the expiry window.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let expiry = self.expiry;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) < expiry);
        before - self.entries.len()
    }

    pub fn entries(&self) -> Vec<LobbyEntry> {
        let mut out: Vec<LobbyEntry> = self.entries.values().cloned().collect();
        out.sort_by(|a, b| a.player_name.cmp(&b.player_name).then(a.host_addr.cmp(&b.host_addr)));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn wildcard_for(target: &SocketAddr) -> SocketAddr {
    match target.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Send `announce` to `target` every `interval` until cancelled.
pub async fn run_announcer(
    target: SocketAddr,
    announce: Announce,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), NetplayError> {
    let socket = UdpSocket::bind(wildcard_for(&target)).await?;
    if target.ip().is_multicast() {
        socket.set_multicast_ttl_v4(1)?;
    } else {
        socket.set_broadcast(true)?;
    }
    let datagram = encode_udp(Header::new(MsgId::Announce as u8), &announce)?;
    info!(%target, "Announcing session on the LAN");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&datagram, target).await {
                    debug!(%target, "Lobby announce failed: {}", e);
                }
            }
        }
    }
    Ok(())
}

/// Background listener filling a [`LobbyList`].
pub struct LobbyListener {
    list: Arc<Mutex<LobbyList>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl LobbyListener {
    /// Listen on `bind`, joining `group` when it is a multicast address.
    pub async fn bind(
        bind: SocketAddr,
        group: Option<IpAddr>,
        announce_interval: Duration,
    ) -> Result<Self, NetplayError> {
        let socket = UdpSocket::bind(bind).await?;
        match group {
            Some(IpAddr::V4(g)) if g.is_multicast() => {
                socket.join_multicast_v4(g, Ipv4Addr::UNSPECIFIED)?;
            }
            Some(IpAddr::V6(g)) if g.is_multicast() => socket.join_multicast_v6(&g, 0)?,
            _ => {}
        }
        let local_addr = socket.local_addr()?;
        let list = Arc::new(Mutex::new(LobbyList::new(announce_interval)));
        let cancel = CancellationToken::new();
        tokio::spawn(listen_loop(socket, list.clone(), cancel.clone()));
        Ok(Self {
            list,
            local_addr,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live entries, expired ones pruned first.
    pub fn snapshot(&self) -> Vec<LobbyEntry> {
        let mut list = self.list.lock();
        list.prune(Instant::now());
        list.entries()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LobbyListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen_loop(socket: UdpSocket, list: Arc<Mutex<LobbyList>>, cancel: CancellationToken) {
    let mut buf = vec![0u8; HEADER_LEN + MAX_UDP_PAYLOAD];
    loop {
        let (n, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    debug!("Lobby receive failed: {}", e);
                    continue;
                }
            },
        };
        let announce = decode_udp(&buf[..n]).and_then(|view| view.message::<Announce>());
        match announce {
            Ok(announce) => {
                if list.lock().observe(announce, src, Instant::now()) {
                    debug!(%src, "New session on the LAN");
                }
            }
            Err(e) => trace!(%src, "Ignoring lobby datagram: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(addr: &str, name: &str) -> Announce {
        Announce {
            host_addr: addr.parse().unwrap(),
            game_name: "Third Strike".to_string(),
            player_name: name.to_string(),
        }
    }

    #[test]
    fn wildcard_host_takes_source_ip() {
        let mut list = LobbyList::new(Duration::from_secs(1));
        let now = Instant::now();
        assert!(list.observe(
            announce("0.0.0.0:6000", "ryu"),
            "192.168.1.20:40000".parse().unwrap(),
            now
        ));
        let entries = list.entries();
        assert_eq!(entries[0].host_addr, "192.168.1.20:6000".parse().unwrap());
    }

    #[test]
    fn refresh_does_not_duplicate() {
        let mut list = LobbyList::new(Duration::from_secs(1));
        let src = "10.0.0.2:1".parse().unwrap();
        let now = Instant::now();
        assert!(list.observe(announce("10.0.0.2:6000", "ken"), src, now));
        assert!(!list.observe(announce("10.0.0.2:6000", "ken"), src, now));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn entries_expire_after_three_intervals() {
        let mut list = LobbyList::new(Duration::from_millis(100));
        let t0 = Instant::now();
        let src = "10.0.0.2:1".parse().unwrap();
        list.observe(announce("10.0.0.2:6000", "ken"), src, t0);
        list.observe(announce("10.0.0.3:6000", "chun"), src, t0 + Duration::from_millis(200));

        assert_eq!(list.prune(t0 + Duration::from_millis(299)), 0);
        assert_eq!(list.prune(t0 + Duration::from_millis(300)), 1);
        assert_eq!(list.entries()[0].player_name, "chun");
        assert_eq!(list.prune(t0 + Duration::from_millis(500)), 1);
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn announcer_reaches_listener() {
        let listener = LobbyListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            None,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(run_announcer(
            listener.local_addr(),
            announce("0.0.0.0:6000", "akuma"),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let mut seen = Vec::new();
        for _ in 0..100 {
            seen = listener.snapshot();
            if !seen.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].player_name, "akuma");
        assert_eq!(seen[0].host_addr, "127.0.0.1:6000".parse().unwrap());
    }
}
