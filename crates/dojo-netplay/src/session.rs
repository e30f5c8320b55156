//! Session lifecycle: host, connect, spectate and disconnect.
//!
//! A [`Session`] owns the handler task and hands the emulator an
//! [`SharedInputProvider`] to tick. The host contributes port 0 and the
//! joining player port 1; ports 2 and 3 stay inactive.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use dojo_netproto::{
    constants::{MAX_PORTS, VERSION},
    messages::{
        lobby::Announce,
        session::{DelayConfig, GameIdentity, Hello, JoinRole},
    },
};
use parking_lot::Mutex;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{NetplaySettings, SessionRole},
    error::{CloseReason, NetplayError},
    handler::{HandlerCommand, HandlerInit, LocalRole, SessionHandler},
    handshake,
    input_provider::{FrameStep, LocalInputSource, SharedInputProvider},
    lobby, matchmaking,
    replay::{Recorder, ReplayHeader},
    sync::{FrameSynchronizer, PortSource, SyncOptions},
    transport,
};

pub const HOST_PORT: u8 = 0;
pub const GUEST_PORT: u8 = 1;
const HOST_PEER_ID: u32 = 1;
const ACTIVE_PLAYER_PORTS: u8 = (1 << HOST_PORT) | (1 << GUEST_PORT);

/// Lifecycle notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerJoined { peer_id: u32, name: String, port: u8 },
    SpectatorJoined { peer_id: u32, name: String },
    PeerLeft { peer_id: u32, reason: String },
    PeerReconnecting { peer_id: u32 },
    PeerReconnected { peer_id: u32 },
    /// Emitted exactly once per session.
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Host,
    Player { port: u8 },
    Spectator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Reconnecting,
}

/// A remote participant as seen from this end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: u32,
    pub name: String,
    pub addr: SocketAddr,
    pub role: PeerRole,
    pub state: PeerState,
    /// Next frame the peer reported it will resolve.
    pub ack_frame: u64,
    pub rtt_ms: Option<u32>,
}

pub type PeerTable = Arc<Mutex<HashMap<u32, Peer>>>;

/// Fixed facts about a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: SessionRole,
    pub peer_id: u32,
    pub local_port: Option<u8>,
    pub session_token: u64,
    pub delay: DelayConfig,
    pub game: GameIdentity,
    pub game_name: String,
    pub host_name: String,
    pub start_frame: u64,
}

pub struct Session {
    info: SessionInfo,
    provider: Arc<SharedInputProvider>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedSender<HandlerCommand>,
    peers: PeerTable,
    handler: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
}

/// Channels and shared state every session role starts from.
struct Wiring {
    provider: Arc<SharedInputProvider>,
    peers: PeerTable,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    command_tx: mpsc::UnboundedSender<HandlerCommand>,
    command_rx: mpsc::UnboundedReceiver<HandlerCommand>,
    cancel: CancellationToken,
}

fn wire(sync: FrameSynchronizer, settings: &NetplaySettings, relay: bool) -> Wiring {
    let provider = Arc::new(SharedInputProvider::new(sync, settings.frame_wait()));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let tx = command_tx.clone();
    provider.set_on_send_input(Box::new(move |packet| {
        let _ = tx.send(HandlerCommand::SendInput(packet));
    }));

    if relay {
        let tx = command_tx.clone();
        provider.set_on_resolved(Box::new(move |frame| {
            let _ = tx.send(HandlerCommand::Relay(*frame));
        }));
    }

    let tx = command_tx.clone();
    let events = events_tx.clone();
    provider.set_on_closed(Box::new(move |reason| {
        let _ = events.send(SessionEvent::Closed {
            reason: reason.clone(),
        });
        let _ = tx.send(HandlerCommand::ProviderClosed(reason.clone()));
    }));

    Wiring {
        provider,
        peers: Arc::new(Mutex::new(HashMap::new())),
        events_tx,
        events_rx,
        command_tx,
        command_rx,
        cancel: CancellationToken::new(),
    }
}

fn port_sources(active_ports: u8, local_port: Option<u8>) -> [PortSource; MAX_PORTS] {
    std::array::from_fn(|p| {
        let p = p as u8;
        if active_ports & (1 << p) == 0 {
            PortSource::Inactive
        } else if Some(p) == local_port {
            PortSource::Local
        } else {
            PortSource::Remote
        }
    })
}

fn sync_options(delay: DelayConfig, settings: &NetplaySettings) -> SyncOptions {
    SyncOptions::new(delay).with_overflow(settings.backfill_overflow)
}

fn start_recording(
    provider: &SharedInputProvider,
    settings: &NetplaySettings,
    header: ReplayHeader,
    session_token: u64,
) -> Result<(), NetplayError> {
    if !settings.record_matches {
        return Ok(());
    }
    let path = settings
        .replay_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("dojo-{session_token:016x}.djr")));
    provider.start_recording(Recorder::create(&path, &header)?);
    info!(path = %path.display(), "Recording match");
    Ok(())
}

fn hello(settings: &NetplaySettings, game: GameIdentity, role: JoinRole) -> Hello {
    Hello {
        proto_version: VERSION,
        role,
        match_code: settings.match_code.clone(),
        game,
        delay: settings.delay_config(),
        player_name: settings.player_name.clone(),
        resume_token: None,
    }
}

/// A bound host socket that has not been joined yet.
pub struct HostListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: NetplaySettings,
    game: GameIdentity,
}

impl HostListener {
    pub async fn bind(
        addr: SocketAddr,
        settings: NetplaySettings,
        game: GameIdentity,
    ) -> Result<Self, NetplayError> {
        settings.validate()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Hosting netplay session on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            settings,
            game,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting and wait until a player has joined.
    ///
    /// Spectators may attach at any time afterwards. LAN announcements and the
    /// matchmaking registration run until the session closes.
    pub async fn accept_primary(self) -> Result<Session, NetplayError> {
        let Self {
            listener,
            local_addr,
            settings,
            game,
        } = self;

        let delay = settings.delay_config();
        let sync = FrameSynchronizer::new(
            sync_options(delay, &settings),
            port_sources(ACTIVE_PLAYER_PORTS, Some(HOST_PORT)),
        );
        let w = wire(sync, &settings, true);
        let session_token: u64 = rand::random();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handler = SessionHandler::new(HandlerInit {
            role: LocalRole::Host {
                session_token,
                host_name: settings.player_name.clone(),
                game_name: settings.game_name.clone(),
            },
            settings: settings.clone(),
            game,
            delay,
            local_peer_id: HOST_PEER_ID,
            provider: w.provider.clone(),
            peers: w.peers.clone(),
            events: w.events_tx.clone(),
            command_tx: w.command_tx.clone(),
            command_rx: w.command_rx,
            primary_ready: Some(ready_tx),
            cancel: w.cancel.clone(),
        });
        let handle = tokio::spawn(handler.run());

        tokio::spawn(accept_loop(
            listener,
            w.command_tx.clone(),
            settings.handshake_timeout(),
            w.cancel.child_token(),
        ));

        if settings.lobby_enabled {
            let target = lobby_target(&settings)?;
            let announce = Announce {
                host_addr: local_addr,
                game_name: settings.game_name.clone(),
                player_name: settings.player_name.clone(),
            };
            let interval = settings.lobby_interval();
            let cancel = w.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = lobby::run_announcer(target, announce, interval, cancel).await {
                    warn!("Lobby announcer stopped: {}", e);
                }
            });
        }

        if settings.matchmaking_enabled && !settings.match_code.is_empty() {
            let server = matchmaking::resolve_server(&settings.matchmaking_addr).await?;
            let ttl = matchmaking::register(
                server,
                &settings.match_code,
                local_addr.port(),
                settings.handshake_timeout(),
            )
            .await?;
            tokio::spawn(matchmaking::keep_registered(
                server,
                settings.match_code.clone(),
                local_addr.port(),
                ttl,
                settings.handshake_timeout(),
                w.cancel.child_token(),
            ));
        }

        if ready_rx.await.is_err() {
            w.cancel.cancel();
            return Err(NetplayError::ConnectionFailed(
                "session closed before a player joined".to_string(),
            ));
        }

        let guest_name = w
            .peers
            .lock()
            .values()
            .find(|p| matches!(p.role, PeerRole::Player { .. }))
            .map(|p| p.name.clone())
            .unwrap_or_default();
        start_recording(
            &w.provider,
            &settings,
            ReplayHeader {
                delay,
                game,
                game_name: settings.game_name.clone(),
                active_ports: ACTIVE_PLAYER_PORTS,
                player_names: vec![settings.player_name.clone(), guest_name],
                match_code: settings.match_code.clone(),
            },
            session_token,
        )?;

        Ok(Session {
            info: SessionInfo {
                role: SessionRole::Host,
                peer_id: HOST_PEER_ID,
                local_port: Some(HOST_PORT),
                session_token,
                delay,
                game,
                game_name: settings.game_name.clone(),
                host_name: settings.player_name.clone(),
                start_frame: 0,
            },
            provider: w.provider,
            events: w.events_rx,
            commands: w.command_tx,
            peers: w.peers,
            handler: Some(handle),
            cancel: w.cancel,
            local_addr: Some(local_addr),
        })
    }
}

fn lobby_target(settings: &NetplaySettings) -> Result<SocketAddr, NetplayError> {
    let ip: IpAddr = settings.lobby_addr.parse().map_err(|_| {
        NetplayError::InvalidConfig(format!("bad lobby address {:?}", settings.lobby_addr))
    })?;
    Ok(SocketAddr::new(ip, settings.lobby_port))
}

/// Accept connections and hand every completed `Hello` to the handler.
async fn accept_loop(
    listener: TcpListener,
    commands: mpsc::UnboundedSender<HandlerCommand>,
    handshake_timeout: std::time::Duration,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };
        let (mut stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(%peer, "Incoming connection");

        let commands = commands.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                res = handshake::accept_hello(&mut stream, handshake_timeout) => res,
            };
            match result {
                Ok((hello, leftover)) => {
                    let _ = commands.send(HandlerCommand::Admit {
                        stream,
                        hello,
                        leftover,
                    });
                }
                Err(e) => warn!(%peer, "Handshake failed: {}", e),
            }
        });
    }
    debug!("Accept loop stopped");
}

impl Session {
    /// Bind `addr` and wait for a player to join.
    pub async fn host(
        addr: SocketAddr,
        settings: NetplaySettings,
        game: GameIdentity,
    ) -> Result<Session, NetplayError> {
        HostListener::bind(addr, settings, game)
            .await?
            .accept_primary()
            .await
    }

    /// Join the host at `remote` as the second player.
    pub async fn connect(
        remote: SocketAddr,
        settings: NetplaySettings,
        game: GameIdentity,
    ) -> Result<Session, NetplayError> {
        settings.validate()?;
        let hello = hello(&settings, game, JoinRole::Player);
        let mut stream = transport::dial(remote, settings.handshake_timeout()).await?;
        let (welcome, leftover) =
            handshake::client_handshake(&mut stream, &hello, settings.handshake_timeout()).await?;
        let local_port = welcome.local_port.ok_or_else(|| {
            NetplayError::ConnectionFailed("host assigned no input port".to_string())
        })?;
        info!(
            peer_id = welcome.peer_id,
            port = local_port,
            host = %welcome.host_name,
            "Joined netplay session"
        );

        let sync = FrameSynchronizer::new(
            sync_options(welcome.delay, &settings),
            port_sources(welcome.active_ports, Some(local_port)),
        );
        let w = wire(sync, &settings, false);
        let mut handler = SessionHandler::new(HandlerInit {
            role: LocalRole::Client {
                remote,
                hello,
                session_token: welcome.session_token,
            },
            settings: settings.clone(),
            game,
            delay: welcome.delay,
            local_peer_id: welcome.peer_id,
            provider: w.provider.clone(),
            peers: w.peers.clone(),
            events: w.events_tx.clone(),
            command_tx: w.command_tx.clone(),
            command_rx: w.command_rx,
            primary_ready: None,
            cancel: w.cancel.clone(),
        });
        handler.attach_primary(stream, leftover, host_peer(&welcome.host_name, remote))?;
        let handle = tokio::spawn(handler.run());

        let mut player_names = vec![String::new(); usize::from(local_port) + 1];
        player_names[usize::from(HOST_PORT)] = welcome.host_name.clone();
        player_names[usize::from(local_port)] = settings.player_name.clone();
        start_recording(
            &w.provider,
            &settings,
            ReplayHeader {
                delay: welcome.delay,
                game,
                game_name: welcome.game_name.clone(),
                active_ports: welcome.active_ports,
                player_names,
                match_code: settings.match_code.clone(),
            },
            welcome.session_token,
        )?;

        Ok(Session {
            info: SessionInfo {
                role: SessionRole::Client,
                peer_id: welcome.peer_id,
                local_port: Some(local_port),
                session_token: welcome.session_token,
                delay: welcome.delay,
                game,
                game_name: welcome.game_name,
                host_name: welcome.host_name,
                start_frame: welcome.start_frame,
            },
            provider: w.provider,
            events: w.events_rx,
            commands: w.command_tx,
            peers: w.peers,
            handler: Some(handle),
            cancel: w.cancel,
            local_addr: None,
        })
    }

    /// Watch the session hosted at `remote` without contributing input.
    pub async fn join_as_spectator(
        remote: SocketAddr,
        settings: NetplaySettings,
        game: GameIdentity,
    ) -> Result<Session, NetplayError> {
        let hello = hello(&settings, game, JoinRole::Spectator);
        let mut stream = transport::dial(remote, settings.handshake_timeout()).await?;
        let (welcome, leftover) =
            handshake::client_handshake(&mut stream, &hello, settings.handshake_timeout()).await?;
        info!(
            start_frame = welcome.start_frame,
            host = %welcome.host_name,
            "Spectating netplay session"
        );

        let sync = FrameSynchronizer::spectating(
            sync_options(welcome.delay, &settings),
            welcome.active_ports,
            welcome.start_frame,
        );
        let w = wire(sync, &settings, false);
        let mut handler = SessionHandler::new(HandlerInit {
            role: LocalRole::Spectator,
            settings: settings.clone(),
            game,
            delay: welcome.delay,
            local_peer_id: welcome.peer_id,
            provider: w.provider.clone(),
            peers: w.peers.clone(),
            events: w.events_tx.clone(),
            command_tx: w.command_tx.clone(),
            command_rx: w.command_rx,
            primary_ready: None,
            cancel: w.cancel.clone(),
        });
        handler.attach_primary(stream, leftover, host_peer(&welcome.host_name, remote))?;
        let handle = tokio::spawn(handler.run());

        Ok(Session {
            info: SessionInfo {
                role: SessionRole::Spectator,
                peer_id: welcome.peer_id,
                local_port: None,
                session_token: welcome.session_token,
                delay: welcome.delay,
                game,
                game_name: welcome.game_name,
                host_name: welcome.host_name,
                start_frame: welcome.start_frame,
            },
            provider: w.provider,
            events: w.events_rx,
            commands: w.command_tx,
            peers: w.peers,
            handler: Some(handle),
            cancel: w.cancel,
            local_addr: None,
        })
    }

    /// Resolve `settings.match_code` through the matchmaking server, then
    /// connect or spectate according to `settings.role`.
    pub async fn connect_with_code(
        settings: NetplaySettings,
        game: GameIdentity,
    ) -> Result<Session, NetplayError> {
        if settings.match_code.is_empty() {
            return Err(NetplayError::InvalidConfig(
                "a match code is required".to_string(),
            ));
        }
        let server = matchmaking::resolve_server(&settings.matchmaking_addr).await?;
        let remote =
            matchmaking::lookup(server, &settings.match_code, settings.handshake_timeout()).await?;
        match settings.role {
            SessionRole::Spectator => Self::join_as_spectator(remote, settings, game).await,
            _ => Self::connect(remote, settings, game).await,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Listening address, for hosts.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn provider(&self) -> Arc<SharedInputProvider> {
        self.provider.clone()
    }

    /// Advance by at most one frame. See [`SharedInputProvider::tick`].
    pub fn tick(&self, local: &mut dyn LocalInputSource) -> Result<FrameStep, NetplayError> {
        self.provider.tick(local)
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.lock().values().cloned().collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    pub fn is_closed(&self) -> bool {
        self.provider.is_closed()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Notify every peer, close the session and finish any recording.
    pub async fn disconnect(mut self) -> Result<(), NetplayError> {
        let provider = self.provider.clone();
        let recorded = tokio::task::spawn_blocking(move || provider.finish_recording())
            .await
            .map_err(std::io::Error::other)??;
        if let Some(frames) = recorded {
            info!(frames, "Replay finalized");
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(HandlerCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(handle) = self.handler.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn host_peer(name: &str, addr: SocketAddr) -> Peer {
    Peer {
        peer_id: HOST_PEER_ID,
        name: name.to_string(),
        addr,
        role: PeerRole::Host,
        state: PeerState::Connected,
        ack_frame: 0,
        rtt_ms: None,
    }
}
