//! Session handler: owns every connection of a session and moves packets
//! between them and the tick-side input provider.
//!
//! One task per session. It reacts to channel events, commands from the tick
//! thread and the accept loop, a keepalive timer and the reconnect deadline.

use std::{collections::HashMap, net::SocketAddr, ops::ControlFlow, sync::Arc, time::Duration};

use bytes::BytesMut;
use dojo_netproto::{
    codec_tcp::{encode_tcp_input, encode_tcp_message},
    header::Header,
    input::InputPacket,
    messages::{
        Message,
        session::{
            DelayConfig, Disconnect, DisconnectReason, GameIdentity, Hello, ResyncReq, Welcome,
        },
        sync::{Ping, Pong},
    },
    msg_id::MsgId,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::NetplaySettings,
    error::{CloseReason, NetplayError},
    handshake::{self, Admission, HostTerms, PrimarySlot, validate_hello},
    identity::identity_hex,
    input_provider::SharedInputProvider,
    session::{GUEST_PORT, Peer, PeerRole, PeerState, PeerTable, SessionEvent},
    sync::{PortSource, ResolvedFrame},
    transport::{self, Backpressure, ChannelEvent, ChannelHandle, ConnId, LinkClosed},
};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

const CHANNEL_EVENT_DEPTH: usize = 1024;

#[derive(Debug)]
pub(crate) enum HandlerCommand {
    /// Local sample from the tick thread.
    SendInput(InputPacket),
    /// Resolved frame to forward to spectators.
    Relay(ResolvedFrame),
    /// The provider closed itself (backfill exhausted).
    ProviderClosed(CloseReason),
    /// A connection that completed its `Hello`.
    Admit {
        stream: TcpStream,
        hello: Hello,
        leftover: BytesMut,
    },
    /// Outcome of a client-side reconnect attempt.
    Reattached(Result<(TcpStream, Welcome, BytesMut), NetplayError>),
    Shutdown(oneshot::Sender<()>),
}

/// What this end of the session is.
#[derive(Debug, Clone)]
pub(crate) enum LocalRole {
    Host {
        session_token: u64,
        host_name: String,
        game_name: String,
    },
    Client {
        remote: SocketAddr,
        hello: Hello,
        session_token: u64,
    },
    Spectator,
}

struct Link {
    peer_id: u32,
    channel: ChannelHandle,
    spectator: bool,
}

pub(crate) struct HandlerInit {
    pub role: LocalRole,
    pub settings: NetplaySettings,
    pub game: GameIdentity,
    pub delay: DelayConfig,
    pub local_peer_id: u32,
    pub provider: Arc<SharedInputProvider>,
    pub peers: PeerTable,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub command_tx: mpsc::UnboundedSender<HandlerCommand>,
    pub command_rx: mpsc::UnboundedReceiver<HandlerCommand>,
    pub primary_ready: Option<oneshot::Sender<()>>,
    pub cancel: CancellationToken,
}

pub(crate) struct SessionHandler {
    role: LocalRole,
    settings: NetplaySettings,
    game: GameIdentity,
    delay: DelayConfig,
    local_peer_id: u32,
    provider: Arc<SharedInputProvider>,
    peers: PeerTable,
    events: mpsc::UnboundedSender<SessionEvent>,
    command_tx: mpsc::UnboundedSender<HandlerCommand>,
    command_rx: mpsc::UnboundedReceiver<HandlerCommand>,
    channel_tx: mpsc::Sender<ChannelEvent>,
    channel_rx: mpsc::Receiver<ChannelEvent>,

    links: HashMap<ConnId, Link>,
    /// Live link to the other player (or, for spectators, to the host).
    primary: Option<ConnId>,
    /// Peer id of the other player; kept while it is reconnecting.
    primary_peer: Option<u32>,
    next_peer_id: u32,
    reconnect_deadline: Option<Instant>,
    primary_ready: Option<oneshot::Sender<()>>,
    shutdown_ack: Option<oneshot::Sender<()>>,

    seq: u32,
    started: std::time::Instant,
    cancel: CancellationToken,
}

impl SessionHandler {
    pub(crate) fn new(init: HandlerInit) -> Self {
        let (channel_tx, channel_rx) = mpsc::channel(CHANNEL_EVENT_DEPTH);
        Self {
            next_peer_id: init.local_peer_id + 1,
            role: init.role,
            settings: init.settings,
            game: init.game,
            delay: init.delay,
            local_peer_id: init.local_peer_id,
            provider: init.provider,
            peers: init.peers,
            events: init.events,
            command_tx: init.command_tx,
            command_rx: init.command_rx,
            channel_tx,
            channel_rx,
            links: HashMap::new(),
            primary: None,
            primary_peer: None,
            reconnect_deadline: None,
            primary_ready: init.primary_ready,
            shutdown_ack: None,
            seq: 0,
            started: std::time::Instant::now(),
            cancel: init.cancel,
        }
    }

    /// Install the already-handshaken link to the host (client and spectator).
    pub(crate) fn attach_primary(
        &mut self,
        stream: TcpStream,
        leftover: BytesMut,
        peer: Peer,
    ) -> Result<(), NetplayError> {
        let channel = transport::spawn_channel(stream, leftover, self.channel_tx.clone(), &self.cancel)?;
        let conn = channel.conn_id();
        self.links.insert(
            conn,
            Link {
                peer_id: peer.peer_id,
                channel,
                spectator: false,
            },
        );
        self.primary = Some(conn);
        self.primary_peer = Some(peer.peer_id);
        self.peers.lock().insert(peer.peer_id, peer);
        Ok(())
    }

    /// Run the handler loop until the session closes.
    pub(crate) async fn run(mut self) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.reconnect_deadline;
            // Network events first: they unblock the tick thread.
            let flow = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => ControlFlow::Break(()),
                Some(event) = self.channel_rx.recv() => match event {
                    ChannelEvent::Packet { conn_id, packet } => self.handle_packet(conn_id, packet),
                    ChannelEvent::Closed { conn_id, cause } => self.handle_closed(conn_id, cause),
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => ControlFlow::Break(()),
                },
                _ = keepalive.tick() => {
                    self.send_pings();
                    ControlFlow::Continue(())
                }
                _ = sleep_until_opt(deadline) => {
                    warn!("Peer did not reconnect in time");
                    self.close_session(CloseReason::ConnectionLost(
                        "peer did not reconnect in time".to_string(),
                    ))
                }
            };
            if flow.is_break() {
                break;
            }
        }

        self.teardown();
    }

    fn handle_command(&mut self, cmd: HandlerCommand) -> ControlFlow<()> {
        match cmd {
            HandlerCommand::SendInput(packet) => {
                self.send_input(packet);
                ControlFlow::Continue(())
            }
            HandlerCommand::Relay(frame) => {
                self.relay(&frame);
                ControlFlow::Continue(())
            }
            HandlerCommand::ProviderClosed(reason) => {
                self.notify_all(disconnect_reason(&reason));
                ControlFlow::Break(())
            }
            HandlerCommand::Admit {
                stream,
                hello,
                leftover,
            } => {
                self.admit(stream, hello, leftover);
                ControlFlow::Continue(())
            }
            HandlerCommand::Reattached(result) => self.reattached(result),
            HandlerCommand::Shutdown(ack) => {
                info!("Local disconnect requested");
                self.shutdown_ack = Some(ack);
                self.close_session(CloseReason::LocalDisconnect)
            }
        }
    }

    // ==================== outgoing ====================

    fn header(&mut self, msg: MsgId) -> Header {
        self.seq = self.seq.wrapping_add(1);
        let mut header = Header::new(msg as u8);
        header.peer_id = self.local_peer_id;
        header.seq = self.seq;
        header.ack_frame = self.provider.next_frame();
        header
    }

    fn send_message<M: Message>(&mut self, conn: ConnId, msg: &M) -> Result<(), Backpressure> {
        let header = self.header(M::msg_id());
        let bytes = match encode_tcp_message(header, msg) {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", M::msg_id(), e);
                return Ok(());
            }
        };
        match self.links.get(&conn) {
            Some(link) => link.channel.try_send(bytes),
            None => Err(Backpressure::Closed),
        }
    }

    fn send_input(&mut self, packet: InputPacket) {
        let Some(conn) = self.primary else {
            trace!(frame = packet.frame, "No live link; input left for resync");
            return;
        };
        if matches!(self.role, LocalRole::Spectator) {
            return;
        }
        for sub in 0..self.delay.packets_per_frame.max(1) {
            let header = self.header(MsgId::Input);
            let bytes = match encode_tcp_input(header, MsgId::Input, &packet.with_sub_index(sub)) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to encode input: {}", e);
                    return;
                }
            };
            let Some(link) = self.links.get(&conn) else {
                return;
            };
            if let Err(Backpressure::Full) = link.channel.try_send(bytes) {
                // Redundant copies and resync cover a dropped send.
                trace!(frame = packet.frame, sub, "Send queue full; input copy dropped");
            }
        }
    }

    fn relay(&mut self, frame: &ResolvedFrame) {
        if !matches!(self.role, LocalRole::Host { .. }) {
            return;
        }
        let active = self.provider.active_ports();
        let spectators: Vec<ConnId> = self
            .links
            .iter()
            .filter(|(_, l)| l.spectator)
            .map(|(c, _)| *c)
            .collect();

        let mut too_slow = Vec::new();
        for conn in spectators {
            for port in (0..4u8).filter(|p| active & (1 << p) != 0) {
                let record = InputPacket::new(frame.frame, port, frame.port(port));
                let header = self.header(MsgId::Resolved);
                let Ok(bytes) = encode_tcp_input(header, MsgId::Resolved, &record) else {
                    continue;
                };
                let Some(link) = self.links.get(&conn) else {
                    break;
                };
                if let Err(Backpressure::Full) = link.channel.try_send(bytes) {
                    too_slow.push(conn);
                    break;
                }
            }
        }
        for conn in too_slow {
            warn!(conn, "Spectator cannot keep up; dropping it");
            self.drop_link(conn, "too slow");
        }
    }

    fn send_pings(&mut self) {
        let t_ms = self.started.elapsed().as_millis() as u32;
        let conns: Vec<ConnId> = self.links.keys().copied().collect();
        for conn in conns {
            let _ = self.send_message(conn, &Ping { t_ms });
        }
    }

    /// Send `Disconnect` to every link and close them after the flush.
    fn notify_all(&mut self, reason: DisconnectReason) {
        let conns: Vec<ConnId> = self.links.keys().copied().collect();
        for conn in conns {
            let _ = self.send_message(conn, &Disconnect { reason });
            if let Some(link) = self.links.remove(&conn) {
                link.channel.close();
            }
        }
    }

    // ==================== incoming ====================

    fn handle_packet(&mut self, conn: ConnId, packet: transport::PacketOwned) -> ControlFlow<()> {
        let Some(link) = self.links.get(&conn) else {
            return ControlFlow::Continue(());
        };
        let peer_id = link.peer_id;
        let is_primary = self.primary == Some(conn);
        if let Some(peer) = self.peers.lock().get_mut(&peer_id) {
            peer.ack_frame = peer.ack_frame.max(packet.header.ack_frame);
        }

        let view = packet.view();
        match packet.msg_id {
            MsgId::Input if is_primary && !matches!(self.role, LocalRole::Spectator) => {
                let input = match view.input() {
                    Ok(i) => i,
                    Err(e) => return self.protocol_violation(conn, e.to_string()),
                };
                if self.provider.source(input.port) != PortSource::Remote {
                    return self.protocol_violation(
                        conn,
                        format!("input for port {} not owned by peer", input.port),
                    );
                }
                let outcome = self.provider.push_remote(input);
                trace!(frame = input.frame, port = input.port, ?outcome, "remote input");
            }
            MsgId::Resolved if is_primary && matches!(self.role, LocalRole::Spectator) => {
                match view.input() {
                    Ok(input) => {
                        self.provider.push_remote(input);
                    }
                    Err(e) => return self.protocol_violation(conn, e.to_string()),
                }
            }
            MsgId::Ping => match view.message::<Ping>() {
                Ok(Ping { t_ms }) => {
                    let _ = self.send_message(conn, &Pong { t_ms });
                }
                Err(e) => return self.protocol_violation(conn, e.to_string()),
            },
            MsgId::Pong => match view.message::<Pong>() {
                Ok(Pong { t_ms }) => {
                    let now = self.started.elapsed().as_millis() as u32;
                    let rtt = now.wrapping_sub(t_ms);
                    debug!(peer_id, rtt_ms = rtt, "pong");
                    if let Some(peer) = self.peers.lock().get_mut(&peer_id) {
                        peer.rtt_ms = Some(rtt);
                    }
                }
                Err(e) => return self.protocol_violation(conn, e.to_string()),
            },
            MsgId::ResyncReq if is_primary && !matches!(self.role, LocalRole::Spectator) => {
                match view.message::<ResyncReq>() {
                    Ok(req) => self.resend_from(conn, req.from_frame),
                    Err(e) => return self.protocol_violation(conn, e.to_string()),
                }
            }
            MsgId::Disconnect => {
                let reason = match view.message::<Disconnect>() {
                    Ok(d) => d.reason,
                    Err(e) => return self.protocol_violation(conn, e.to_string()),
                };
                info!(peer_id, ?reason, "Peer disconnected");
                if is_primary {
                    if let Some(link) = self.links.remove(&conn) {
                        link.channel.close();
                    }
                    self.primary = None;
                    self.peer_left(peer_id, format!("{reason:?}"));
                    return self.close_session(CloseReason::PeerDisconnected(reason));
                }
                self.drop_link(conn, "left");
            }
            other => {
                return self.protocol_violation(conn, format!("unexpected {other:?} mid-session"));
            }
        }
        ControlFlow::Continue(())
    }

    fn resend_from(&mut self, conn: ConnId, from_frame: u64) {
        let packets = self.provider.local_inputs_since(from_frame);
        info!(from_frame, count = packets.len(), "Resending local input");
        for packet in packets {
            let header = self.header(MsgId::Input);
            let Ok(bytes) = encode_tcp_input(header, MsgId::Input, &packet) else {
                continue;
            };
            let Some(link) = self.links.get(&conn) else {
                return;
            };
            if link.channel.try_send(bytes).is_err() {
                warn!(from_frame, "Resync truncated by a full send queue");
                return;
            }
        }
    }

    fn protocol_violation(&mut self, conn: ConnId, detail: String) -> ControlFlow<()> {
        warn!(conn, "Protocol violation: {}", detail);
        if self.primary == Some(conn) {
            let _ = self.send_message(
                conn,
                &Disconnect {
                    reason: DisconnectReason::ProtocolError,
                },
            );
            if let Some(link) = self.links.remove(&conn) {
                link.channel.close();
            }
            self.primary = None;
            return self.close_session(CloseReason::ProtocolError(detail));
        }
        self.drop_link(conn, "protocol error");
        ControlFlow::Continue(())
    }

    fn handle_closed(&mut self, conn: ConnId, cause: LinkClosed) -> ControlFlow<()> {
        let Some(link) = self.links.remove(&conn) else {
            return ControlFlow::Continue(());
        };
        if self.primary != Some(conn) {
            self.peer_left(link.peer_id, format!("{cause:?}"));
            return ControlFlow::Continue(());
        }

        self.primary = None;
        match cause {
            LinkClosed::Protocol(detail) => {
                warn!("Primary link sent malformed data: {}", detail);
                self.close_session(CloseReason::ProtocolError(detail))
            }
            LinkClosed::Cancelled => self.close_session(CloseReason::ConnectionLost(
                "link closed locally".to_string(),
            )),
            LinkClosed::Eof | LinkClosed::Io(_) => self.begin_reconnect(link.peer_id, cause),
        }
    }

    // ==================== membership ====================

    fn admit(&mut self, stream: TcpStream, hello: Hello, leftover: BytesMut) {
        let LocalRole::Host {
            session_token,
            host_name,
            game_name,
        } = self.role.clone()
        else {
            warn!("Ignoring inbound connection on a non-host session");
            return;
        };

        let primary = match (self.primary, self.primary_peer) {
            (Some(_), _) => PrimarySlot::Taken,
            (None, Some(_)) => PrimarySlot::AwaitingResume(session_token),
            (None, None) => PrimarySlot::Open,
        };
        let terms = HostTerms {
            game: self.game,
            match_code: &self.settings.match_code,
            delay: self.delay,
            allow_spectators: self.settings.allow_spectators,
            primary,
        };
        let admission = match validate_hello(&terms, &hello) {
            Ok(a) => a,
            Err(reason) => {
                info!(
                    ?reason,
                    name = %hello.player_name,
                    peer_game = %identity_hex(&hello.game),
                    "Rejecting peer"
                );
                tokio::spawn(handshake::reject(stream, reason));
                return;
            }
        };

        let addr = match stream.peer_addr() {
            Ok(a) => a,
            Err(e) => {
                debug!("Joining peer vanished: {}", e);
                return;
            }
        };
        let peer_id = match (admission, self.primary_peer) {
            (Admission::Resume, Some(id)) => id,
            _ => {
                let id = self.next_peer_id;
                self.next_peer_id += 1;
                id
            }
        };

        let welcome = Welcome {
            session_token,
            peer_id,
            local_port: (admission != Admission::Spectator).then_some(GUEST_PORT),
            active_ports: self.provider.active_ports(),
            delay: self.delay,
            host_name,
            game_name,
            start_frame: self.provider.next_frame(),
        };
        let channel =
            match transport::spawn_channel(stream, leftover, self.channel_tx.clone(), &self.cancel) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to start channel for {}: {}", addr, e);
                    return;
                }
            };
        let conn = channel.conn_id();
        self.links.insert(
            conn,
            Link {
                peer_id,
                channel,
                spectator: admission == Admission::Spectator,
            },
        );
        if self.send_message(conn, &welcome).is_err() {
            self.drop_link(conn, "welcome not delivered");
            return;
        }

        match admission {
            Admission::Primary => {
                info!(peer_id, %addr, name = %hello.player_name, "Player joined");
                self.primary = Some(conn);
                self.primary_peer = Some(peer_id);
                self.insert_peer(peer_id, &hello.player_name, addr, PeerRole::Player {
                    port: GUEST_PORT,
                });
                let _ = self.events.send(SessionEvent::PeerJoined {
                    peer_id,
                    name: hello.player_name,
                    port: GUEST_PORT,
                });
                if let Some(ready) = self.primary_ready.take() {
                    let _ = ready.send(());
                }
            }
            Admission::Resume => {
                info!(peer_id, %addr, "Player reconnected");
                self.primary = Some(conn);
                self.reconnect_deadline = None;
                if let Some(peer) = self.peers.lock().get_mut(&peer_id) {
                    peer.addr = addr;
                    peer.state = PeerState::Connected;
                }
                let _ = self.events.send(SessionEvent::PeerReconnected { peer_id });
                let from_frame = self.provider.next_frame();
                let _ = self.send_message(conn, &ResyncReq { from_frame });
            }
            Admission::Spectator => {
                info!(peer_id, %addr, name = %hello.player_name, "Spectator joined");
                self.insert_peer(peer_id, &hello.player_name, addr, PeerRole::Spectator);
                let _ = self.events.send(SessionEvent::SpectatorJoined {
                    peer_id,
                    name: hello.player_name,
                });
            }
        }
    }

    fn insert_peer(&self, peer_id: u32, name: &str, addr: SocketAddr, role: PeerRole) {
        self.peers.lock().insert(
            peer_id,
            Peer {
                peer_id,
                name: name.to_string(),
                addr,
                role,
                state: PeerState::Connected,
                ack_frame: 0,
                rtt_ms: None,
            },
        );
    }

    fn drop_link(&mut self, conn: ConnId, why: &str) {
        if let Some(link) = self.links.remove(&conn) {
            link.channel.abort();
            self.peer_left(link.peer_id, why.to_string());
        }
    }

    fn peer_left(&mut self, peer_id: u32, reason: String) {
        if self.peers.lock().remove(&peer_id).is_some() {
            debug!(peer_id, %reason, "Peer removed");
            let _ = self.events.send(SessionEvent::PeerLeft { peer_id, reason });
        }
    }

    // ==================== reconnect ====================

    fn begin_reconnect(&mut self, peer_id: u32, cause: LinkClosed) -> ControlFlow<()> {
        let attempts = self.settings.max_reconnect_attempts;
        if attempts == 0 || matches!(self.role, LocalRole::Spectator) {
            return self.close_session(CloseReason::ConnectionLost(format!("{cause:?}")));
        }

        warn!(peer_id, ?cause, "Link to peer lost; waiting for reconnect");
        if let Some(peer) = self.peers.lock().get_mut(&peer_id) {
            peer.state = PeerState::Reconnecting;
        }
        let _ = self.events.send(SessionEvent::PeerReconnecting { peer_id });

        match &self.role {
            LocalRole::Host { .. } => {
                self.reconnect_deadline = Some(Instant::now() + self.settings.reconnect_window());
            }
            LocalRole::Client {
                remote,
                hello,
                session_token,
            } => {
                let mut hello = hello.clone();
                hello.resume_token = Some(*session_token);
                let remote = *remote;
                let connect_timeout = self.settings.reconnect_timeout();
                let handshake_timeout = self.settings.handshake_timeout();
                let tx = self.command_tx.clone();
                let cancel = self.cancel.child_token();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        r = reconnect(remote, hello, attempts, connect_timeout, handshake_timeout) => r,
                    };
                    let _ = tx.send(HandlerCommand::Reattached(result));
                });
            }
            LocalRole::Spectator => {}
        }
        ControlFlow::Continue(())
    }

    fn reattached(
        &mut self,
        result: Result<(TcpStream, Welcome, BytesMut), NetplayError>,
    ) -> ControlFlow<()> {
        let (stream, welcome, leftover) = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Reconnect failed: {}", e);
                return self.close_session(CloseReason::ConnectionLost(e.to_string()));
            }
        };
        let channel =
            match transport::spawn_channel(stream, leftover, self.channel_tx.clone(), &self.cancel) {
                Ok(c) => c,
                Err(e) => return self.close_session(CloseReason::ConnectionLost(e.to_string())),
            };
        let peer_id = self.primary_peer.unwrap_or(welcome.peer_id);
        let conn = channel.conn_id();
        self.links.insert(
            conn,
            Link {
                peer_id,
                channel,
                spectator: false,
            },
        );
        self.primary = Some(conn);
        if let Some(peer) = self.peers.lock().get_mut(&peer_id) {
            peer.state = PeerState::Connected;
        }
        info!(peer_id, "Reconnected to host");
        let _ = self.events.send(SessionEvent::PeerReconnected { peer_id });

        let from_frame = self.provider.next_frame();
        let _ = self.send_message(conn, &ResyncReq { from_frame });
        ControlFlow::Continue(())
    }

    // ==================== teardown ====================

    fn close_session(&mut self, reason: CloseReason) -> ControlFlow<()> {
        self.notify_all(disconnect_reason(&reason));
        self.provider.close(reason);
        ControlFlow::Break(())
    }

    fn teardown(&mut self) {
        for (_, link) in self.links.drain() {
            link.channel.close();
        }
        self.provider.close(CloseReason::LocalDisconnect);
        self.peers.lock().clear();
        self.cancel.cancel();
        if let Some(ack) = self.shutdown_ack.take() {
            let _ = ack.send(());
        }
        debug!("Session handler stopped");
    }
}

fn disconnect_reason(reason: &CloseReason) -> DisconnectReason {
    match reason {
        CloseReason::LocalDisconnect => DisconnectReason::UserQuit,
        CloseReason::PeerDisconnected(r) => *r,
        CloseReason::ProtocolError(_) => DisconnectReason::ProtocolError,
        CloseReason::ConnectionLost(_) | CloseReason::BackfillExhausted { .. } => {
            DisconnectReason::ConnectionLost
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Client side: redial the host and re-attach with the resume token.
async fn reconnect(
    remote: SocketAddr,
    hello: Hello,
    attempts: u32,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<(TcpStream, Welcome, BytesMut), NetplayError> {
    for attempt in 1..=attempts {
        let result = async {
            let mut stream = transport::dial(remote, connect_timeout).await?;
            let (welcome, leftover) =
                handshake::client_handshake(&mut stream, &hello, handshake_timeout).await?;
            Ok::<_, NetplayError>((stream, welcome, leftover))
        }
        .await;

        match result {
            Ok(r) => return Ok(r),
            Err(e @ NetplayError::HandshakeMismatch(_)) => return Err(e),
            Err(e) => {
                warn!(attempt, attempts, "Reconnect attempt failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100) * attempt).await;
            }
        }
    }
    Err(NetplayError::ConnectionLost(format!(
        "gave up after {attempts} reconnect attempts"
    )))
}
