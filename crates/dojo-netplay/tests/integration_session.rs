use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dojo_netplay::{
    CloseReason, FrameStep, GameIdentity, HostListener, NetplayError, NetplaySettings,
    PortInputState, ResolvedFrame, Session, SessionEvent, SharedInputProvider, digest_game,
};
use dojo_netproto::{
    codec_tcp::{encode_tcp_message, try_decode_tcp_frames},
    constants::VERSION,
    header::Header,
    messages::session::{DisconnectReason, Hello, JoinRole, RejectReason, Welcome},
    msg_id::MsgId,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const HOST_SEED: u16 = 0x0100;
const GUEST_SEED: u16 = 0x0200;

fn settings() -> NetplaySettings {
    NetplaySettings {
        base_delay: 2,
        // Pure wait keeps both sides bit-identical regardless of scheduling.
        backfill_depth: 0,
        frame_wait_ms: 50,
        handshake_timeout_ms: 2000,
        reconnect_timeout_ms: 200,
        max_reconnect_attempts: 1,
        ..NetplaySettings::default()
    }
}

fn game() -> GameIdentity {
    digest_game(b"integration test rom")
}

async fn pair(
    host_settings: NetplaySettings,
    guest_settings: NetplaySettings,
) -> anyhow::Result<(Session, Session)> {
    let listener = HostListener::bind("127.0.0.1:0".parse()?, host_settings, game()).await?;
    let addr = listener.local_addr();
    let host = tokio::spawn(listener.accept_primary());
    let guest = Session::connect(addr, guest_settings, game()).await?;
    let host = timeout(Duration::from_secs(5), host).await???;
    Ok((host, guest))
}

/// Tick until `frames` frames resolve. Local input counts up from `seed`.
fn run_frames(provider: Arc<SharedInputProvider>, frames: usize, seed: u16) -> Vec<ResolvedFrame> {
    let mut n = 0u16;
    let mut local = move |_port: u8| {
        n = n.wrapping_add(1);
        PortInputState {
            buttons: seed ^ n,
            axes: [0; 4],
        }
    };
    let mut out = Vec::with_capacity(frames);
    while out.len() < frames {
        match provider.tick(&mut local).unwrap() {
            FrameStep::Frame(frame, _) => out.push(frame),
            FrameStep::Waiting => {}
            other => panic!("unexpected step {other:?}"),
        }
    }
    out
}

async fn wait_closed(session: &mut Session) -> anyhow::Result<CloseReason> {
    loop {
        match timeout(Duration::from_secs(5), session.next_event()).await? {
            Some(SessionEvent::Closed { reason }) => return Ok(reason),
            Some(_) => {}
            None => anyhow::bail!("event stream ended"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn host_and_guest_resolve_identical_frames() -> anyhow::Result<()> {
    let (host, guest) = pair(settings(), settings()).await?;
    assert_eq!(host.info().local_port, Some(0));
    assert_eq!(guest.info().local_port, Some(1));
    assert_eq!(guest.info().session_token, host.info().session_token);

    let hp = host.provider();
    let gp = guest.provider();
    let host_run = tokio::task::spawn_blocking(move || run_frames(hp, 60, HOST_SEED));
    let guest_run = tokio::task::spawn_blocking(move || run_frames(gp, 60, GUEST_SEED));
    let host_frames = timeout(Duration::from_secs(20), host_run).await??;
    let guest_frames = timeout(Duration::from_secs(20), guest_run).await??;

    assert_eq!(host_frames, guest_frames);
    for (i, f) in host_frames.iter().enumerate() {
        assert_eq!(f.frame, i as u64);
        assert_eq!(f.substituted, 0);
        if i < 2 {
            assert_eq!(f.port(0), PortInputState::NEUTRAL);
            assert_eq!(f.port(1), PortInputState::NEUTRAL);
        } else {
            // Sample taken on tick i - 2 lands on frame i.
            let n = (i - 1) as u16;
            assert_eq!(f.port(0).buttons, HOST_SEED ^ n);
            assert_eq!(f.port(1).buttons, GUEST_SEED ^ n);
        }
        assert_eq!(f.port(2), PortInputState::NEUTRAL);
    }

    host.disconnect().await?;
    guest.disconnect().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_game_is_rejected() -> anyhow::Result<()> {
    let listener = HostListener::bind("127.0.0.1:0".parse()?, settings(), game()).await?;
    let addr = listener.local_addr();
    let host = tokio::spawn(listener.accept_primary());

    let err = Session::connect(addr, settings(), digest_game(b"another rom"))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        NetplayError::HandshakeMismatch(RejectReason::GameMismatch)
    ));
    host.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_delay_is_rejected() -> anyhow::Result<()> {
    let listener = HostListener::bind("127.0.0.1:0".parse()?, settings(), game()).await?;
    let addr = listener.local_addr();
    let host = tokio::spawn(listener.accept_primary());

    let mut guest = settings();
    guest.base_delay = 4;
    let err = Session::connect(addr, guest, game()).await.err().unwrap();
    assert!(matches!(
        err,
        NetplayError::HandshakeMismatch(RejectReason::DelayMismatch)
    ));
    host.abort();
    Ok(())
}

async fn raw_join(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    let hello = Hello {
        proto_version: VERSION,
        role: JoinRole::Player,
        match_code: String::new(),
        game: game(),
        delay: settings().delay_config(),
        player_name: "raw".to_string(),
        resume_token: None,
    };
    stream
        .write_all(&encode_tcp_message(Header::new(MsgId::Hello as u8), &hello)?)
        .await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(2), stream.read(&mut chunk)).await??;
        anyhow::ensure!(n > 0, "host closed during handshake");
        buf.extend_from_slice(&chunk[..n]);
        let (frames, _) = try_decode_tcp_frames(&buf)?;
        if let Some(first) = frames.first() {
            let welcome: Welcome = first.message()?;
            assert_eq!(welcome.local_port, Some(1));
            return Ok(stream);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_packet_closes_session_once() -> anyhow::Result<()> {
    let listener = HostListener::bind("127.0.0.1:0".parse()?, settings(), game()).await?;
    let addr = listener.local_addr();
    let host = tokio::spawn(listener.accept_primary());

    let mut raw = raw_join(addr).await?;
    let mut host = timeout(Duration::from_secs(5), host).await???;

    // Valid length prefix, garbage header.
    let mut garbage = 30u32.to_le_bytes().to_vec();
    garbage.extend_from_slice(&[0xFF; 30]);
    raw.write_all(&garbage).await?;

    let reason = wait_closed(&mut host).await?;
    assert!(matches!(reason, CloseReason::ProtocolError(_)));
    assert!(host.is_closed());

    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(event) = host.try_next_event() {
        assert!(!matches!(event, SessionEvent::Closed { .. }));
    }

    let mut local = |_port: u8| PortInputState::NEUTRAL;
    assert!(matches!(
        host.tick(&mut local),
        Err(NetplayError::SessionClosed)
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn spectator_sees_the_same_frames() -> anyhow::Result<()> {
    let listener = HostListener::bind("127.0.0.1:0".parse()?, settings(), game()).await?;
    let addr = listener.local_addr();
    let host = tokio::spawn(listener.accept_primary());
    let guest = Session::connect(addr, settings(), game()).await?;
    let mut host = timeout(Duration::from_secs(5), host).await???;

    let spectator = Session::join_as_spectator(addr, settings(), game()).await?;
    assert_eq!(spectator.info().local_port, None);
    assert_eq!(spectator.info().start_frame, 0);

    loop {
        match timeout(Duration::from_secs(5), host.next_event()).await? {
            Some(SessionEvent::SpectatorJoined { .. }) => break,
            Some(_) => {}
            None => anyhow::bail!("event stream ended"),
        }
    }

    let hp = host.provider();
    let gp = guest.provider();
    let sp = spectator.provider();
    let host_run = tokio::task::spawn_blocking(move || run_frames(hp, 30, HOST_SEED));
    let guest_run = tokio::task::spawn_blocking(move || run_frames(gp, 30, GUEST_SEED));
    let spec_run = tokio::task::spawn_blocking(move || run_frames(sp, 30, 0));

    let host_frames = timeout(Duration::from_secs(20), host_run).await??;
    let guest_frames = timeout(Duration::from_secs(20), guest_run).await??;
    let spec_frames = timeout(Duration::from_secs(20), spec_run).await??;

    assert_eq!(host_frames, guest_frames);
    assert_eq!(
        spec_frames.iter().map(|f| (f.frame, f.inputs)).collect::<Vec<_>>(),
        host_frames.iter().map(|f| (f.frame, f.inputs)).collect::<Vec<_>>()
    );

    spectator.disconnect().await?;
    guest.disconnect().await?;
    host.disconnect().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_notifies_the_peer() -> anyhow::Result<()> {
    let (host, mut guest) = pair(settings(), settings()).await?;
    host.disconnect().await?;

    let reason = wait_closed(&mut guest).await?;
    assert_eq!(
        reason,
        CloseReason::PeerDisconnected(DisconnectReason::UserQuit)
    );
    assert!(guest.is_closed());
    Ok(())
}
