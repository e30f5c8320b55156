use std::net::SocketAddr;
use std::time::Duration;

use dojo_matchd::{DirectoryConfig, run_directory};
use dojo_netplay::{
    GameIdentity, HostListener, NetplayError, NetplaySettings, Session, SessionRole, digest_game,
    matchmaking,
};
use tokio::{net::TcpListener, time::timeout};

const CODE: &str = "ARCADE7";

async fn spawn_directory() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = run_directory(listener, DirectoryConfig::default()).await;
    });
    Ok(addr)
}

fn settings(directory: SocketAddr, role: SessionRole) -> NetplaySettings {
    NetplaySettings {
        role,
        matchmaking_enabled: true,
        matchmaking_addr: directory.to_string(),
        match_code: CODE.to_string(),
        handshake_timeout_ms: 2000,
        ..NetplaySettings::default()
    }
}

fn game() -> GameIdentity {
    digest_game(b"matchmaking rom")
}

async fn wait_registered(directory: SocketAddr) -> anyhow::Result<SocketAddr> {
    for _ in 0..50 {
        match matchmaking::lookup(directory, CODE, Duration::from_secs(1)).await {
            Ok(addr) => return Ok(addr),
            Err(NetplayError::MatchNotFound(_)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("host never registered")
}

#[tokio::test(flavor = "multi_thread")]
async fn join_by_match_code() -> anyhow::Result<()> {
    let directory = spawn_directory().await?;

    let listener = HostListener::bind(
        "127.0.0.1:0".parse()?,
        settings(directory, SessionRole::Host),
        game(),
    )
    .await?;
    let host_addr = listener.local_addr();
    let host = tokio::spawn(listener.accept_primary());

    assert_eq!(wait_registered(directory).await?, host_addr);

    let guest = Session::connect_with_code(settings(directory, SessionRole::Client), game()).await?;
    let host = timeout(Duration::from_secs(5), host).await???;

    assert_eq!(guest.info().session_token, host.info().session_token);
    assert_eq!(guest.info().local_port, Some(1));

    guest.disconnect().await?;
    host.disconnect().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_code_is_not_found() -> anyhow::Result<()> {
    let directory = spawn_directory().await?;
    let err = Session::connect_with_code(settings(directory, SessionRole::Client), game())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, NetplayError::MatchNotFound(code) if code == CODE));
    Ok(())
}

#[tokio::test]
async fn empty_code_is_a_config_error() -> anyhow::Result<()> {
    let mut s = settings("127.0.0.1:1".parse()?, SessionRole::Client);
    s.match_code.clear();
    let err = Session::connect_with_code(s, game()).await.err().unwrap();
    assert!(matches!(err, NetplayError::InvalidConfig(_)));
    Ok(())
}
