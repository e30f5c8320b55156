//! Netplay settings.
//!
//! The external configuration layer hands these over read-only. They can be
//! flattened into a front end's CLI with `#[command(flatten)]` or deserialized
//! from any serde format.

use std::time::Duration;

use clap::{Args, ValueEnum};
use dojo_netproto::messages::session::DelayConfig;
use serde::{Deserialize, Serialize};

use crate::{error::NetplayError, sync::BackfillOverflow};

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:6000";
pub const DEFAULT_SPECTATOR_ADDR: &str = "127.0.0.1:7000";
pub const DEFAULT_LOBBY_ADDR: &str = "26.255.255.255";
pub const DEFAULT_LOBBY_PORT: u16 = 52001;
pub const DEFAULT_MATCHMAKING_ADDR: &str = "match.dojo.ooo:52001";

/// Which side of a session this instance plays.
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    #[default]
    Host,
    Client,
    Spectator,
}

#[derive(Args, Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NetplaySettings {
    /// Enable netplay
    #[arg(long = "netplay", default_value_t = false)]
    pub enabled: bool,

    /// Act as host, client or spectator
    #[arg(long, value_enum, default_value_t = SessionRole::Host)]
    pub role: SessionRole,

    /// Host: address to listen on. Client: address to connect to.
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    pub server_addr: String,

    /// Frames of input delay applied to every local sample
    #[arg(long, default_value_t = 1)]
    pub base_delay: u8,

    /// Redundant sends per local sample
    #[arg(long, default_value_t = 2)]
    pub packets_per_frame: u8,

    /// Consecutive missing frames substituted before the overflow policy applies (0 = wait)
    #[arg(long, default_value_t = 3)]
    pub backfill_depth: u8,

    /// Inbound queue capacity per port, in frames
    #[arg(long, default_value_t = 1800)]
    pub rx_buffer_frames: u32,

    /// What to do once a backfill streak exceeds the depth
    #[arg(long, value_enum, default_value_t = BackfillOverflow::Repeat)]
    pub backfill_overflow: BackfillOverflow,

    /// Longest the tick waits for remote input before backfilling, in ms
    #[arg(long, default_value_t = 16)]
    pub frame_wait_ms: u64,

    /// Host: accept spectators on the session listener
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_spectators: bool,

    /// Spectator: host address to watch
    #[arg(long, default_value = DEFAULT_SPECTATOR_ADDR)]
    pub spectator_addr: String,

    /// Announce hosted sessions on the LAN
    #[arg(long, default_value_t = false)]
    pub lobby_enabled: bool,

    /// Lobby group (multicast) or broadcast address
    #[arg(long, default_value = DEFAULT_LOBBY_ADDR)]
    pub lobby_addr: String,

    #[arg(long, default_value_t = DEFAULT_LOBBY_PORT)]
    pub lobby_port: u16,

    #[arg(long, default_value_t = 1000)]
    pub lobby_announce_interval_ms: u64,

    /// Publish/look up the host through the matchmaking directory
    #[arg(long, default_value_t = false)]
    pub matchmaking_enabled: bool,

    #[arg(long, default_value = DEFAULT_MATCHMAKING_ADDR)]
    pub matchmaking_addr: String,

    /// Short code shared between players
    #[arg(long, default_value = "")]
    pub match_code: String,

    #[arg(long, default_value = "Player")]
    pub player_name: String,

    #[arg(long, default_value = "")]
    pub game_name: String,

    /// Write every resolved frame to `replay_path`
    #[arg(long, default_value_t = false)]
    pub record_matches: bool,

    #[arg(long)]
    pub replay_path: Option<std::path::PathBuf>,

    #[arg(long, default_value_t = 3)]
    pub max_reconnect_attempts: u32,

    #[arg(long, default_value_t = 2000)]
    pub reconnect_timeout_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub handshake_timeout_ms: u64,
}

impl Default for NetplaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            role: SessionRole::Host,
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            base_delay: 1,
            packets_per_frame: 2,
            backfill_depth: 3,
            rx_buffer_frames: 1800,
            backfill_overflow: BackfillOverflow::Repeat,
            frame_wait_ms: 16,
            allow_spectators: true,
            spectator_addr: DEFAULT_SPECTATOR_ADDR.to_string(),
            lobby_enabled: false,
            lobby_addr: DEFAULT_LOBBY_ADDR.to_string(),
            lobby_port: DEFAULT_LOBBY_PORT,
            lobby_announce_interval_ms: 1000,
            matchmaking_enabled: false,
            matchmaking_addr: DEFAULT_MATCHMAKING_ADDR.to_string(),
            match_code: String::new(),
            player_name: "Player".to_string(),
            game_name: String::new(),
            record_matches: false,
            replay_path: None,
            max_reconnect_attempts: 3,
            reconnect_timeout_ms: 2000,
            handshake_timeout_ms: 5000,
        }
    }
}

impl NetplaySettings {
    pub fn delay_config(&self) -> DelayConfig {
        DelayConfig {
            base_delay: self.base_delay,
            packets_per_frame: self.packets_per_frame,
            backfill_depth: self.backfill_depth,
            rx_buffer_frames: self.rx_buffer_frames,
        }
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    /// How long a host holds a dropped player's slot.
    pub fn reconnect_window(&self) -> Duration {
        self.reconnect_timeout() * self.max_reconnect_attempts.max(1)
    }

    pub fn lobby_interval(&self) -> Duration {
        Duration::from_millis(self.lobby_announce_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), NetplayError> {
        validate_delay(&self.delay_config())
    }
}

pub fn validate_delay(delay: &DelayConfig) -> Result<(), NetplayError> {
    if delay.packets_per_frame == 0 {
        return Err(NetplayError::InvalidConfig(
            "packets_per_frame must be at least 1".into(),
        ));
    }
    if delay.rx_buffer_frames == 0 {
        return Err(NetplayError::InvalidConfig(
            "rx_buffer_frames must be at least 1".into(),
        ));
    }
    let window = u32::from(delay.base_delay) + u32::from(delay.backfill_depth);
    if delay.rx_buffer_frames <= window {
        return Err(NetplayError::InvalidConfig(format!(
            "rx_buffer_frames ({}) must exceed base_delay + backfill_depth ({window})",
            delay.rx_buffer_frames
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        netplay: NetplaySettings,
    }

    #[test]
    fn cli_defaults_match_default_impl() {
        let parsed = Cli::parse_from(["dojo"]).netplay;
        let default = NetplaySettings::default();
        assert_eq!(parsed.delay_config(), default.delay_config());
        assert_eq!(parsed.server_addr, default.server_addr);
        assert_eq!(parsed.lobby_port, 52001);
        assert_eq!(parsed.backfill_overflow, BackfillOverflow::Repeat);
        assert!(parsed.allow_spectators);
        assert_eq!(parsed.player_name, "Player");
    }

    #[test]
    fn cli_overrides_delay() {
        let parsed = Cli::parse_from([
            "dojo",
            "--netplay",
            "--role",
            "client",
            "--base-delay",
            "3",
            "--backfill-overflow",
            "stall",
        ])
        .netplay;
        assert!(parsed.enabled);
        assert_eq!(parsed.role, SessionRole::Client);
        assert_eq!(parsed.delay_config().base_delay, 3);
        assert_eq!(parsed.backfill_overflow, BackfillOverflow::Stall);
    }

    #[test]
    fn validation_rejects_degenerate_delay() {
        let mut s = NetplaySettings::default();
        assert!(s.validate().is_ok());

        s.packets_per_frame = 0;
        assert!(matches!(s.validate(), Err(NetplayError::InvalidConfig(_))));

        s.packets_per_frame = 1;
        s.rx_buffer_frames = 4;
        assert!(matches!(s.validate(), Err(NetplayError::InvalidConfig(_))));
    }
}
