use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Periodic LAN announcement of a hosted session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub host_addr: SocketAddr,
    pub game_name: String,
    pub player_name: String,
}
