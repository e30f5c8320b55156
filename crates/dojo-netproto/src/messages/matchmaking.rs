use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Host -> directory: publish the listening port under `code`.
///
/// The directory pairs the port with the address it observed the request from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchRegister {
    pub code: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchRegistered {
    pub code: String,
    pub ttl_secs: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchQuery {
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchAddress {
    pub code: String,
    pub addr: Option<SocketAddr>,
}
