use serde::de::DeserializeOwned;

use crate::{error::ProtoError, msg_id::MsgId};

pub mod lobby;
pub mod matchmaking;
pub mod session;
pub mod sync;

/// A postcard-encoded control message with a fixed kind tag.
pub trait Message: serde::Serialize + DeserializeOwned + Send + 'static {
    fn msg_id() -> MsgId;
}

macro_rules! impl_message {
    ($($ty:ty => $id:ident),* $(,)?) => {
        $(
            impl Message for $ty {
                fn msg_id() -> MsgId {
                    MsgId::$id
                }
            }
        )*
    };
}

impl_message! {
    session::Hello => Hello,
    session::Welcome => Welcome,
    session::Reject => Reject,
    session::Disconnect => Disconnect,
    session::ResyncReq => ResyncReq,
    sync::Ping => Ping,
    sync::Pong => Pong,
    lobby::Announce => Announce,
    matchmaking::MatchRegister => MatchRegister,
    matchmaking::MatchRegistered => MatchRegistered,
    matchmaking::MatchQuery => MatchQuery,
    matchmaking::MatchAddress => MatchAddress,
}

pub fn decode_message<M: Message>(payload: &[u8]) -> Result<M, ProtoError> {
    Ok(postcard::from_bytes(payload)?)
}
