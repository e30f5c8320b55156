//! Wire format for dojo netplay.
//!
//! Every packet is `[Header][Payload]`. On TCP the packet is additionally
//! prefixed with its length (see [`codec_tcp`]); lobby announcements travel as
//! single UDP datagrams (see [`codec_udp`]).
//!
//! Input packets use the fixed 16-byte record in [`input`]; every other kind is
//! a postcard-encoded struct from [`messages`].

pub mod codec_tcp;
pub mod codec_udp;
pub mod constants;
pub mod error;
pub mod header;
pub mod input;
pub mod limits;
pub mod messages;
pub mod msg_id;
pub mod packet;

pub use error::ProtoError;
pub use header::Header;
pub use input::{InputPacket, PortInputState};
pub use msg_id::MsgId;
pub use packet::PacketView;
