use strum::FromRepr;

/// Packet kind tag carried in [`Header::msg_id`](crate::header::Header::msg_id).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum MsgId {
    Hello = 1,
    Welcome = 2,
    Reject = 3,
    Disconnect = 5,

    /// A peer's own input sample for one frame and port.
    Input = 20,
    /// A resolved input relayed by the host to spectators.
    Resolved = 21,

    Ping = 30,
    Pong = 31,

    ResyncReq = 40,

    Announce = 50,

    MatchRegister = 60,
    MatchRegistered = 61,
    MatchQuery = 62,
    MatchAddress = 63,
}

impl MsgId {
    /// Input-bearing kinds use the fixed record layout instead of postcard.
    pub const fn is_input(self) -> bool {
        matches!(self, MsgId::Input | MsgId::Resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::MsgId;

    #[test]
    fn unknown_tags_do_not_map() {
        assert_eq!(MsgId::from_repr(20), Some(MsgId::Input));
        assert_eq!(MsgId::from_repr(0), None);
        assert_eq!(MsgId::from_repr(4), None);
        assert_eq!(MsgId::from_repr(0xFF), None);
    }
}
