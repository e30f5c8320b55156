pub mod framing;
pub mod rate_limit;
pub mod tcp;
