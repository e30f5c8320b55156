//! Recording resolved input and replaying it.
//!
//! The recorder only observes resolved frames; the player substitutes the log
//! for the network and hands frames back in order without re-validating them.

pub mod format;
pub mod player;
pub mod recorder;

use thiserror::Error;

pub use format::{ReplayHeader, ReplayLog, ReplayRecord, ReplayWriter};
pub use player::{PlaybackStep, ReplayPlayer};
pub use recorder::Recorder;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a replay file")]
    BadMagic,

    #[error("unsupported replay version {0}")]
    UnsupportedVersion(u8),

    #[error("replay truncated")]
    Truncated,

    #[error("replay header of {0} bytes exceeds the limit")]
    HeaderTooLarge(usize),

    #[error("replay record for invalid port {0}")]
    InvalidPort(u8),

    #[error("replay header: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("recorder thread stopped")]
    RecorderStopped,
}
