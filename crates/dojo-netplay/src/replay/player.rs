use tracing::debug;

use super::{ReplayHeader, ReplayLog};
use crate::{
    error::NetplayError,
    input_provider::{FrameSource, FrameStep, LocalInputSource},
    sync::ResolvedFrame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStep {
    Frame(ResolvedFrame),
    Paused,
    /// The log is exhausted. Not an error.
    EndOfReplay,
}

/// Drives the emulator from a [`ReplayLog`] instead of the network.
pub struct ReplayPlayer {
    log: ReplayLog,
    cursor: usize,
    paused: bool,
    step_pending: bool,
    perspective: u8,
}

impl ReplayPlayer {
    pub fn new(log: ReplayLog) -> Self {
        let perspective = (0..4u8)
            .find(|p| log.header.active_ports & (1 << p) != 0)
            .unwrap_or(0);
        Self {
            log,
            cursor: 0,
            paused: false,
            step_pending: false,
            perspective,
        }
    }

    pub fn header(&self) -> &ReplayHeader {
        &self.log.header
    }

    pub fn len(&self) -> usize {
        self.log.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.frames.is_empty()
    }

    /// Frame index the next call to [`next_frame`](Self::next_frame) returns.
    pub fn position(&self) -> Option<u64> {
        self.log.frames.get(self.cursor).map(|f| f.frame)
    }

    pub fn next_frame(&mut self) -> PlaybackStep {
        let Some(frame) = self.log.frames.get(self.cursor) else {
            return PlaybackStep::EndOfReplay;
        };
        if self.paused && !self.step_pending {
            return PlaybackStep::Paused;
        }
        self.step_pending = false;
        self.cursor += 1;
        PlaybackStep::Frame(*frame)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.step_pending = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Let exactly one frame through while paused.
    pub fn step(&mut self) {
        self.paused = true;
        self.step_pending = true;
    }

    /// Move the cursor to `frame`. Returns `false` if the log has no such frame.
    pub fn seek(&mut self, frame: u64) -> bool {
        match self.log.frames.binary_search_by_key(&frame, |f| f.frame) {
            Ok(idx) => {
                debug!(frame, "replay seek");
                self.cursor = idx;
                self.step_pending = false;
                true
            }
            Err(_) => false,
        }
    }

    /// Show the match from another recorded player's side.
    pub fn switch_perspective(&mut self, port: u8) -> bool {
        if port >= 4 || self.log.header.active_ports & (1 << port) == 0 {
            return false;
        }
        self.perspective = port;
        true
    }

    pub fn perspective(&self) -> u8 {
        self.perspective
    }

    pub fn perspective_name(&self) -> Option<&str> {
        self.log
            .header
            .player_names
            .get(self.perspective as usize)
            .map(String::as_str)
    }
}

impl FrameSource for ReplayPlayer {
    /// Recorded input replaces local sampling entirely.
    fn poll_frame(&mut self, _local: &mut dyn LocalInputSource) -> Result<FrameStep, NetplayError> {
        Ok(match self.next_frame() {
            PlaybackStep::Frame(frame) => FrameStep::Frame(frame, Vec::new()),
            PlaybackStep::Paused => FrameStep::Paused,
            PlaybackStep::EndOfReplay => FrameStep::EndOfReplay,
        })
    }
}

#[cfg(test)]
mod tests {
    use dojo_netproto::{
        constants::MAX_PORTS,
        input::PortInputState,
        messages::session::{DelayConfig, GameIdentity},
    };

    use super::*;

    fn player(frames: u64) -> ReplayPlayer {
        let frames = (0..frames)
            .map(|f| {
                let mut inputs = [PortInputState::NEUTRAL; MAX_PORTS];
                inputs[0].buttons = f as u16;
                inputs[1].buttons = 0x100 + f as u16;
                ResolvedFrame {
                    frame: f,
                    inputs,
                    substituted: 0,
                }
            })
            .collect();
        ReplayPlayer::new(ReplayLog {
            header: ReplayHeader {
                delay: DelayConfig::default(),
                game: GameIdentity::default(),
                game_name: "test".into(),
                active_ports: 0b0011,
                player_names: vec!["Host".into(), "Guest".into()],
                match_code: String::new(),
            },
            frames,
        })
    }

    fn frame_of(step: PlaybackStep) -> u64 {
        match step {
            PlaybackStep::Frame(f) => f.frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn plays_in_order_then_signals_end() {
        let mut p = player(3);
        assert_eq!(frame_of(p.next_frame()), 0);
        assert_eq!(frame_of(p.next_frame()), 1);
        assert_eq!(frame_of(p.next_frame()), 2);
        assert_eq!(p.next_frame(), PlaybackStep::EndOfReplay);
        assert_eq!(p.next_frame(), PlaybackStep::EndOfReplay);
    }

    #[test]
    fn pause_holds_and_step_advances_one() {
        let mut p = player(5);
        p.next_frame();
        p.pause();
        assert_eq!(p.next_frame(), PlaybackStep::Paused);
        assert_eq!(p.position(), Some(1));

        p.step();
        assert_eq!(frame_of(p.next_frame()), 1);
        assert_eq!(p.next_frame(), PlaybackStep::Paused);

        p.resume();
        assert_eq!(frame_of(p.next_frame()), 2);
    }

    #[test]
    fn seek_moves_cursor() {
        let mut p = player(10);
        assert!(p.seek(7));
        assert_eq!(frame_of(p.next_frame()), 7);
        assert!(p.seek(2));
        assert_eq!(frame_of(p.next_frame()), 2);
        assert!(!p.seek(10));
        assert_eq!(p.position(), Some(3));
    }

    #[test]
    fn end_of_replay_wins_over_pause() {
        let mut p = player(1);
        p.next_frame();
        p.pause();
        assert_eq!(p.next_frame(), PlaybackStep::EndOfReplay);
    }

    #[test]
    fn perspective_only_switches_to_recorded_ports() {
        let mut p = player(1);
        assert_eq!(p.perspective(), 0);
        assert!(p.switch_perspective(1));
        assert_eq!(p.perspective_name(), Some("Guest"));
        assert!(!p.switch_perspective(2));
        assert!(!p.switch_perspective(9));
        assert_eq!(p.perspective(), 1);
    }

    #[test]
    fn frame_source_ignores_local_input() {
        let mut p = player(2);
        let mut sampled = 0;
        let mut local = |_port: u8| {
            sampled += 1;
            PortInputState::NEUTRAL
        };
        assert!(matches!(
            p.poll_frame(&mut local).unwrap(),
            FrameStep::Frame(f, _) if f.frame == 0
        ));
        p.poll_frame(&mut local).unwrap();
        assert!(matches!(
            p.poll_frame(&mut local).unwrap(),
            FrameStep::EndOfReplay
        ));
        assert_eq!(sampled, 0);
    }
}
