//! The per-frame resolution state machine.
//!
//! `FrameSynchronizer` does no locking and no I/O; the input provider owns it
//! inside its critical section.

use std::collections::{BTreeMap, VecDeque};

use dojo_netproto::{
    constants::MAX_PORTS,
    input::{InputPacket, PortInputState},
};
use tracing::{debug, trace, warn};

use super::{
    BackfillOverflow, BackfillWindow, DesyncWarning, PortSource, ResolvedFrame, SlotState,
    SyncOptions, SyncStats,
};
use crate::error::NetplayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Buffered,
    /// A value for this (port, frame) is already buffered; the first one wins.
    Duplicate,
    /// The frame is already resolved.
    Late,
    /// The port is not fed from the network.
    Ignored,
    /// The frame lies past the receive window and was dropped.
    BeyondWindow,
}

#[derive(Debug)]
struct Lane {
    buffered: BTreeMap<u64, PortInputState>,
    window: BackfillWindow,
    /// Consecutive backfilled frames.
    streak: u32,
    streak_warned: bool,
}

impl Lane {
    fn new(depth: u8) -> Self {
        Self {
            buffered: BTreeMap::new(),
            window: BackfillWindow::new(depth),
            streak: 0,
            streak_warned: false,
        }
    }
}

#[derive(Debug)]
pub struct FrameSynchronizer {
    opts: SyncOptions,
    sources: [PortSource; MAX_PORTS],
    lanes: [Lane; MAX_PORTS],
    next_frame: u64,
    history: VecDeque<ResolvedFrame>,
    warnings: Vec<DesyncWarning>,
    stats: SyncStats,
}

impl FrameSynchronizer {
    /// A synchronizer for a player (host or client) starting at frame 0.
    ///
    /// Frames `0..base_delay` have no sampled input on any side, so every
    /// contributing lane starts with the neutral state for them.
    pub fn new(opts: SyncOptions, sources: [PortSource; MAX_PORTS]) -> Self {
        let mut sync = Self::starting_at(opts, sources, 0);
        let neutral = sync.opts.neutral;
        for (lane, source) in sync.lanes.iter_mut().zip(sources) {
            if source == PortSource::Inactive {
                continue;
            }
            for frame in 0..u64::from(opts.delay.base_delay) {
                lane.buffered.insert(frame, neutral);
            }
        }
        sync
    }

    /// A read-only synchronizer fed entirely by the host's resolved relay.
    ///
    /// Spectators never invent input, so backfill is disabled.
    pub fn spectating(mut opts: SyncOptions, active_ports: u8, start_frame: u64) -> Self {
        opts.delay.backfill_depth = 0;
        let mut sources = [PortSource::Inactive; MAX_PORTS];
        for (port, source) in sources.iter_mut().enumerate() {
            if active_ports & (1 << port) != 0 {
                *source = PortSource::Remote;
            }
        }
        Self::starting_at(opts, sources, start_frame)
    }

    fn starting_at(opts: SyncOptions, sources: [PortSource; MAX_PORTS], start_frame: u64) -> Self {
        let depth = opts.delay.backfill_depth;
        Self {
            opts,
            sources,
            lanes: std::array::from_fn(|_| Lane::new(depth)),
            next_frame: start_frame,
            history: VecDeque::new(),
            warnings: Vec::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.opts
    }

    pub fn source(&self, port: u8) -> PortSource {
        self.sources[port as usize]
    }

    /// Bit `n` set when port `n` is not inactive.
    pub fn active_ports(&self) -> u8 {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != PortSource::Inactive)
            .fold(0, |mask, (port, _)| mask | (1 << port))
    }

    /// The frame the next `resolve` call must name.
    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    pub fn last_resolved(&self) -> Option<u64> {
        self.next_frame.checked_sub(1)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    fn capacity(&self) -> usize {
        (self.opts.delay.rx_buffer_frames as usize).max(1)
    }

    /// Buffer a locally sampled state for `frame + base_delay`.
    ///
    /// Returns the packet to transmit. Sampling the same frame twice keeps the
    /// first value.
    pub fn submit_local(
        &mut self,
        port: u8,
        frame: u64,
        state: PortInputState,
    ) -> Result<InputPacket, NetplayError> {
        if self.sources.get(port as usize) != Some(&PortSource::Local) {
            return Err(NetplayError::NotLocalPort(port));
        }
        let target = frame + u64::from(self.opts.delay.base_delay);
        if target < self.next_frame {
            return Err(NetplayError::NotNextFrame {
                expected: self.next_frame,
                got: target,
            });
        }
        let kept = *self.lanes[port as usize]
            .buffered
            .entry(target)
            .or_insert(state);
        Ok(InputPacket::new(target, port, kept))
    }

    /// Buffer a packet received from the network.
    ///
    /// Only frames in `next_frame..next_frame + rx_buffer_frames` are kept, so
    /// a lane never evicts a frame that is still due. Overflow warnings belong
    /// to the inbound queues feeding this; drops here are only counted.
    pub fn ingest(&mut self, packet: InputPacket) -> IngestOutcome {
        let port = packet.port as usize;
        if self.sources.get(port) != Some(&PortSource::Remote) {
            debug!(port, frame = packet.frame, "ignoring input for non-remote port");
            return IngestOutcome::Ignored;
        }
        if packet.frame < self.next_frame {
            self.stats.late_packets += 1;
            trace!(port, frame = packet.frame, "late packet discarded");
            return IngestOutcome::Late;
        }

        let capacity = self.capacity() as u64;
        if packet.frame - self.next_frame >= capacity {
            self.stats.overflow_drops += 1;
            debug!(port, frame = packet.frame, capacity, "packet beyond receive window dropped");
            return IngestOutcome::BeyondWindow;
        }
        let lane = &mut self.lanes[port];
        if lane.buffered.contains_key(&packet.frame) {
            self.stats.duplicates += 1;
            return IngestOutcome::Duplicate;
        }
        lane.buffered.insert(packet.frame, packet.state);
        IngestOutcome::Buffered
    }

    /// Try to resolve `frame`, which must be [`next_frame`](Self::next_frame).
    ///
    /// Missing inputs are only backfilled when `due` is set. Either every port
    /// resolves and the frame is committed, or nothing changes and `Ok(None)`
    /// is returned.
    pub fn resolve(&mut self, frame: u64, due: bool) -> Result<Option<ResolvedFrame>, NetplayError> {
        if frame != self.next_frame {
            return Err(NetplayError::NotNextFrame {
                expected: self.next_frame,
                got: frame,
            });
        }

        let depth = u32::from(self.opts.delay.backfill_depth);
        let mut inputs = [self.opts.neutral; MAX_PORTS];
        let mut substituted = 0u8;

        for (port, lane) in self.lanes.iter().enumerate() {
            if self.sources[port] == PortSource::Inactive {
                continue;
            }
            if let Some(state) = lane.buffered.get(&frame) {
                inputs[port] = *state;
                continue;
            }
            if !due || depth == 0 {
                return Ok(None);
            }
            if lane.streak + 1 > depth {
                match self.opts.overflow {
                    BackfillOverflow::Repeat => {}
                    BackfillOverflow::Stall => return Ok(None),
                    BackfillOverflow::Disconnect => {
                        return Err(NetplayError::BackfillExhausted {
                            port: port as u8,
                            frame,
                        });
                    }
                }
            }
            inputs[port] = lane.window.latest().unwrap_or(self.opts.neutral);
            substituted |= 1 << port;
        }

        let capacity = self.capacity();
        for (port, lane) in self.lanes.iter_mut().enumerate() {
            if self.sources[port] == PortSource::Inactive {
                continue;
            }
            lane.buffered.remove(&frame);
            if substituted & (1 << port) != 0 {
                lane.streak += 1;
                self.stats.substitutions += 1;
                trace!(port, frame, streak = lane.streak, "backfilled");
                if lane.streak > depth && !lane.streak_warned {
                    lane.streak_warned = true;
                    warn!(port, frame, streak = lane.streak, "backfill streak exceeds depth");
                    self.warnings.push(DesyncWarning::BackfillStreak {
                        port: port as u8,
                        frame,
                        streak: lane.streak,
                    });
                }
            } else {
                lane.streak = 0;
                lane.streak_warned = false;
            }
            lane.window.push(inputs[port]);
        }

        let resolved = ResolvedFrame {
            frame,
            inputs,
            substituted,
        };
        self.history.push_back(resolved);
        if self.history.len() > capacity {
            self.history.pop_front();
        }
        self.next_frame += 1;
        self.stats.resolved_frames += 1;
        Ok(Some(resolved))
    }

    /// A resolved frame still held in history.
    pub fn resolved(&self, frame: u64) -> Option<&ResolvedFrame> {
        let first = self.history.front()?.frame;
        let idx = frame.checked_sub(first)?;
        self.history.get(usize::try_from(idx).ok()?)
    }

    /// `None` once a resolved frame has aged out of history.
    pub fn slot_state(&self, port: u8, frame: u64) -> Option<SlotState> {
        if frame < self.next_frame {
            return self
                .resolved(frame)
                .map(|r| SlotState::Resolved(r.port(port)));
        }
        Some(
            match self.lanes.get(port as usize)?.buffered.get(&frame) {
                Some(state) => SlotState::Buffered(*state),
                None => SlotState::Pending,
            },
        )
    }

    /// Locally sampled input from `from_frame` on, resolved or still buffered,
    /// for answering a resync request.
    pub fn local_inputs_since(&self, from_frame: u64) -> Vec<InputPacket> {
        let mut out = Vec::new();
        for (port, source) in self.sources.iter().enumerate() {
            if *source != PortSource::Local {
                continue;
            }
            let port = port as u8;
            out.extend(
                self.history
                    .iter()
                    .filter(|r| r.frame >= from_frame)
                    .map(|r| InputPacket::new(r.frame, port, r.port(port))),
            );
            out.extend(
                self.lanes[port as usize]
                    .buffered
                    .range(from_frame..)
                    .map(|(frame, state)| InputPacket::new(*frame, port, *state)),
            );
        }
        out
    }

    /// Add drops that happened upstream of this synchronizer.
    pub fn count_dropped(&mut self, n: u64) {
        self.stats.overflow_drops += n;
    }

    pub fn take_warnings(&mut self) -> Vec<DesyncWarning> {
        std::mem::take(&mut self.warnings)
    }
}
