//! Bounded per-port inbound queues shared between the network tasks and the
//! emulator tick.
//!
//! The reader side only ever pushes; the tick drains everything in one short
//! critical section. Once a lane holds `capacity` frames, the oldest entry is
//! dropped for every new one and a single [`DesyncWarning::ReceiveOverflow`]
//! is queued for the whole episode. The episode ends when the tick drains.

use std::{collections::VecDeque, time::Instant};

use dojo_netproto::{constants::MAX_PORTS, input::InputPacket};
use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::DesyncWarning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Same (port, frame) is already queued.
    Duplicate,
    /// Queued after evicting the oldest entry.
    DroppedOldest,
    Closed,
}

#[derive(Debug, Default)]
pub struct Drained {
    pub packets: Vec<InputPacket>,
    pub warnings: Vec<DesyncWarning>,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct InboundState {
    lanes: [VecDeque<InputPacket>; MAX_PORTS],
    overflowing: [bool; MAX_PORTS],
    warnings: Vec<DesyncWarning>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct InboundQueues {
    state: Mutex<InboundState>,
    arrived: Condvar,
    capacity: usize,
}

impl InboundQueues {
    pub fn new(capacity_frames: u32) -> Self {
        Self {
            state: Mutex::new(InboundState::default()),
            arrived: Condvar::new(),
            capacity: (capacity_frames as usize).max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, packet: InputPacket) -> PushOutcome {
        let port = packet.port as usize;
        let mut st = self.state.lock();
        if st.closed {
            return PushOutcome::Closed;
        }
        if st.lanes[port].iter().any(|p| p.frame == packet.frame) {
            trace!(port, frame = packet.frame, "duplicate queued packet");
            return PushOutcome::Duplicate;
        }

        let mut outcome = PushOutcome::Queued;
        if st.lanes[port].len() >= self.capacity {
            st.lanes[port].pop_front();
            st.dropped += 1;
            outcome = PushOutcome::DroppedOldest;
            if !st.overflowing[port] {
                st.overflowing[port] = true;
                warn!(port, capacity = self.capacity, "inbound queue overflow");
                st.warnings.push(DesyncWarning::ReceiveOverflow { port: port as u8 });
            }
        }
        st.lanes[port].push_back(packet);
        drop(st);

        self.arrived.notify_all();
        outcome
    }

    /// Take everything queued, ending any overflow episode.
    pub fn drain(&self) -> Drained {
        let mut st = self.state.lock();
        let mut packets = Vec::with_capacity(st.lanes.iter().map(VecDeque::len).sum());
        for lane in st.lanes.iter_mut() {
            packets.extend(lane.drain(..));
        }
        st.overflowing = [false; MAX_PORTS];
        Drained {
            packets,
            warnings: std::mem::take(&mut st.warnings),
            dropped: std::mem::take(&mut st.dropped),
        }
    }

    pub fn len(&self, port: u8) -> usize {
        self.state.lock().lanes[port as usize].len()
    }

    /// Block until something is queued, the queues close, or `deadline` passes.
    ///
    /// Returns `true` if packets are waiting.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut st = self.state.lock();
        while !st.closed && st.lanes.iter().all(VecDeque::is_empty) {
            if self.arrived.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        st.lanes.iter().any(|l| !l.is_empty())
    }

    /// Reject further pushes and wake any waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.arrived.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
