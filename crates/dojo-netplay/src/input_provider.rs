//! Tick-side interface between the emulator core and the netplay session.
//!
//! The emulator calls [`SharedInputProvider::tick`] once per frame from its own
//! thread. Network tasks only push into the bounded [`InboundQueues`]; every
//! state-machine transition happens under one short lock inside `tick`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dojo_netproto::input::{InputPacket, PortInputState};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{CloseReason, NetplayError},
    replay::{Recorder, ReplayError},
    sync::{
        DesyncWarning, FrameSynchronizer, InboundQueues, PortSource, PushOutcome, ResolvedFrame,
        SyncStats,
    },
};

/// Pure mapping from the local input-device layer to one port's state.
pub trait LocalInputSource {
    fn sample(&mut self, port: u8) -> PortInputState;
}

impl<F> LocalInputSource for F
where
    F: FnMut(u8) -> PortInputState,
{
    fn sample(&mut self, port: u8) -> PortInputState {
        self(port)
    }
}

/// Result of asking a frame source for the next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStep {
    /// Apply these inputs. Warnings are informational; emulation continues.
    Frame(ResolvedFrame, Vec<DesyncWarning>),
    /// Remote input has not arrived and cannot be backfilled yet. Call again.
    Waiting,
    /// Playback is paused.
    Paused,
    /// Playback reached the end of the log.
    EndOfReplay,
}

/// Anything that can feed the emulator one resolved frame at a time: a live
/// session or a replay.
pub trait FrameSource {
    fn poll_frame(&mut self, local: &mut dyn LocalInputSource) -> Result<FrameStep, NetplayError>;
}

type InputSink = Box<dyn Fn(InputPacket) + Send + Sync>;
type ResolvedSink = Box<dyn Fn(&ResolvedFrame) + Send + Sync>;
type CloseSink = Box<dyn Fn(&CloseReason) + Send + Sync>;

struct TickState {
    sync: FrameSynchronizer,
    /// Frame whose local input has already been sampled.
    last_sampled: Option<u64>,
    /// Warnings collected while a frame was still waiting.
    warnings: Vec<DesyncWarning>,
}

pub struct SharedInputProvider {
    state: Mutex<TickState>,
    inbound: InboundQueues,
    local_ports: Vec<u8>,
    frame_wait: Duration,

    on_send_input: Mutex<Option<InputSink>>,
    on_resolved: Mutex<Option<ResolvedSink>>,
    on_closed: Mutex<Option<CloseSink>>,

    recorder: Mutex<Option<Recorder>>,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
}

impl SharedInputProvider {
    pub fn new(sync: FrameSynchronizer, frame_wait: Duration) -> Self {
        let local_ports = (0..4u8)
            .filter(|p| sync.source(*p) == PortSource::Local)
            .collect();
        let capacity = sync.options().delay.rx_buffer_frames;
        Self {
            state: Mutex::new(TickState {
                sync,
                last_sampled: None,
                warnings: Vec::new(),
            }),
            inbound: InboundQueues::new(capacity),
            local_ports,
            frame_wait,
            on_send_input: Mutex::new(None),
            on_resolved: Mutex::new(None),
            on_closed: Mutex::new(None),
            recorder: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        }
    }

    /// Called once per local sample with the packet to transmit.
    pub fn set_on_send_input(&self, f: InputSink) {
        *self.on_send_input.lock() = Some(f);
    }

    /// Called once per resolved frame, after recording.
    pub fn set_on_resolved(&self, f: ResolvedSink) {
        *self.on_resolved.lock() = Some(f);
    }

    /// Called exactly once, when the session closes.
    pub fn set_on_closed(&self, f: CloseSink) {
        *self.on_closed.lock() = Some(f);
    }

    pub fn start_recording(&self, recorder: Recorder) {
        *self.recorder.lock() = Some(recorder);
    }

    /// Flush and close the replay file, if recording.
    pub fn finish_recording(&self) -> Result<Option<u64>, ReplayError> {
        let recorder = self.recorder.lock().take();
        recorder.map(Recorder::finish).transpose()
    }

    pub fn local_ports(&self) -> &[u8] {
        &self.local_ports
    }

    /// Network side: queue a packet for the next tick.
    pub fn push_remote(&self, packet: InputPacket) -> PushOutcome {
        self.inbound.push(packet)
    }

    pub fn inbound(&self) -> &InboundQueues {
        &self.inbound
    }

    pub fn next_frame(&self) -> u64 {
        self.state.lock().sync.next_frame()
    }

    pub fn stats(&self) -> SyncStats {
        self.state.lock().sync.stats()
    }

    pub fn active_ports(&self) -> u8 {
        self.state.lock().sync.active_ports()
    }

    pub fn source(&self, port: u8) -> PortSource {
        self.state.lock().sync.source(port)
    }

    /// The agreed input for an already resolved frame still in history.
    pub fn resolved_input(&self, frame: u64, port: u8) -> Option<PortInputState> {
        self.state
            .lock()
            .sync
            .resolved(frame)
            .map(|r| r.port(port))
    }

    pub fn local_inputs_since(&self, from_frame: u64) -> Vec<InputPacket> {
        self.state.lock().sync.local_inputs_since(from_frame)
    }

    /// Advance by at most one frame.
    ///
    /// Samples local input once per frame, waits up to the configured frame
    /// wait for missing remote input and then resolves with backfill.
    pub fn tick(&self, local: &mut dyn LocalInputSource) -> Result<FrameStep, NetplayError> {
        if self.is_closed() {
            return Err(NetplayError::SessionClosed);
        }

        let mut st = self.state.lock();
        let frame = st.sync.next_frame();

        let mut outbound = Vec::with_capacity(self.local_ports.len());
        if st.last_sampled != Some(frame) {
            for &port in &self.local_ports {
                let state = local.sample(port);
                outbound.push(st.sync.submit_local(port, frame, state)?);
            }
            st.last_sampled = Some(frame);
        }

        let deadline = Instant::now() + self.frame_wait;
        let outcome = loop {
            let drained = self.inbound.drain();
            st.warnings.extend(drained.warnings);
            st.sync.count_dropped(drained.dropped);
            for packet in drained.packets {
                st.sync.ingest(packet);
            }

            let due = Instant::now() >= deadline;
            match st.sync.resolve(frame, due) {
                Ok(Some(resolved)) => break Ok(Some(resolved)),
                Ok(None) if due => break Ok(None),
                Ok(None) => {
                    MutexGuard::unlocked(&mut st, || self.inbound.wait_until(deadline));
                    if self.is_closed() {
                        break Err(NetplayError::SessionClosed);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let warnings = match &outcome {
            Ok(Some(_)) => {
                let mut w = std::mem::take(&mut st.warnings);
                w.extend(st.sync.take_warnings());
                w
            }
            _ => Vec::new(),
        };
        drop(st);

        self.send_local(outbound);

        match outcome {
            Ok(Some(resolved)) => {
                self.publish(&resolved);
                Ok(FrameStep::Frame(resolved, warnings))
            }
            Ok(None) => {
                trace!(frame, "waiting for remote input");
                Ok(FrameStep::Waiting)
            }
            Err(NetplayError::BackfillExhausted { port, frame }) => {
                self.close(CloseReason::BackfillExhausted { port, frame });
                Err(NetplayError::ConnectionLost(format!(
                    "no input from port {port} by frame {frame}"
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn send_local(&self, packets: Vec<InputPacket>) {
        if packets.is_empty() {
            return;
        }
        if let Some(send) = self.on_send_input.lock().as_ref() {
            for packet in packets {
                send(packet);
            }
        }
    }

    fn publish(&self, resolved: &ResolvedFrame) {
        if let Some(recorder) = self.recorder.lock().as_ref()
            && let Err(e) = recorder.record(resolved)
        {
            warn!(frame = resolved.frame, "failed to record frame: {}", e);
        }
        if let Some(relay) = self.on_resolved.lock().as_ref() {
            relay(resolved);
        }
    }

    /// Move to the closed state. Only the first call has any effect and
    /// returns `true`.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        match &reason {
            CloseReason::LocalDisconnect | CloseReason::PeerDisconnected(_) => {
                info!(?reason, "netplay session closed")
            }
            other => error!(reason = ?other, "netplay session closed"),
        }
        *self.close_reason.lock() = Some(reason.clone());
        self.inbound.close();

        if let Some(recorder) = self.recorder.lock().take() {
            let finish = move || {
                if let Err(e) = recorder.finish() {
                    warn!("failed to finalize replay: {}", e);
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn_blocking(finish);
                }
                Err(_) => finish(),
            }
        }

        if let Some(notify) = self.on_closed.lock().as_ref() {
            notify(&reason);
        }
        debug!("close notification delivered");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }
}

impl FrameSource for Arc<SharedInputProvider> {
    fn poll_frame(&mut self, local: &mut dyn LocalInputSource) -> Result<FrameStep, NetplayError> {
        self.tick(local)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, AtomicUsize},
        thread,
    };

    use dojo_netproto::{constants::MAX_PORTS, messages::session::DelayConfig};

    use proptest::prelude::*;

    use super::*;
    use crate::sync::{BackfillOverflow, SyncOptions};

    const HOST: [PortSource; MAX_PORTS] = [
        PortSource::Local,
        PortSource::Remote,
        PortSource::Inactive,
        PortSource::Inactive,
    ];

    fn provider(depth: u8, overflow: BackfillOverflow, wait_ms: u64) -> SharedInputProvider {
        let delay = DelayConfig {
            base_delay: 1,
            packets_per_frame: 1,
            backfill_depth: depth,
            rx_buffer_frames: 32,
        };
        SharedInputProvider::new(
            FrameSynchronizer::new(SyncOptions::new(delay).with_overflow(overflow), HOST),
            Duration::from_millis(wait_ms),
        )
    }

    fn st(buttons: u16) -> PortInputState {
        PortInputState::new(buttons, [0; 4])
    }

    fn frame(step: FrameStep) -> ResolvedFrame {
        match step {
            FrameStep::Frame(f, _) => f,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn samples_once_per_frame_even_when_waiting() {
        let p = provider(0, BackfillOverflow::Repeat, 0);
        let sent = Arc::new(AtomicUsize::new(0));
        let sent2 = sent.clone();
        p.set_on_send_input(Box::new(move |_| {
            sent2.fetch_add(1, Ordering::SeqCst);
        }));

        let mut samples = 0;
        let mut local = |_port: u8| {
            samples += 1;
            st(1)
        };

        // Frame 0 is the neutral delay frame.
        assert_eq!(frame(p.tick(&mut local).unwrap()).frame, 0);
        assert_eq!(p.tick(&mut local).unwrap(), FrameStep::Waiting);
        assert_eq!(p.tick(&mut local).unwrap(), FrameStep::Waiting);
        assert_eq!(samples, 2);
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remote_input_from_another_thread_resolves_frame() {
        let p = Arc::new(provider(3, BackfillOverflow::Repeat, 2000));
        let mut local = |_port: u8| st(0xA);
        frame(p.tick(&mut local).unwrap());

        let pusher = {
            let p = p.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                p.push_remote(InputPacket::new(1, 1, st(0xB)));
            })
        };
        let r = frame(p.tick(&mut local).unwrap());
        pusher.join().unwrap();

        assert_eq!(r.frame, 1);
        assert_eq!(r.port(0), st(0xA));
        assert_eq!(r.port(1), st(0xB));
        assert!(!r.was_substituted(1));
        assert_eq!(p.resolved_input(1, 1), Some(st(0xB)));
    }

    #[test]
    fn missing_input_is_backfilled_after_frame_wait() {
        let p = provider(3, BackfillOverflow::Repeat, 5);
        let mut local = |_port: u8| st(0);
        frame(p.tick(&mut local).unwrap());
        p.push_remote(InputPacket::new(1, 1, st(7)));
        frame(p.tick(&mut local).unwrap());

        let start = Instant::now();
        let r = frame(p.tick(&mut local).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(r.was_substituted(1));
        assert_eq!(r.port(1), st(7));
    }

    #[test]
    fn overflow_warning_is_delivered_with_next_frame() {
        let p = provider(3, BackfillOverflow::Repeat, 0);
        for f in 1..40 {
            p.push_remote(InputPacket::new(f, 1, st(f as u16)));
        }
        let mut local = |_port: u8| st(0);
        match p.tick(&mut local).unwrap() {
            FrameStep::Frame(r, warnings) => {
                assert_eq!(warnings, vec![DesyncWarning::ReceiveOverflow { port: 1 }]);
                // The burst must not displace the seeded delay frame.
                assert_eq!(r.frame, 0);
                assert_eq!(r.substituted, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        // 7 evicted from the queue, 8 past the lane window.
        assert_eq!(p.stats().overflow_drops, 15);

        match p.tick(&mut local).unwrap() {
            FrameStep::Frame(r, warnings) => {
                assert_eq!(r.frame, 1);
                assert!(warnings.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn overflow_warns_once_per_episode(bursts in prop::collection::vec(0usize..80, 1..12)) {
            let p = provider(3, BackfillOverflow::Repeat, 0);
            let mut local = |_port: u8| st(0);
            let mut next = 1u64;
            for burst in bursts {
                for _ in 0..burst {
                    p.push_remote(InputPacket::new(next, 1, st(next as u16)));
                    next += 1;
                }
                let FrameStep::Frame(_, warnings) = p.tick(&mut local).unwrap() else {
                    panic!("repeat policy always resolves");
                };
                let overflows = warnings
                    .iter()
                    .filter(|w| matches!(w, DesyncWarning::ReceiveOverflow { .. }))
                    .count();
                prop_assert_eq!(overflows, usize::from(burst > 32));
            }
        }
    }

    #[test]
    fn disconnect_policy_closes_once() {
        let p = provider(1, BackfillOverflow::Disconnect, 0);
        let closes = Arc::new(AtomicU32::new(0));
        let closes2 = closes.clone();
        p.set_on_closed(Box::new(move |_| {
            closes2.fetch_add(1, Ordering::SeqCst);
        }));

        let mut local = |_port: u8| st(0);
        frame(p.tick(&mut local).unwrap());
        frame(p.tick(&mut local).unwrap());
        assert!(matches!(
            p.tick(&mut local),
            Err(NetplayError::ConnectionLost(_))
        ));
        assert!(matches!(
            p.tick(&mut local),
            Err(NetplayError::SessionClosed)
        ));
        assert!(!p.close(CloseReason::LocalDisconnect));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            p.close_reason(),
            Some(CloseReason::BackfillExhausted { port: 1, frame: 2 })
        );
    }

    #[test]
    fn close_wakes_a_waiting_tick() {
        let p = Arc::new(provider(0, BackfillOverflow::Repeat, 10_000));
        let mut local = |_port: u8| st(0);
        frame(p.tick(&mut local).unwrap());

        let closer = {
            let p = p.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                p.close(CloseReason::LocalDisconnect);
            })
        };
        let start = Instant::now();
        assert!(matches!(
            p.tick(&mut local),
            Err(NetplayError::SessionClosed)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }

    #[test]
    fn resolved_frames_reach_relay_in_order() {
        let p = provider(3, BackfillOverflow::Repeat, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        p.set_on_resolved(Box::new(move |r| seen2.lock().push(r.frame)));

        let mut local = |_port: u8| st(0);
        for _ in 0..4 {
            frame(p.tick(&mut local).unwrap());
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
    }
}
