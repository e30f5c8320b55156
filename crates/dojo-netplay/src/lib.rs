//! Dojo netplay engine.
//!
//! Keeps two emulator instances (plus any number of spectators) resolving the
//! same controller input for every frame, using delay-based lockstep with a
//! bounded backfill window.
//!
//! # Architecture
//!
//! - [`transport`]: per-connection reader/writer tasks over TCP
//! - [`handshake`]: Hello/Welcome/Reject exchange and validation
//! - [`sync`]: the frame synchronizer, backfill window and bounded inbound queues
//! - [`input_provider`]: the tick-side entry point used by the emulator core
//! - [`handler`]: the async task owning peers, reconnection and relays
//! - [`session`]: `host` / `connect` / `join_as_spectator` / `disconnect`
//! - [`lobby`], [`matchmaking`]: LAN discovery and match-code rendezvous
//! - [`replay`]: recording resolved input and playing it back
//! - [`config`], [`error`]: settings and error types

pub mod config;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod identity;
pub mod input_provider;
pub mod lobby;
pub mod matchmaking;
pub mod replay;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::{NetplaySettings, SessionRole};
pub use error::{CloseReason, NetplayError};
pub use identity::digest_game;
pub use input_provider::{FrameSource, FrameStep, LocalInputSource, SharedInputProvider};
pub use replay::{PlaybackStep, ReplayLog, ReplayPlayer};
pub use session::{HostListener, Session, SessionEvent};
pub use sync::{BackfillOverflow, DesyncWarning, ResolvedFrame};

pub use dojo_netproto::input::PortInputState;
pub use dojo_netproto::messages::session::{DelayConfig, GameIdentity};
