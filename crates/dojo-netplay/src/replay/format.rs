//! Replay log file format.
//!
//! ```text
//! "DJRP" | version u8 | header_len u32 LE | postcard ReplayHeader
//! record* (16 bytes each):
//!   frame u64 LE | port u8 | reserved u8 | buttons u16 LE | axes 4 x i8
//! ```

use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::Path,
};

use dojo_netproto::{
    constants::MAX_PORTS,
    input::{PORT_STATE_LEN, PortInputState},
    limits::MAX_CONTROL_PAYLOAD,
    messages::session::{DelayConfig, GameIdentity},
};
use serde::{Deserialize, Serialize};

use super::ReplayError;
use crate::sync::ResolvedFrame;

pub const REPLAY_MAGIC: [u8; 4] = *b"DJRP";
pub const REPLAY_VERSION: u8 = 1;
pub const RECORD_LEN: usize = 16;
pub const MAX_HEADER_LEN: usize = MAX_CONTROL_PAYLOAD;

/// Session configuration the log was produced under.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReplayHeader {
    pub delay: DelayConfig,
    pub game: GameIdentity,
    pub game_name: String,
    /// Bit `n` set when port `n` has records.
    pub active_ports: u8,
    /// Indexed by port.
    pub player_names: Vec<String>,
    pub match_code: String,
}

/// One resolved (frame, port, state) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRecord {
    pub frame: u64,
    pub port: u8,
    pub state: PortInputState,
}

impl ReplayRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..8].copy_from_slice(&self.frame.to_le_bytes());
        out[8] = self.port;
        let mut state = [0u8; PORT_STATE_LEN];
        self.state.encode_into(&mut state);
        out[10..16].copy_from_slice(&state);
        out
    }

    pub fn decode(buf: &[u8; RECORD_LEN]) -> Result<Self, ReplayError> {
        let mut frame = [0u8; 8];
        frame.copy_from_slice(&buf[0..8]);
        let port = buf[8];
        if usize::from(port) >= MAX_PORTS {
            return Err(ReplayError::InvalidPort(port));
        }
        let state = PortInputState::decode(&buf[10..16]).map_err(|_| ReplayError::Truncated)?;
        Ok(Self {
            frame: u64::from_le_bytes(frame),
            port,
            state,
        })
    }
}

/// Append-only writer. Consumed by [`finish`](Self::finish), after which the
/// log can no longer change.
pub struct ReplayWriter<W: Write> {
    out: W,
    active_ports: u8,
    frames: u64,
}

impl<W: Write> ReplayWriter<W> {
    pub fn new(mut out: W, header: &ReplayHeader) -> Result<Self, ReplayError> {
        let meta = postcard::to_stdvec(header)?;
        if meta.len() > MAX_HEADER_LEN {
            return Err(ReplayError::HeaderTooLarge(meta.len()));
        }
        out.write_all(&REPLAY_MAGIC)?;
        out.write_all(&[REPLAY_VERSION])?;
        out.write_all(&(meta.len() as u32).to_le_bytes())?;
        out.write_all(&meta)?;
        Ok(Self {
            out,
            active_ports: header.active_ports,
            frames: 0,
        })
    }

    pub fn append(&mut self, frame: &ResolvedFrame) -> Result<(), ReplayError> {
        for port in 0..MAX_PORTS as u8 {
            if self.active_ports & (1 << port) == 0 {
                continue;
            }
            let record = ReplayRecord {
                frame: frame.frame,
                port,
                state: frame.port(port),
            };
            self.out.write_all(&record.encode())?;
        }
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn finish(mut self) -> Result<W, ReplayError> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// A fully loaded replay.
#[derive(Debug, Clone)]
pub struct ReplayLog {
    pub header: ReplayHeader,
    pub frames: Vec<ResolvedFrame>,
}

impl ReplayLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }

    pub fn read_from<R: Read>(mut r: R) -> Result<Self, ReplayError> {
        let mut magic = [0u8; 4];
        read_exact_or_truncated(&mut r, &mut magic)?;
        if magic != REPLAY_MAGIC {
            return Err(ReplayError::BadMagic);
        }
        let mut version = [0u8; 1];
        read_exact_or_truncated(&mut r, &mut version)?;
        if version[0] != REPLAY_VERSION {
            return Err(ReplayError::UnsupportedVersion(version[0]));
        }
        let mut len = [0u8; 4];
        read_exact_or_truncated(&mut r, &mut len)?;
        let meta_len = u32::from_le_bytes(len) as usize;
        if meta_len > MAX_HEADER_LEN {
            return Err(ReplayError::HeaderTooLarge(meta_len));
        }
        let mut meta = vec![0u8; meta_len];
        read_exact_or_truncated(&mut r, &mut meta)?;
        let header: ReplayHeader = postcard::from_bytes(&meta)?;

        let mut body = Vec::new();
        r.read_to_end(&mut body)?;
        if body.len() % RECORD_LEN != 0 {
            return Err(ReplayError::Truncated);
        }

        let mut frames: Vec<ResolvedFrame> = Vec::new();
        for chunk in body.chunks_exact(RECORD_LEN) {
            let mut buf = [0u8; RECORD_LEN];
            buf.copy_from_slice(chunk);
            let record = ReplayRecord::decode(&buf)?;
            let port = usize::from(record.port);
            match frames.last_mut() {
                Some(last) if last.frame == record.frame => last.inputs[port] = record.state,
                _ => {
                    let mut inputs = [PortInputState::NEUTRAL; MAX_PORTS];
                    inputs[port] = record.state;
                    frames.push(ResolvedFrame {
                        frame: record.frame,
                        inputs,
                        substituted: 0,
                    });
                }
            }
        }

        Ok(Self { header, frames })
    }

    /// Every (frame, port, state) triple in file order.
    pub fn records(&self) -> impl Iterator<Item = ReplayRecord> + '_ {
        let active = self.header.active_ports;
        self.frames.iter().flat_map(move |f| {
            (0..MAX_PORTS as u8)
                .filter(move |p| active & (1 << p) != 0)
                .map(move |port| ReplayRecord {
                    frame: f.frame,
                    port,
                    state: f.port(port),
                })
        })
    }
}

fn read_exact_or_truncated<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ReplayError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ReplayError::Truncated,
        _ => ReplayError::Io(e),
    })
}
