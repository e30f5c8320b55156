use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Sender, unbounded};
use tracing::{error, info};

use super::{ReplayError, ReplayHeader, ReplayWriter};
use crate::sync::ResolvedFrame;

/// Writes resolved frames to a replay file on a dedicated thread so the tick
/// never touches the filesystem.
pub struct Recorder {
    tx: Option<Sender<ResolvedFrame>>,
    join: Option<JoinHandle<Result<u64, ReplayError>>>,
    path: PathBuf,
}

impl Recorder {
    pub fn create(path: impl AsRef<Path>, header: &ReplayHeader) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = ReplayWriter::new(BufWriter::new(file), header)?;

        let (tx, rx) = unbounded::<ResolvedFrame>();
        let join = thread::Builder::new()
            .name("dojo-recorder".into())
            .spawn(move || {
                for frame in rx {
                    writer.append(&frame)?;
                }
                let frames = writer.frames_written();
                writer.finish()?;
                Ok(frames)
            })?;

        info!(path = %path.display(), "recording replay");
        Ok(Self {
            tx: Some(tx),
            join: Some(join),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a frame for writing. Never blocks.
    pub fn record(&self, frame: &ResolvedFrame) -> Result<(), ReplayError> {
        self.tx
            .as_ref()
            .ok_or(ReplayError::RecorderStopped)?
            .send(*frame)
            .map_err(|_| ReplayError::RecorderStopped)
    }

    /// Flush and close the file. Returns the number of frames written.
    pub fn finish(mut self) -> Result<u64, ReplayError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<u64, ReplayError> {
        self.tx.take();
        match self.join.take() {
            Some(join) => join.join().map_err(|_| ReplayError::RecorderStopped)?,
            None => Ok(0),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(path = %self.path.display(), "replay not finalized: {}", e);
        }
    }
}
