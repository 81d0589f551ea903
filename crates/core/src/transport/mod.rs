use serde::{Deserialize, Serialize};

use crate::{DublineError, Result};

/// Playback state as reported by the embedded video player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    Unstarted,
    Playing,
    Paused,
    Buffering,
    Ended,
}

/// Control surface of the external video player the recording is aligned
/// against.
pub trait VideoTransport {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    /// Moves the playhead. The player may keep its previous play state or
    /// not; callers check [`VideoTransport::state`] afterwards.
    fn seek(&mut self, time: f64) -> Result<()>;
    fn state(&self) -> Result<TransportState>;
    /// Volume in `0..=100`.
    fn set_volume(&mut self, volume: u8) -> Result<()>;
    fn mute(&mut self) -> Result<()>;
}

/// In-memory player used when no real video surface is attached.
#[derive(Debug, Clone)]
pub struct HeadlessTransport {
    state: TransportState,
    position: f64,
    volume: u8,
    muted: bool,
    ready: bool,
}

impl HeadlessTransport {
    pub fn new() -> Self {
        Self {
            state: TransportState::Unstarted,
            position: 0.0,
            volume: 100,
            muted: false,
            ready: true,
        }
    }

    /// A player whose video has not loaded yet; every call fails.
    pub fn unready() -> Self {
        Self {
            ready: false,
            ..Self::new()
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(DublineError::Transport("video player not ready".to_string()))
        }
    }
}

impl Default for HeadlessTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoTransport for HeadlessTransport {
    fn play(&mut self) -> Result<()> {
        self.ensure_ready()?;
        tracing::debug!(position = self.position, "video play");
        self.state = TransportState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.ensure_ready()?;
        tracing::debug!(position = self.position, "video pause");
        if self.state != TransportState::Unstarted {
            self.state = TransportState::Paused;
        }
        Ok(())
    }

    fn seek(&mut self, time: f64) -> Result<()> {
        self.ensure_ready()?;
        tracing::debug!(time, "video seek");
        self.position = time.max(0.0);
        Ok(())
    }

    fn state(&self) -> Result<TransportState> {
        self.ensure_ready()?;
        Ok(self.state)
    }

    fn set_volume(&mut self, volume: u8) -> Result<()> {
        self.ensure_ready()?;
        self.volume = volume.min(100);
        Ok(())
    }

    fn mute(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.muted = true;
        Ok(())
    }
}
