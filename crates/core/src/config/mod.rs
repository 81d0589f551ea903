use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{DublineError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub analyser: AnalyserConfig,
    pub export: ExportConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.playback.validate()?;
        self.analyser.validate()?;
        self.export.validate()
    }
}

/// Capture configuration. Processing that alters the raw waveform stays off
/// so the recording is usable for export and display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Frames handed to the engine per real-time callback.
    pub render_quantum: usize,
    /// Number of render quanta accumulated into one recorder batch.
    pub chunk_quanta: usize,
    /// Batches the recorder queue holds before dropping.
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            bit_depth: 16,
            channels: 1,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            render_quantum: 128,
            chunk_quanta: 100,
            queue_capacity: 64,
        }
    }
}

impl AudioConfig {
    /// Length of a recorder batch in samples.
    pub fn chunk_len(&self) -> usize {
        self.render_quantum * self.chunk_quanta
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(invalid("audio.sample_rate must be positive"));
        }
        if self.bit_depth != 16 {
            return Err(invalid("audio.bit_depth must be 16"));
        }
        if self.channels != 1 {
            return Err(invalid("audio.channels must be 1 (mono)"));
        }
        if self.render_quantum == 0 || self.chunk_quanta == 0 {
            return Err(invalid("audio.render_quantum and audio.chunk_quanta must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("audio.queue_capacity must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub tick_interval_ms: f64,
    /// Disarm recording when seeking during playback.
    pub disarm_on_seek: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20.0,
            disarm_on_seek: false,
        }
    }
}

impl PlaybackConfig {
    fn validate(&self) -> Result<()> {
        if !(self.tick_interval_ms > 0.0) {
            return Err(invalid("playback.tick_interval_ms must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    pub fft_size: usize,
    pub interval_ms: f64,
    pub bucket_count: usize,
    pub min_frequency: f32,
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            interval_ms: 30.0,
            bucket_count: 128,
            min_frequency: 20.0,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl AnalyserConfig {
    fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two() || !(32..=32_768).contains(&self.fft_size) {
            return Err(invalid("analyser.fft_size must be a power of two in 32..=32768"));
        }
        if !(self.interval_ms > 0.0) {
            return Err(invalid("analyser.interval_ms must be positive"));
        }
        if self.bucket_count == 0 {
            return Err(invalid("analyser.bucket_count must be positive"));
        }
        if !(self.min_frequency > 0.0) {
            return Err(invalid("analyser.min_frequency must be positive"));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(invalid("analyser.smoothing must be in [0, 1)"));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(invalid("analyser.min_decibels must be below max_decibels"));
        }
        Ok(())
    }
}

/// Container the exporter writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Mp3,
    Wav,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub bitrate_kbps: u32,
    /// Appended to the lesson identifiers in the exported file name.
    pub suffix: String,
    pub format: ExportFormat,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: 192,
            suffix: "dub".to_string(),
            format: if cfg!(feature = "mp3") {
                ExportFormat::Mp3
            } else {
                ExportFormat::Wav
            },
        }
    }
}

impl ExportConfig {
    fn validate(&self) -> Result<()> {
        if self.bitrate_kbps == 0 {
            return Err(invalid("export.bitrate_kbps must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> DublineError {
    DublineError::Config(message.to_string())
}
