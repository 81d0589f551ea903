//! Core library for Dubline, a dubbing recorder.
//!
//! Microphone audio is captured in real time, aligned sample-accurately with
//! a video timeline and written into a fixed-length waveform covering the
//! whole lesson. Each module owns one stage of that pipeline: the real-time
//! capture tap, the waveform store, the playback clock, the declarative
//! audio graph with the engine behind it, analyser sampling for display and
//! export. [`Session`] ties them together.

pub mod analysis;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod graph;
pub mod processor;
pub mod sampler;
pub mod session;
pub mod timeline;
pub mod transport;
pub mod util;
pub mod waveform;

pub use analysis::{AnalyserFeed, AnalyserNode, AnalyserTap};
pub use config::{AnalyserConfig, AppConfig, AudioConfig, ExportConfig, ExportFormat, PlaybackConfig};
pub use device::{AudioDevice, CaptureConstraints, DeviceProvider, MicStream, StaticDevices};
#[cfg(feature = "device")]
pub use device::{CpalDevices, CpalHost};
pub use engine::{engine_channel, Engine, EngineHandle};
pub use error::{DublineError, Result};
pub use export::{ExportArtifact, Exporter, StreamEncoder, WavEncoder};
#[cfg(feature = "mp3")]
pub use export::Mp3Encoder;
pub use graph::{GraphDiff, GraphManager, NodeDescriptor, NodeId, NodeKind, NodeSet, UpdateOutcome};
pub use processor::{Batch, WaveProcessor};
pub use sampler::{AnalyserSampler, AnalyserSnapshot};
pub use session::{Lesson, PumpReport, RecordingState, Session, WordEmphasis, WordState};
pub use timeline::{ClockEvent, ManualTime, MonotonicTime, PlaybackClock, PlaybackMark, TimeSource};
pub use transport::{HeadlessTransport, TransportState, VideoTransport};
pub use waveform::{WaveformBuffer, WaveformStore};
