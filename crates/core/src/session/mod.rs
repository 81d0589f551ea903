//! One dubbing session over a lesson.
//!
//! [`Session`] owns every piece of the pipeline and is the only place state
//! changes. Mutating operations mark the audio graph dirty; [`Session::pump`]
//! is the control-loop tick that reapplies it once per batch of changes,
//! moves recorder batches into the waveform, advances the clock and samples
//! the analyser.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    device::{AudioDevice, CaptureConstraints, DeviceProvider, MicStream},
    engine::{engine_channel, Engine},
    export::{encoder_for, ExportArtifact, Exporter},
    graph::{GraphManager, NodeDescriptor, NodeId, NodeSet, Output, UpdateOutcome, NO_OUTPUT, OUTPUT},
    sampler::{AnalyserSampler, AnalyserSnapshot},
    timeline::{ClockEvent, PlaybackClock, TimeSource},
    util,
    waveform::{CaptureGate, WaveformStore, WriteOutcome},
    AppConfig, DublineError, Result, VideoTransport,
};

/// Lesson metadata the session needs. Loaded elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub year: String,
    pub title: String,
    pub language: String,
    /// Identifier of the video the recording is aligned with.
    pub video: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingState {
    pub playing: bool,
    /// Armed: batches are written while playing.
    pub recording: bool,
    pub auto_scroll: bool,
    pub show_original: bool,
}

/// Position of a transcript word relative to the playhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WordState {
    Past,
    Present,
    Future,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WordEmphasis {
    pub state: WordState,
    pub opacity: f64,
}

/// What one [`Session::pump`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpReport {
    /// Set when the graph was dirty and an update was attempted.
    pub graph: Option<UpdateOutcome>,
    pub writes: Vec<WriteOutcome>,
    pub stale_batches: usize,
    pub clock: Option<ClockEvent>,
    pub sampled: bool,
}

impl PumpReport {
    /// Samples that landed in the waveform.
    pub fn samples_written(&self) -> usize {
        self.writes
            .iter()
            .map(|outcome| match outcome {
                WriteOutcome::Written { len, .. } => *len,
                _ => 0,
            })
            .sum()
    }
}

pub struct Session<T, C> {
    config: AppConfig,
    lesson: Lesson,
    transport: T,
    time: C,
    devices: Box<dyn DeviceProvider>,
    device_list: Vec<AudioDevice>,
    selected_device: Option<String>,
    mic: Option<MicStream>,
    clock: PlaybackClock,
    store: WaveformStore,
    graph: GraphManager,
    sampler: AnalyserSampler,
    state: RecordingState,
    volume: f32,
    playthrough: bool,
    tracks: Vec<Arc<[f32]>>,
    dirty: bool,
}

impl<T, C> Session<T, C>
where
    T: VideoTransport,
    C: TimeSource,
{
    pub fn new(
        config: AppConfig,
        lesson: Lesson,
        mut transport: T,
        time: C,
        devices: Box<dyn DeviceProvider>,
    ) -> Result<Self> {
        config.validate()?;
        if !(lesson.duration_seconds >= 0.0) {
            return Err(DublineError::InvalidInput("lesson duration must be non-negative"));
        }

        // the recording replaces the lesson audio
        if let Err(err) = transport.mute() {
            tracing::warn!("could not mute video: {err}");
        }

        let sample_rate = config.audio.sample_rate;
        tracing::info!(
            lesson = %lesson.title,
            duration = lesson.duration_seconds,
            sample_rate,
            "session created"
        );
        Ok(Self {
            clock: PlaybackClock::new(
                sample_rate,
                lesson.duration_seconds,
                config.playback.tick_interval_ms,
            ),
            store: WaveformStore::new(sample_rate, lesson.duration_seconds),
            graph: GraphManager::new(config.audio.queue_capacity, config.analyser.clone()),
            sampler: AnalyserSampler::new(&config.analyser),
            state: RecordingState {
                auto_scroll: true,
                ..RecordingState::default()
            },
            volume: 1.0,
            playthrough: false,
            tracks: Vec::new(),
            dirty: true,
            device_list: Vec::new(),
            selected_device: None,
            mic: None,
            config,
            lesson,
            transport,
            time,
            devices,
        })
    }

    /// Creates the audio engine and returns its render half, to be driven
    /// by the host audio callback. Graph updates before this are deferred.
    pub fn attach_engine(&mut self) -> Engine {
        let (handle, engine) = engine_channel(self.config.audio.sample_rate);
        self.graph.attach(handle);
        self.dirty = true;
        engine
    }

    /// Re-enumerates capture devices, selecting the first when nothing
    /// valid is selected.
    pub fn refresh_devices(&mut self) -> Result<&[AudioDevice]> {
        let devices = self.devices.input_devices().inspect_err(|err| {
            tracing::warn!("device enumeration failed: {err}");
        })?;
        let selected_known = self
            .selected_device
            .as_ref()
            .is_some_and(|id| devices.iter().any(|device| &device.id == id));
        if !selected_known {
            self.selected_device = devices.first().map(|device| device.id.clone());
        }
        tracing::debug!(count = devices.len(), selected = ?self.selected_device, "devices refreshed");
        self.device_list = devices;
        Ok(&self.device_list)
    }

    /// Changes the capture device, reopening the microphone if one is open.
    pub fn select_device(&mut self, id: &str) -> Result<()> {
        if !self.device_list.iter().any(|device| device.id == id) {
            return Err(DublineError::InvalidInput("unknown capture device"));
        }
        if self.selected_device.as_deref() == Some(id) {
            return Ok(());
        }
        tracing::info!(device = id, "capture device selected");
        self.selected_device = Some(id.to_string());
        if self.mic.is_some() {
            self.open_microphone()?;
        }
        Ok(())
    }

    /// Opens the selected device. On failure the previous stream, if any, is
    /// dropped and the session continues playback-only.
    pub fn open_microphone(&mut self) -> Result<&MicStream> {
        let constraints =
            CaptureConstraints::from_config(&self.config.audio, self.selected_device.clone());
        self.dirty = true;
        match self.devices.open_input(&constraints) {
            Ok(stream) => {
                tracing::info!(device = %stream.device_id, stream = stream.id, "microphone ready");
                Ok(&*self.mic.insert(stream))
            }
            Err(err) => {
                tracing::warn!("microphone unavailable: {err}");
                self.mic = None;
                Err(err)
            }
        }
    }

    pub fn close_microphone(&mut self) {
        if self.mic.take().is_some() {
            self.dirty = true;
        }
    }

    pub fn play(&mut self) -> Result<()> {
        if self.state.playing {
            return Ok(());
        }
        let mark = self.clock.play(&mut self.transport, self.time.now_ms())?;
        self.store.mark(mark.sample_offset);
        self.state.playing = true;
        self.dirty = true;
        Ok(())
    }

    /// Stops playback. Local state stops even if the player fails to pause.
    pub fn stop(&mut self) -> Result<()> {
        let result = self.clock.stop(&mut self.transport);
        self.state.playing = false;
        self.dirty = true;
        result
    }

    pub fn toggle_playback(&mut self) -> Result<()> {
        if self.state.playing {
            self.stop()
        } else {
            self.play()
        }
    }

    pub fn seek(&mut self, time: f64) -> Result<()> {
        if !time.is_finite() {
            return Err(DublineError::InvalidInput("seek target must be a finite time"));
        }
        if self.config.playback.disarm_on_seek && self.state.playing && self.state.recording {
            tracing::info!("recording disarmed by seek");
            self.state.recording = false;
        }
        let result = self.clock.seek(&mut self.transport, time, self.time.now_ms());
        self.state.playing = self.clock.is_playing();
        // the mark changed, so the recorder tap and any playing track sources
        // are replaced
        self.dirty = true;
        let mark = result?;
        self.store.mark(mark.sample_offset);
        Ok(())
    }

    pub fn arm_recording(&mut self) {
        tracing::info!("recording armed");
        self.state.recording = true;
    }

    pub fn disarm_recording(&mut self) {
        tracing::info!("recording disarmed");
        self.state.recording = false;
    }

    /// Master volume in `[0, 1]`. The video player follows on its own scale.
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.volume = volume;
        self.dirty = true;
        self.transport.set_volume((volume * 100.0).round() as u8)
    }

    /// Monitors the microphone through the output.
    pub fn set_playthrough(&mut self, enabled: bool) {
        self.playthrough = enabled;
        self.dirty = true;
    }

    pub fn set_auto_scroll(&mut self, enabled: bool) {
        self.state.auto_scroll = enabled;
    }

    pub fn set_show_original(&mut self, enabled: bool) {
        self.state.show_original = enabled;
    }

    /// Adds a track played back alongside the video, aligned at time zero.
    pub fn add_track(&mut self, samples: Vec<f32>) -> usize {
        self.tracks.push(Arc::from(samples));
        self.dirty = true;
        self.tracks.len() - 1
    }

    /// Moves the recorded waveform into the track list so the next pass
    /// plays it back. Returns the new track index.
    pub fn commit_take(&mut self) -> Result<usize> {
        let buffer = self
            .store
            .take()
            .filter(|buffer| !buffer.is_empty())
            .ok_or(DublineError::NothingToExport)?;
        tracing::info!(samples = buffer.len(), "take committed as track");
        Ok(self.add_track(buffer.to_float()))
    }

    /// The routing the current state calls for.
    pub fn desired_nodes(&self) -> NodeSet {
        let mut nodes = NodeSet::new();

        if let Some(mic) = &self.mic {
            let mut outputs = Vec::with_capacity(3);
            if self.state.playing {
                outputs.push(Output::node(NodeId::recorder()));
                nodes.insert(
                    NodeId::recorder(),
                    NodeDescriptor::recorder(
                        vec![NO_OUTPUT],
                        self.config.audio.chunk_len(),
                        self.clock.run(),
                    ),
                );
            }
            outputs.push(Output::node(NodeId::analyser()));
            outputs.push(Output::node(NodeId::playthrough()));
            nodes.insert(NodeId::mic(), NodeDescriptor::mic(outputs, mic.id));
            nodes.insert(
                NodeId::analyser(),
                NodeDescriptor::analyser(vec![NO_OUTPUT], self.config.analyser.fft_size),
            );
            nodes.insert(
                NodeId::playthrough(),
                NodeDescriptor::gain(
                    vec![Output::node(NodeId::volume())],
                    if self.playthrough { 1.0 } else { 0.0 },
                ),
            );
        }

        if self.state.playing {
            let mark = self.clock.mark();
            for (index, track) in self.tracks.iter().enumerate() {
                nodes.insert(
                    NodeId::track(index, mark.timestamp_ms),
                    NodeDescriptor::buffer_source(
                        vec![Output::node(NodeId::volume())],
                        track.clone(),
                        mark.time,
                    ),
                );
            }
        }

        nodes.insert(
            NodeId::volume(),
            NodeDescriptor::gain(vec![OUTPUT], util::power(self.volume, 2.0)),
        );
        nodes
    }

    /// Control-loop tick.
    pub fn pump(&mut self) -> Result<PumpReport> {
        let now = self.time.now_ms();
        let mut report = PumpReport {
            graph: self.reconcile()?,
            ..PumpReport::default()
        };

        for batch in self.graph.drain_recorders() {
            let gate = CaptureGate {
                tap_live: self.graph.is_tap_live(batch.tap),
                playing: self.state.playing,
                recording: self.state.recording,
            };
            match self.store.receive(&batch, gate) {
                WriteOutcome::Stale => {
                    tracing::trace!(tap = batch.tap, index = batch.index, "stale batch dropped");
                    report.stale_batches += 1;
                }
                outcome => report.writes.push(outcome),
            }
            self.graph.recycle(batch);
        }
        self.graph.drain_analysers();

        match self.clock.poll(&mut self.transport, now) {
            Ok(Some(ClockEvent::Ended(time))) => {
                self.state.playing = false;
                self.dirty = true;
                report.clock = Some(ClockEvent::Ended(time));
                self.reconcile()?;
            }
            Ok(event) => report.clock = event,
            Err(err) => {
                // the clock may have stopped itself before the player failed
                if self.state.playing != self.clock.is_playing() {
                    self.state.playing = self.clock.is_playing();
                    self.dirty = true;
                }
                return Err(err);
            }
        }

        report.sampled = self.sampler.poll(&mut self.graph, now)?;
        Ok(report)
    }

    fn reconcile(&mut self) -> Result<Option<UpdateOutcome>> {
        if !self.dirty {
            return Ok(None);
        }
        let outcome = self.graph.update(&self.desired_nodes())?;
        if matches!(outcome, UpdateOutcome::Applied(_)) {
            self.dirty = false;
        }
        Ok(Some(outcome))
    }

    /// Encodes the recording with the configured format.
    pub fn export(&self) -> Result<ExportArtifact> {
        let export = &self.config.export;
        let mut encoder = encoder_for(export, self.config.audio.sample_rate)?;
        let parts = [
            self.lesson.year.as_str(),
            self.lesson.title.as_str(),
            self.lesson.language.as_str(),
            export.suffix.as_str(),
        ];
        Exporter::export(self.store.buffer(), &parts, encoder.as_mut())
    }

    /// Where a transcript word spanning `[start, end)` sits relative to the
    /// playhead, and how strongly to draw it.
    pub fn word_state(&self, start: f64, end: f64) -> WordEmphasis {
        let time = self.clock.time();
        let state = if time < start {
            WordState::Future
        } else if time < end {
            WordState::Present
        } else {
            WordState::Past
        };
        let opacity = if self.state.playing {
            (0.25 + 1.25_f64.powf(-(time - (start + end) / 2.0).abs())).min(1.0)
        } else {
            1.0
        };
        WordEmphasis { state, opacity }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn time(&self) -> f64 {
        self.clock.time()
    }

    pub fn lesson(&self) -> &Lesson {
        &self.lesson
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn store(&self) -> &WaveformStore {
        &self.store
    }

    pub fn graph(&self) -> &GraphManager {
        &self.graph
    }

    pub fn snapshot(&self) -> &AnalyserSnapshot {
        self.sampler.snapshot()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn devices(&self) -> &[AudioDevice] {
        &self.device_list
    }

    pub fn selected_device(&self) -> Option<&str> {
        self.selected_device.as_deref()
    }

    pub fn mic(&self) -> Option<&MicStream> {
        self.mic.as_ref()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn playthrough(&self) -> bool {
        self.playthrough
    }

    pub fn tracks(&self) -> &[Arc<[f32]>] {
        &self.tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::StaticDevices,
        timeline::ManualTime,
        transport::TransportState,
        util::to_int,
        HeadlessTransport,
    };

    type TestSession = Session<HeadlessTransport, ManualTime>;

    fn lesson(duration_seconds: f64) -> Lesson {
        Lesson {
            year: "2019".to_string(),
            title: "Greetings".to_string(),
            language: "fr".to_string(),
            video: "abc123".to_string(),
            duration_seconds,
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.chunk_quanta = 4;
        config.analyser.fft_size = 256;
        config
    }

    /// Session with an engine and an open microphone.
    fn live_session(duration: f64) -> (TestSession, Engine, ManualTime) {
        let time = ManualTime::new();
        let mut session = Session::new(
            config(),
            lesson(duration),
            HeadlessTransport::new(),
            time.clone(),
            Box::new(StaticDevices::single("Built-in Microphone")),
        )
        .unwrap();
        let engine = session.attach_engine();
        session.refresh_devices().unwrap();
        session.open_microphone().unwrap();
        session.pump().unwrap();
        (session, engine, time)
    }

    fn render(engine: &mut Engine, blocks: usize, value: f32) {
        let capture = [value; 128];
        let mut out = [0.0_f32; 128];
        for _ in 0..blocks {
            engine.render(Some(&capture), &mut out);
        }
    }

    #[test]
    fn armed_playback_records_from_the_start() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();

        render(&mut engine, 12, 0.5);
        let report = session.pump().unwrap();
        assert_eq!(report.writes.len(), 3);
        assert_eq!(report.samples_written(), 1536);

        let buffer = session.store().buffer().unwrap();
        assert_eq!(buffer.len(), 441_000);
        assert!(buffer.samples()[..1536].iter().all(|&v| v == 16_383));
        assert!(buffer.samples()[1536..].iter().all(|&v| v == 0));
    }

    #[test]
    fn seek_then_play_writes_at_seek_position() {
        let (mut session, mut engine, time) = live_session(10.0);
        session.seek(5.0).unwrap();
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();

        time.advance(20.0);
        render(&mut engine, 4, 0.25);
        let report = session.pump().unwrap();
        let Some(ClockEvent::Tick(position)) = report.clock else {
            panic!("expected a tick, got {:?}", report.clock);
        };
        assert!((position - 5.0).abs() <= 0.02 + 1e-9);
        assert_eq!(
            report.writes,
            vec![WriteOutcome::Written {
                offset: 220_500,
                len: 512
            }]
        );
    }

    #[test]
    fn playing_past_the_end_stops_at_duration() {
        let (mut session, _engine, time) = live_session(1.0);
        session.play().unwrap();
        session.pump().unwrap();
        assert!(session.graph().has_node(&NodeId::recorder()));

        time.advance(1_500.0);
        let report = session.pump().unwrap();
        assert_eq!(report.clock, Some(ClockEvent::Ended(1.0)));
        assert_eq!(session.time(), 1.0);
        assert!(!session.state().playing);
        assert_eq!(session.transport().state().unwrap(), TransportState::Paused);
        assert!(!session.graph().has_node(&NodeId::recorder()));
    }

    #[test]
    fn batch_after_stop_is_dropped() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();

        render(&mut engine, 4, 0.5);
        session.stop().unwrap();
        let report = session.pump().unwrap();
        assert_eq!(report.stale_batches, 1);
        assert!(report.writes.is_empty());
        assert!(session.store().buffer().is_none());
    }

    #[test]
    fn disarmed_playback_only_tracks_position() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.play().unwrap();
        session.pump().unwrap();

        render(&mut engine, 8, 0.5);
        let report = session.pump().unwrap();
        assert_eq!(report.writes, vec![WriteOutcome::Advanced; 2]);
        assert_eq!(session.store().cursor(), 1024);
        assert!(session.store().buffer().unwrap().samples().iter().all(|&v| v == 0));
        assert!(matches!(session.export(), Ok(_)));
    }

    #[test]
    fn graph_waits_for_engine() {
        let time = ManualTime::new();
        let mut session = Session::new(
            config(),
            lesson(10.0),
            HeadlessTransport::new(),
            time,
            Box::new(StaticDevices::single("Mic")),
        )
        .unwrap();
        session.play().unwrap();
        assert_eq!(session.pump().unwrap().graph, Some(UpdateOutcome::Deferred));
        // still dirty, retried on the next tick
        assert_eq!(session.pump().unwrap().graph, Some(UpdateOutcome::Deferred));

        let _engine = session.attach_engine();
        let report = session.pump().unwrap();
        assert!(matches!(report.graph, Some(UpdateOutcome::Applied(_))));
        assert!(session.graph().has_node(&NodeId::volume()));
        assert_eq!(session.pump().unwrap().graph, None);
    }

    #[test]
    fn track_nodes_are_keyed_by_mark() {
        let (mut session, _engine, time) = live_session(10.0);
        session.add_track(vec![0.1; 44_100]);
        time.set(0.0);
        session.play().unwrap();
        assert!(session.desired_nodes().contains_key(&NodeId::track(0, 0.0)));

        time.set(100.0);
        session.seek(2.0).unwrap();
        let nodes = session.desired_nodes();
        assert!(nodes.contains_key(&NodeId::track(0, 100.0)));
        assert!(!nodes.contains_key(&NodeId::track(0, 0.0)));

        // a volume change keeps the source that is already playing
        session.pump().unwrap();
        session.set_volume(0.5).unwrap();
        let report = session.pump().unwrap();
        let Some(UpdateOutcome::Applied(diff)) = report.graph else {
            panic!("engine attached");
        };
        assert_eq!(diff.retuned, vec![NodeId::volume()]);
        assert!(diff.added.is_empty());
        assert_eq!(session.transport().volume(), 50);
    }

    #[test]
    fn volume_is_squared_and_playthrough_gated() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.set_volume(0.5).unwrap();
        session.pump().unwrap();

        let mut out = [0.0_f32; 128];
        engine.render(Some(&[0.8; 128]), &mut out);
        assert!(out.iter().all(|&v| v == 0.0));

        session.set_playthrough(true);
        session.pump().unwrap();
        engine.render(Some(&[0.8; 128]), &mut out);
        assert!(out.iter().all(|&v| (v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn playback_without_microphone() {
        let time = ManualTime::new();
        let mut session = Session::new(
            config(),
            lesson(10.0),
            HeadlessTransport::new(),
            time,
            Box::new(StaticDevices::denied()),
        )
        .unwrap();
        let _engine = session.attach_engine();
        assert!(session.refresh_devices().unwrap_err().is_recoverable());
        assert!(session.open_microphone().is_err());

        session.play().unwrap();
        session.pump().unwrap();
        assert!(!session.graph().has_node(&NodeId::recorder()));
        assert!(matches!(session.export(), Err(DublineError::NothingToExport)));
    }

    #[test]
    fn committed_take_plays_back() {
        let (mut session, mut engine, _time) = live_session(1.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();
        render(&mut engine, 4, 0.5);
        session.pump().unwrap();
        session.stop().unwrap();
        session.pump().unwrap();

        assert_eq!(session.commit_take().unwrap(), 0);
        assert!(session.store().buffer().is_none());
        assert!(matches!(session.commit_take(), Err(DublineError::NothingToExport)));

        session.seek(0.0).unwrap();
        session.play().unwrap();
        session.pump().unwrap();
        let mut out = [0.0_f32; 128];
        engine.render(None, &mut out);
        assert!(out.iter().all(|&v| (v - 0.5).abs() < 1e-4));
    }

    #[test]
    fn seek_can_disarm_recording() {
        let time = ManualTime::new();
        let mut config = config();
        config.playback.disarm_on_seek = true;
        let mut session = Session::new(
            config,
            lesson(10.0),
            HeadlessTransport::new(),
            time,
            Box::new(StaticDevices::single("Mic")),
        )
        .unwrap();
        session.arm_recording();
        session.seek(1.0).unwrap();
        assert!(session.state().recording);
        session.play().unwrap();
        session.seek(2.0).unwrap();
        assert!(!session.state().recording);
        assert!(session.state().playing);
    }

    #[test]
    fn reselecting_device_reopens_stream() {
        let mut session = Session::new(
            config(),
            lesson(10.0),
            HeadlessTransport::new(),
            ManualTime::new(),
            Box::new(StaticDevices::new(vec![
                AudioDevice {
                    id: "a".to_string(),
                    name: "A".to_string(),
                },
                AudioDevice {
                    id: "b".to_string(),
                    name: "B".to_string(),
                },
            ])),
        )
        .unwrap();
        session.refresh_devices().unwrap();
        assert_eq!(session.selected_device(), Some("a"));
        let first = session.open_microphone().unwrap().id;
        session.select_device("b").unwrap();
        let mic = session.mic().unwrap();
        assert_eq!(mic.device_id, "b");
        assert_ne!(mic.id, first);
        assert!(session.select_device("zzz").is_err());
    }

    #[test]
    fn words_follow_the_playhead() {
        let (mut session, _engine, time) = live_session(10.0);
        session.seek(2.0).unwrap();
        assert_eq!(session.word_state(1.0, 1.5).state, WordState::Past);
        assert_eq!(session.word_state(2.0, 2.5).state, WordState::Present);
        assert_eq!(session.word_state(2.5, 3.0).state, WordState::Future);
        assert_eq!(session.word_state(3.0, 4.0).opacity, 1.0);

        time.set(0.0);
        session.play().unwrap();
        let far = session.word_state(8.0, 10.0).opacity;
        assert!((far - (0.25 + 1.25_f64.powf(-7.0))).abs() < 1e-9);
        assert_eq!(session.word_state(1.5, 2.5).opacity, 1.0);
    }

    #[test]
    fn export_names_artifact_from_lesson() {
        let (mut session, mut engine, _time) = live_session(1.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();
        render(&mut engine, 4, 0.5);
        session.pump().unwrap();

        let artifact = session.export().unwrap();
        let extension = match session.config().export.format {
            crate::ExportFormat::Mp3 => "mp3",
            crate::ExportFormat::Wav => "wav",
        };
        assert_eq!(
            artifact.file_name,
            format!("2019 - Greetings - fr - dub.{extension}")
        );
        assert!(!artifact.bytes.is_empty());
    }

    #[test]
    fn transport_is_muted_at_start() {
        let (session, _engine, _time) = live_session(1.0);
        assert!(session.transport().is_muted());
    }

    #[test]
    fn restart_in_one_tick_drops_previous_run() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();
        render(&mut engine, 4, 0.5);

        // no tick between stopping and playing again
        session.stop().unwrap();
        session.seek(5.0).unwrap();
        session.play().unwrap();
        let report = session.pump().unwrap();
        assert_eq!(report.stale_batches, 1);
        assert!(report.writes.is_empty());

        render(&mut engine, 4, 0.25);
        let report = session.pump().unwrap();
        assert_eq!(
            report.writes,
            vec![WriteOutcome::Written {
                offset: 220_500,
                len: 512
            }]
        );
        let samples = session.store().buffer().unwrap().samples();
        assert!(samples[..512].iter().all(|&v| v == 0));
        assert!(samples[220_500..221_012].iter().all(|&v| v == to_int(0.25)));
    }

    #[test]
    fn replay_at_same_instant_starts_a_new_tap() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();
        render(&mut engine, 4, 0.5);

        session.stop().unwrap();
        session.play().unwrap();
        assert_eq!(session.clock().mark().timestamp_ms, 0.0);
        let report = session.pump().unwrap();
        assert_eq!(report.stale_batches, 1);

        render(&mut engine, 4, 0.25);
        let report = session.pump().unwrap();
        assert_eq!(
            report.writes,
            vec![WriteOutcome::Written { offset: 0, len: 512 }]
        );
        let samples = session.store().buffer().unwrap().samples();
        assert!(samples[..512].iter().all(|&v| v == to_int(0.25)));
    }

    #[test]
    fn seek_while_playing_drops_queued_batches() {
        let (mut session, mut engine, _time) = live_session(10.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();
        render(&mut engine, 4, 0.5);

        session.seek(3.0).unwrap();
        assert!(session.state().playing);
        let report = session.pump().unwrap();
        assert_eq!(report.stale_batches, 1);
        assert!(report.writes.is_empty());

        render(&mut engine, 4, 0.25);
        let report = session.pump().unwrap();
        assert_eq!(
            report.writes,
            vec![WriteOutcome::Written {
                offset: 132_300,
                len: 512
            }]
        );
    }

    #[test]
    fn non_finite_seek_changes_nothing() {
        let (mut session, _engine, _time) = live_session(10.0);
        session.seek(2.0).unwrap();
        session.arm_recording();
        session.play().unwrap();
        assert!(session.seek(f64::NAN).is_err());
        assert!(session.seek(f64::INFINITY).is_err());
        assert_eq!(session.time(), 2.0);
        assert!(session.state().playing);
        assert!(session.state().recording);
        assert_eq!(session.store().cursor(), 88_200);
    }

    #[test]
    fn graph_edits_between_blocks_lose_no_capture() {
        let (mut session, mut engine, time) = live_session(10.0);
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();

        render(&mut engine, 2, 0.5);
        session.set_volume(0.5).unwrap();
        session.set_playthrough(true);
        time.advance(40.0);
        let report = session.pump().unwrap();
        assert!(report.sampled);
        render(&mut engine, 2, 0.25);

        let report = session.pump().unwrap();
        assert_eq!(
            report.writes,
            vec![WriteOutcome::Written { offset: 0, len: 512 }]
        );
        let samples = session.store().buffer().unwrap().samples();
        assert!(samples[..256].iter().all(|&v| v == to_int(0.5)));
        assert!(samples[256..512].iter().all(|&v| v == to_int(0.25)));
    }

    #[test]
    fn capture_survives_concurrent_control_work() {
        const BLOCKS: usize = 400;
        let level = |block: usize| (block % 7 + 1) as f32 / 10.0;

        let time = ManualTime::new();
        let mut config = config();
        config.audio.queue_capacity = 256;
        let mut session = Session::new(
            config,
            lesson(10.0),
            HeadlessTransport::new(),
            time.clone(),
            Box::new(StaticDevices::single("Mic")),
        )
        .unwrap();
        let mut engine = session.attach_engine();
        session.refresh_devices().unwrap();
        session.open_microphone().unwrap();
        session.arm_recording();
        session.play().unwrap();
        session.pump().unwrap();

        let renderer = std::thread::spawn(move || {
            let mut out = [0.0_f32; 128];
            for block in 0..BLOCKS {
                engine.render(Some(&[level(block); 128]), &mut out);
            }
        });

        let mut written = 0;
        let mut step = 0_u32;
        while !renderer.is_finished() {
            step += 1;
            session.set_playthrough(step % 2 == 0);
            session.set_volume(if step % 3 == 0 { 0.5 } else { 1.0 }).unwrap();
            // stay inside the lesson while letting the sampler fire
            if time.now_ms() < 9_000.0 {
                time.advance(1.0);
            }
            written += session.pump().unwrap().samples_written();
        }
        renderer.join().unwrap();
        written += session.pump().unwrap().samples_written();

        assert_eq!(written, BLOCKS * 128);
        let samples = session.store().buffer().unwrap().samples();
        for block in 0..BLOCKS {
            let expected = to_int(level(block));
            assert!(
                samples[block * 128..(block + 1) * 128]
                    .iter()
                    .all(|&v| v == expected),
                "block {block} is misplaced"
            );
        }
    }
}
