use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::{transport::TransportState, DublineError, Result, VideoTransport};

/// Millisecond wall clock the playback position is derived from.
pub trait TimeSource {
    fn now_ms(&self) -> f64;
}

/// Real wall clock, counted from construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Clock advanced by hand. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualTime {
    millis: Arc<AtomicU64>,
}

impl ManualTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: f64) {
        self.millis.store(ms.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, ms: f64) {
        self.set(self.now_ms() + ms);
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> f64 {
        f64::from_bits(self.millis.load(Ordering::Acquire))
    }
}

/// Checkpoint pairing a timeline position with the wall clock. The live
/// position is always derived from the latest mark, never accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackMark {
    pub time: f64,
    pub timestamp_ms: f64,
    pub sample_offset: usize,
}

impl PlaybackMark {
    pub fn new(time: f64, timestamp_ms: f64, sample_rate: u32) -> Self {
        Self {
            time,
            timestamp_ms,
            sample_offset: sample_index(time, sample_rate),
        }
    }

    /// Timeline position at wall-clock `now_ms`.
    pub fn position_at(&self, now_ms: f64) -> f64 {
        self.time + (now_ms - self.timestamp_ms) / 1000.0
    }
}

/// Sample index of a timeline position.
pub fn sample_index(time: f64, sample_rate: u32) -> usize {
    (time.max(0.0) * f64::from(sample_rate)).round() as usize
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    Tick(f64),
    /// Playback ran past the end and was stopped; carries the clamped time.
    Ended(f64),
}

/// Play/stop/seek state machine keeping the timeline and the video player in
/// step.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    sample_rate: u32,
    duration: f64,
    tick_interval_ms: f64,
    playing: bool,
    time: f64,
    mark: PlaybackMark,
    marks: u64,
    next_tick_ms: Option<f64>,
}

impl PlaybackClock {
    pub fn new(sample_rate: u32, duration: f64, tick_interval_ms: f64) -> Self {
        Self {
            sample_rate,
            duration: duration.max(0.0),
            tick_interval_ms,
            playing: false,
            time: 0.0,
            mark: PlaybackMark::new(0.0, 0.0, sample_rate),
            marks: 0,
            next_tick_ms: None,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn mark(&self) -> PlaybackMark {
        self.mark
    }

    /// Marks created so far. Each play or seek starts a new run, and this
    /// count tells runs apart even when their timestamps coincide.
    pub fn run(&self) -> u64 {
        self.marks
    }

    pub fn play<V>(&mut self, transport: &mut V, now_ms: f64) -> Result<PlaybackMark>
    where
        V: VideoTransport + ?Sized,
    {
        transport.play()?;
        self.playing = true;
        self.next_tick_ms = Some(now_ms + self.tick_interval_ms);
        let mark = self.remark(self.time, now_ms);
        tracing::info!(time = mark.time, sample = mark.sample_offset, "playback started");
        Ok(mark)
    }

    /// Stops the clock. The clock is stopped even if the player refuses to
    /// pause.
    pub fn stop<V>(&mut self, transport: &mut V) -> Result<()>
    where
        V: VideoTransport + ?Sized,
    {
        self.playing = false;
        self.next_tick_ms = None;
        tracing::info!(time = self.time, "playback stopped");
        transport.pause()
    }

    /// Moves the timeline to `time`, clamped to the lesson. The player is
    /// told to play or pause according to what it reports after the seek.
    /// Seeking past the end while playing stops playback. Non-finite targets
    /// are rejected before anything changes.
    pub fn seek<V>(&mut self, transport: &mut V, time: f64, now_ms: f64) -> Result<PlaybackMark>
    where
        V: VideoTransport + ?Sized,
    {
        if !time.is_finite() {
            return Err(DublineError::InvalidInput("seek target must be a finite time"));
        }
        let target = time.clamp(0.0, self.duration);
        transport.seek(target)?;
        match transport.state()? {
            TransportState::Playing => transport.play()?,
            _ => transport.pause()?,
        }

        self.time = target;
        let mark = self.remark(target, now_ms);
        tracing::info!(time = target, sample = mark.sample_offset, "seek");

        if time > self.duration && self.playing {
            self.stop(transport)?;
        }
        Ok(mark)
    }

    /// Fires a tick when one is due.
    pub fn poll<V>(&mut self, transport: &mut V, now_ms: f64) -> Result<Option<ClockEvent>>
    where
        V: VideoTransport + ?Sized,
    {
        let Some(due) = self.next_tick_ms.filter(|_| self.playing) else {
            return Ok(None);
        };
        if now_ms < due {
            return Ok(None);
        }

        let missed = ((now_ms - due) / self.tick_interval_ms).floor() + 1.0;
        self.next_tick_ms = Some(due + missed * self.tick_interval_ms);
        self.tick(transport, now_ms).map(Some)
    }

    fn tick<V>(&mut self, transport: &mut V, now_ms: f64) -> Result<ClockEvent>
    where
        V: VideoTransport + ?Sized,
    {
        let position = self.mark.position_at(now_ms);
        if position > self.duration {
            self.time = self.duration;
            tracing::info!(duration = self.duration, "reached end of lesson");
            self.stop(transport)?;
            return Ok(ClockEvent::Ended(self.duration));
        }
        self.time = position;
        Ok(ClockEvent::Tick(position))
    }

    fn remark(&mut self, time: f64, now_ms: f64) -> PlaybackMark {
        self.mark = PlaybackMark::new(time, now_ms, self.sample_rate);
        self.marks += 1;
        self.mark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeadlessTransport;

    const RATE: u32 = 44_100;

    fn clock(duration: f64) -> PlaybackClock {
        PlaybackClock::new(RATE, duration, 20.0)
    }

    #[test]
    fn mark_sample_offset_is_rounded_time() {
        for &time in &[0.0, 0.5, 1.234_567, 5.0, 9.999_99, 10.0] {
            let mark = PlaybackMark::new(time, 0.0, RATE);
            assert_eq!(mark.sample_offset, (time * f64::from(RATE)).round() as usize);
        }
    }

    #[test]
    fn repeated_seeks_do_not_drift() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(10.0);
        let first = clock.seek(&mut transport, 3.3, 0.0).unwrap();
        for step in 0..500 {
            let mark = clock.seek(&mut transport, 3.3, step as f64).unwrap();
            assert_eq!(mark.sample_offset, first.sample_offset);
            assert_eq!(clock.time(), 3.3);
        }
    }

    #[test]
    fn ticks_derive_from_the_mark() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(10.0);
        clock.play(&mut transport, 1_000.0).unwrap();
        assert_eq!(transport.state().unwrap(), TransportState::Playing);

        assert_eq!(clock.poll(&mut transport, 1_010.0).unwrap(), None);
        assert_eq!(
            clock.poll(&mut transport, 1_020.0).unwrap(),
            Some(ClockEvent::Tick(0.02))
        );
        // a late poll catches up in one tick
        let event = clock.poll(&mut transport, 2_500.0).unwrap();
        assert_eq!(event, Some(ClockEvent::Tick(1.5)));
        assert_eq!(clock.poll(&mut transport, 2_505.0).unwrap(), None);
    }

    #[test]
    fn stop_cancels_ticks() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(10.0);
        clock.play(&mut transport, 0.0).unwrap();
        clock.poll(&mut transport, 100.0).unwrap();
        clock.stop(&mut transport).unwrap();
        assert_eq!(transport.state().unwrap(), TransportState::Paused);
        assert_eq!(clock.poll(&mut transport, 500.0).unwrap(), None);
        assert!((clock.time() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn seek_follows_player_state() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(10.0);
        clock.seek(&mut transport, 4.0, 0.0).unwrap();
        assert_eq!(transport.state().unwrap(), TransportState::Unstarted);
        assert!(!clock.is_playing());

        clock.play(&mut transport, 0.0).unwrap();
        clock.seek(&mut transport, 2.0, 50.0).unwrap();
        assert_eq!(transport.state().unwrap(), TransportState::Playing);
        assert_eq!(transport.position(), 2.0);
        assert!(clock.is_playing());
        assert_eq!(clock.mark().time, 2.0);
        assert_eq!(clock.mark().timestamp_ms, 50.0);
    }

    #[test]
    fn runs_out_at_duration() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(1.0);
        clock.play(&mut transport, 0.0).unwrap();
        assert_eq!(
            clock.poll(&mut transport, 1_500.0).unwrap(),
            Some(ClockEvent::Ended(1.0))
        );
        assert!(!clock.is_playing());
        assert_eq!(clock.time(), 1.0);
        assert_eq!(transport.state().unwrap(), TransportState::Paused);
    }

    #[test]
    fn seek_past_end_clamps_and_stops() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(10.0);
        clock.play(&mut transport, 0.0).unwrap();
        let mark = clock.seek(&mut transport, 12.0, 10.0).unwrap();
        assert_eq!(mark.time, 10.0);
        assert_eq!(mark.sample_offset, 441_000);
        assert!(!clock.is_playing());
        assert_eq!(clock.seek(&mut transport, -3.0, 20.0).unwrap().time, 0.0);
    }

    #[test]
    fn non_finite_seek_is_rejected() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(1.0);
        clock.seek(&mut transport, 0.5, 0.0).unwrap();
        clock.play(&mut transport, 0.0).unwrap();
        for target in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(clock.seek(&mut transport, target, 10.0).is_err());
        }
        assert_eq!(clock.time(), 0.5);
        assert_eq!(transport.position(), 0.5);

        // the end-of-lesson stop still fires
        assert_eq!(
            clock.poll(&mut transport, 600.0).unwrap(),
            Some(ClockEvent::Ended(1.0))
        );
    }

    #[test]
    fn every_mark_starts_a_new_run() {
        let mut transport = HeadlessTransport::new();
        let mut clock = clock(10.0);
        assert_eq!(clock.run(), 0);
        clock.play(&mut transport, 0.0).unwrap();
        clock.stop(&mut transport).unwrap();
        clock.play(&mut transport, 0.0).unwrap();
        assert_eq!(clock.run(), 2);
        clock.seek(&mut transport, 1.0, 0.0).unwrap();
        assert_eq!(clock.run(), 3);
        assert!(clock.seek(&mut transport, f64::NAN, 0.0).is_err());
        assert_eq!(clock.run(), 3);
    }

    #[test]
    fn manual_time_is_shared() {
        let time = ManualTime::new();
        let other = time.clone();
        time.advance(12.5);
        assert_eq!(other.now_ms(), 12.5);
    }
}
