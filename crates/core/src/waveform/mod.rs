use crate::{processor::Batch, util, util::SampleRange};

/// Fixed-length 16-bit recording of the whole lesson timeline. Sample `i`
/// belongs to time `i / sample_rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl WaveformBuffer {
    pub fn new(sample_rate: u32, duration_seconds: f64) -> Self {
        let len = (f64::from(sample_rate) * duration_seconds.max(0.0)).round() as usize;
        Self {
            samples: vec![0; len],
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Copies `data` in at `offset`, truncated at the buffer end. Returns
    /// how many samples landed.
    pub fn write(&mut self, offset: usize, data: &[i16]) -> usize {
        if offset >= self.samples.len() {
            return 0;
        }
        let count = data.len().min(self.samples.len() - offset);
        self.samples[offset..offset + count].copy_from_slice(&data[..count]);
        count
    }

    /// Min/max over a span, for waveform display.
    pub fn range(&self, start: usize, end: usize) -> SampleRange {
        util::range(&self.samples, start, end)
    }

    pub fn to_float(&self) -> Vec<f32> {
        util::to_float_buffer(&self.samples)
    }
}

/// Flags that decide what happens to an incoming batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureGate {
    /// The batch came from the recorder tap currently in the graph.
    pub tap_live: bool,
    pub playing: bool,
    pub recording: bool,
}

/// What [`WaveformStore::receive`] did with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Arrived after its tap was torn down; discarded.
    Stale,
    /// Not playing; offset unchanged.
    Idle,
    /// Playing but not armed; only the offset moved.
    Advanced,
    Written { offset: usize, len: usize },
}

/// Owner of the lesson's [`WaveformBuffer`] and the running write offset.
#[derive(Debug)]
pub struct WaveformStore {
    buffer: Option<WaveformBuffer>,
    sample_rate: u32,
    duration_seconds: f64,
    cursor: usize,
    updates: u64,
}

impl WaveformStore {
    pub fn new(sample_rate: u32, duration_seconds: f64) -> Self {
        Self {
            buffer: None,
            sample_rate,
            duration_seconds,
            cursor: 0,
            updates: 0,
        }
    }

    /// Moves the running offset to a freshly created mark.
    pub fn mark(&mut self, sample_offset: usize) {
        self.cursor = sample_offset;
    }

    /// Absolute sample index the next batch will be written to.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn buffer(&self) -> Option<&WaveformBuffer> {
        self.buffer.as_ref()
    }

    /// Incremented on every write, for display invalidation.
    pub fn update_count(&self) -> u64 {
        self.updates
    }

    /// Applies one recorder batch.
    pub fn receive(&mut self, batch: &Batch, gate: CaptureGate) -> WriteOutcome {
        if !gate.tap_live {
            return WriteOutcome::Stale;
        }

        let sample_rate = self.sample_rate;
        let duration = self.duration_seconds;
        let buffer = self
            .buffer
            .get_or_insert_with(|| WaveformBuffer::new(sample_rate, duration));

        if !gate.playing {
            return WriteOutcome::Idle;
        }

        let offset = self.cursor;
        self.cursor += batch.len();

        if !gate.recording {
            return WriteOutcome::Advanced;
        }

        let len = buffer.write(offset, &batch.data);
        self.updates += 1;
        WriteOutcome::Written { offset, len }
    }

    /// Hands out the recorded buffer, leaving the store empty.
    pub fn take(&mut self) -> Option<WaveformBuffer> {
        self.updates += 1;
        self.buffer.take()
    }

    pub fn range(&self, start: usize, end: usize) -> SampleRange {
        self.buffer
            .as_ref()
            .map(|buffer| buffer.range(start, end))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYING_ARMED: CaptureGate = CaptureGate {
        tap_live: true,
        playing: true,
        recording: true,
    };

    fn batch(value: i16, len: usize) -> Batch {
        Batch {
            data: vec![value; len],
            index: 0,
            tap: 1,
        }
    }

    #[test]
    fn writes_consecutive_batches_from_mark() {
        let mut store = WaveformStore::new(44_100, 10.0);
        store.mark(0);
        for _ in 0..3 {
            store.receive(&batch(16_384, 512), PLAYING_ARMED);
        }

        let buffer = store.buffer().unwrap();
        assert_eq!(buffer.len(), 441_000);
        assert!(buffer.samples()[..1536].iter().all(|&v| v == 16_384));
        assert!(buffer.samples()[1536..].iter().all(|&v| v == 0));
        assert_eq!(store.cursor(), 1536);
    }

    #[test]
    fn disarmed_batches_only_advance() {
        let mut store = WaveformStore::new(100, 10.0);
        let gate = CaptureGate {
            recording: false,
            ..PLAYING_ARMED
        };
        for step in 1..=4 {
            assert_eq!(store.receive(&batch(9, 25), gate), WriteOutcome::Advanced);
            assert_eq!(store.cursor(), step * 25);
        }
        assert!(store.buffer().unwrap().samples().iter().all(|&v| v == 0));
        assert_eq!(store.update_count(), 0);

        assert_eq!(
            store.receive(&batch(9, 25), PLAYING_ARMED),
            WriteOutcome::Written { offset: 100, len: 25 }
        );
    }

    #[test]
    fn idle_and_stale_batches_are_ignored() {
        let mut store = WaveformStore::new(100, 1.0);
        store.mark(10);
        let stopped = CaptureGate {
            playing: false,
            ..PLAYING_ARMED
        };
        assert_eq!(store.receive(&batch(1, 10), stopped), WriteOutcome::Idle);
        let stale = CaptureGate {
            tap_live: false,
            ..PLAYING_ARMED
        };
        assert_eq!(store.receive(&batch(1, 10), stale), WriteOutcome::Stale);
        assert_eq!(store.cursor(), 10);
        assert!(store.buffer().unwrap().samples().iter().all(|&v| v == 0));
    }

    #[test]
    fn truncates_at_capacity() {
        let mut store = WaveformStore::new(10, 1.0);
        store.mark(8);
        let outcome = store.receive(&batch(3, 5), PLAYING_ARMED);
        assert_eq!(outcome, WriteOutcome::Written { offset: 8, len: 2 });
        assert_eq!(store.cursor(), 13);
        assert_eq!(
            store.receive(&batch(3, 5), PLAYING_ARMED),
            WriteOutcome::Written { offset: 13, len: 0 }
        );
    }

    #[test]
    fn take_empties_the_store() {
        let mut store = WaveformStore::new(10, 1.0);
        store.receive(&batch(3, 5), PLAYING_ARMED);
        assert!(store.take().is_some());
        assert!(store.buffer().is_none());
        assert_eq!(store.range(0, 10), SampleRange::default());
    }
}
