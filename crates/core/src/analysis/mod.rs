use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::{AnalyserConfig, DublineError, Result};

/// Smallest and largest supported transform sizes.
pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32_768;

/// Rolling analyser over the most recent `fft_size` samples of a signal.
///
/// The byte outputs follow the browser analyser node conventions: time
/// samples are centred on 128 and spectrum bins are decibel magnitudes mapped
/// linearly from `[min_decibels, max_decibels]` onto `[0, 255]`.
pub struct AnalyserNode {
    fft_size: usize,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    history: Vec<f32>,
    write_pos: usize,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    fft: FftResources,
}

impl AnalyserNode {
    pub fn new(fft_size: usize) -> Result<Self> {
        Self::with_config(&AnalyserConfig {
            fft_size,
            ..AnalyserConfig::default()
        })
    }

    pub fn with_config(config: &AnalyserConfig) -> Result<Self> {
        let fft_size = config.fft_size;
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) {
            return Err(DublineError::InvalidInput(
                "analyser fft size must be a power of two between 32 and 32768",
            ));
        }

        Ok(Self {
            fft_size,
            smoothing: config.smoothing,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            history: vec![0.0; fft_size],
            write_pos: 0,
            window: (0..fft_size).map(|i| blackman_value(i, fft_size)).collect(),
            smoothed: vec![0.0; fft_size / 2],
            fft: FftResources::new(fft_size),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Appends a block of input to the rolling history.
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// Oldest-to-newest view of the history.
    fn ordered(&self) -> impl Iterator<Item = f32> + '_ {
        self.history[self.write_pos..]
            .iter()
            .chain(&self.history[..self.write_pos])
            .copied()
    }

    /// Fills `out` with the latest waveform as unsigned bytes.
    pub fn byte_time_domain(&self, out: &mut [u8]) {
        for (slot, sample) in out.iter_mut().zip(self.ordered()) {
            *slot = (128.0 * (1.0 + sample)).clamp(0.0, 255.0) as u8;
        }
    }

    /// Fills `out` with the latest spectrum as unsigned bytes.
    pub fn byte_frequency(&mut self, out: &mut [u8]) -> Result<()> {
        self.update_spectrum()?;
        let range = self.max_decibels - self.min_decibels;
        for (slot, magnitude) in out.iter_mut().zip(&self.smoothed) {
            let decibels = 20.0 * magnitude.max(f32::MIN_POSITIVE).log10();
            let scaled = 255.0 / range * (decibels - self.min_decibels);
            *slot = scaled.clamp(0.0, 255.0) as u8;
        }
        Ok(())
    }

    fn update_spectrum(&mut self) -> Result<()> {
        let ordered: Vec<f32> = self.ordered().collect();
        for ((input, sample), weight) in self.fft.input.iter_mut().zip(ordered).zip(&self.window) {
            *input = sample * weight;
        }

        self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.spectrum,
            &mut self.fft.scratch,
        )?;

        let scale = 1.0 / self.fft_size as f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.fft.spectrum) {
            let magnitude = bin.norm() * scale;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
        }
        Ok(())
    }
}

/// Splits an analyser into the render-side tap and the control-side feed.
/// The ring holds `capacity` samples; the tap drops what does not fit until
/// the feed catches up.
pub fn analyser_channel(node: AnalyserNode, capacity: usize) -> (AnalyserTap, AnalyserFeed) {
    let (producer, consumer) = RingBuffer::new(capacity.max(node.fft_size()));
    (
        AnalyserTap {
            producer,
            dropped: 0,
        },
        AnalyserFeed { consumer, node },
    )
}

/// Copies rendered blocks out of the audio thread. No transform runs here.
pub struct AnalyserTap {
    producer: Producer<f32>,
    dropped: u64,
}

impl AnalyserTap {
    pub fn push(&mut self, block: &[f32]) {
        let room = self.producer.slots().min(block.len());
        if let Ok(chunk) = self.producer.write_chunk_uninit(room) {
            chunk.fill_from_iter(block.iter().copied());
        }
        self.dropped += (block.len() - room) as u64;
    }

    /// Samples discarded because the feed fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Control-side analyser, fed from an [`AnalyserTap`].
pub struct AnalyserFeed {
    consumer: Consumer<f32>,
    node: AnalyserNode,
}

impl AnalyserFeed {
    /// Moves everything the tap has published into the rolling history.
    pub fn sync(&mut self) {
        let Ok(chunk) = self.consumer.read_chunk(self.consumer.slots()) else {
            return;
        };
        let (first, second) = chunk.as_slices();
        self.node.push(first);
        self.node.push(second);
        chunk.commit_all();
    }

    /// The analyser with the history brought up to date.
    pub fn analyser_mut(&mut self) -> &mut AnalyserNode {
        self.sync();
        &mut self.node
    }
}

impl fmt::Debug for AnalyserTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserTap")
            .field("free", &self.producer.slots())
            .field("dropped", &self.dropped)
            .finish()
    }
}

impl fmt::Debug for AnalyserFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserFeed")
            .field("pending", &self.consumer.slots())
            .field("node", &self.node)
            .finish()
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        Self {
            plan,
            scratch,
            spectrum,
            input,
        }
    }
}

impl fmt::Debug for AnalyserNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyserNode")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .field("min_decibels", &self.min_decibels)
            .field("max_decibels", &self.max_decibels)
            .finish()
    }
}

fn blackman_value(index: usize, len: usize) -> f32 {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    let phase = 2.0 * PI * index as f32 / len as f32;
    a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
}
