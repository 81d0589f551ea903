//! Timer-driven reads of the live analyser for visualisation.

use serde::{Deserialize, Serialize};

use crate::{graph::GraphManager, graph::NodeId, util, AnalyserConfig, Result};

/// One read of the analyser, already shaped for drawing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyserSnapshot {
    /// Amplitudes, one per analyser sample.
    pub time_domain: Vec<f32>,
    /// Weighted magnitudes on log-spaced frequency buckets.
    pub frequency: Vec<f32>,
    pub taken_at_ms: f64,
}

/// Maps centred time-domain bytes to amplitudes.
pub fn time_domain_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .iter()
        .map(|&value| 1.0 - f32::from(value) / 128.0)
        .collect()
}

/// Scales spectrum bytes, tilts them towards the high bins and resamples the
/// linear `[0, nyquist]` bins onto `buckets` log-spaced points over
/// `[min_frequency, nyquist]`.
pub fn frequency_values(bytes: &[u8], nyquist: f32, min_frequency: f32, buckets: usize) -> Vec<f32> {
    let len = bytes.len().max(1) as f32;
    let weighted: Vec<f32> = bytes
        .iter()
        .enumerate()
        .map(|(index, &value)| (index as f32 / len).powf(0.5) * f32::from(value) / 128.0)
        .collect();
    util::log_space(&weighted, 0.0, nyquist, min_frequency, nyquist, buckets)
}

#[derive(Debug)]
pub struct AnalyserSampler {
    node: NodeId,
    interval_ms: f64,
    min_frequency: f32,
    buckets: usize,
    next_due_ms: Option<f64>,
    time_bytes: Vec<u8>,
    frequency_bytes: Vec<u8>,
    snapshot: AnalyserSnapshot,
    samples_taken: u64,
}

impl AnalyserSampler {
    pub fn new(config: &AnalyserConfig) -> Self {
        Self {
            node: NodeId::analyser(),
            interval_ms: config.interval_ms,
            min_frequency: config.min_frequency,
            buckets: config.bucket_count,
            next_due_ms: None,
            time_bytes: Vec::new(),
            frequency_bytes: Vec::new(),
            snapshot: AnalyserSnapshot::default(),
            samples_taken: 0,
        }
    }

    /// Latest snapshot. Empty until the first successful read.
    pub fn snapshot(&self) -> &AnalyserSnapshot {
        &self.snapshot
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    /// Samples when the interval has elapsed. Returns whether a new snapshot
    /// was taken.
    pub fn poll(&mut self, graph: &mut GraphManager, now_ms: f64) -> Result<bool> {
        if self.next_due_ms.is_some_and(|due| now_ms < due) {
            return Ok(false);
        }
        self.next_due_ms = Some(now_ms + self.interval_ms);
        self.sample(graph, now_ms)
    }

    /// Reads the analyser immediately. Without an engine or an analyser node
    /// the previous snapshot is kept and `false` is returned. The transform
    /// runs here, on the control thread.
    pub fn sample(&mut self, graph: &mut GraphManager, now_ms: f64) -> Result<bool> {
        let Some(sample_rate) = graph.engine().map(|engine| engine.sample_rate()) else {
            return Ok(false);
        };
        let nyquist = sample_rate as f32 / 2.0;
        let Some(analyser) = graph.analyser_mut(&self.node) else {
            return Ok(false);
        };

        self.time_bytes.resize(analyser.fft_size(), 128);
        self.frequency_bytes.resize(analyser.frequency_bin_count(), 0);
        analyser.byte_time_domain(&mut self.time_bytes);
        analyser.byte_frequency(&mut self.frequency_bytes)?;

        self.snapshot = AnalyserSnapshot {
            time_domain: time_domain_values(&self.time_bytes),
            frequency: frequency_values(
                &self.frequency_bytes,
                nyquist,
                self.min_frequency,
                self.buckets,
            ),
            taken_at_ms: now_ms,
        };
        self.samples_taken += 1;
        tracing::trace!(at = now_ms, "analyser sampled");
        Ok(true)
    }
}
