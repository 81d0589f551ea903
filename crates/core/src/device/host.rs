//! Hardware audio through `cpal`.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, Host, SampleRate, Stream, StreamConfig,
};
use rtrb::{Consumer, RingBuffer};

use super::{AudioDevice, CaptureConstraints, DeviceProvider, MicStream};
use crate::{engine::Engine, AudioConfig, DublineError, Result};

fn capture_error(err: impl std::fmt::Display) -> DublineError {
    DublineError::Capture(err.to_string())
}

/// Input devices of the default host. Devices are identified by name.
pub struct CpalDevices {
    host: Host,
    opened: u64,
}

impl CpalDevices {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            opened: 0,
        }
    }

    fn find(&self, id: Option<&str>) -> Result<Device> {
        let mut devices = self.host.input_devices().map_err(capture_error)?;
        let found = match id {
            Some(id) => devices.find(|device| device.name().is_ok_and(|name| name == id)),
            None => self.host.default_input_device(),
        };
        found.ok_or_else(|| DublineError::Capture("no matching input device".to_string()))
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for CpalDevices {
    fn input_devices(&mut self) -> Result<Vec<AudioDevice>> {
        let devices = self.host.input_devices().map_err(capture_error)?;
        Ok(devices
            .filter_map(|device| device.name().ok())
            .filter(|name| !name.is_empty())
            .map(|name| AudioDevice {
                id: name.clone(),
                name,
            })
            .collect())
    }

    fn open_input(&mut self, constraints: &CaptureConstraints) -> Result<MicStream> {
        let device = self.find(constraints.device_id.as_deref())?;
        let device_id = device.name().map_err(capture_error)?;
        let rate = SampleRate(constraints.sample_rate);
        let supported = device
            .supported_input_configs()
            .map_err(capture_error)?
            .any(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate());
        if !supported {
            return Err(DublineError::Capture(format!(
                "`{device_id}` cannot capture at {} Hz",
                constraints.sample_rate
            )));
        }

        self.opened += 1;
        tracing::info!(device = %device_id, "microphone opened");
        Ok(MicStream {
            id: self.opened,
            device_id,
            sample_rate: constraints.sample_rate,
        })
    }
}

/// Running full-duplex streams driving the engine. Capture goes through a
/// ring buffer into the output callback, which owns the engine and renders
/// it in fixed-size quanta.
pub struct CpalHost {
    input: Option<Stream>,
    output: Stream,
    overruns: Arc<AtomicU64>,
}

impl CpalHost {
    /// Starts output, and capture from `input_device` when given.
    pub fn start(input_device: Option<&str>, audio: &AudioConfig, engine: Engine) -> Result<Self> {
        let host = cpal::default_host();
        let quantum = audio.render_quantum;
        let (producer, consumer) = RingBuffer::new(quantum * 16);
        let overruns = Arc::new(AtomicU64::new(0));

        let input = match input_device {
            Some(name) => {
                let device = host
                    .input_devices()
                    .map_err(capture_error)?
                    .find(|device| device.name().is_ok_and(|found| found == name))
                    .ok_or_else(|| DublineError::Capture(format!("no input device `{name}`")))?;
                Some(build_input(&device, audio.sample_rate, producer, overruns.clone())?)
            }
            None => None,
        };

        let output_device = host
            .default_output_device()
            .ok_or_else(|| DublineError::Capture("no output device".to_string()))?;
        let output = build_output(&output_device, audio.sample_rate, quantum, consumer, engine)?;

        if let Some(stream) = &input {
            stream.play().map_err(capture_error)?;
        }
        output.play().map_err(capture_error)?;
        tracing::info!(sample_rate = audio.sample_rate, quantum, "audio host started");
        Ok(Self {
            input,
            output,
            overruns,
        })
    }

    /// Captured samples dropped because the output side fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn stop(&self) -> Result<()> {
        if let Some(stream) = &self.input {
            stream.pause().map_err(capture_error)?;
        }
        self.output.pause().map_err(capture_error)?;
        let overruns = self.overruns();
        if overruns > 0 {
            tracing::warn!(overruns, "captured samples were dropped");
        }
        Ok(())
    }
}

fn stream_config(device: &Device, sample_rate: u32, input: bool) -> Result<StreamConfig> {
    let channels = if input {
        device.default_input_config().map_err(capture_error)?.channels()
    } else {
        device.default_output_config().map_err(capture_error)?.channels()
    };
    Ok(StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn build_input(
    device: &Device,
    sample_rate: u32,
    mut producer: rtrb::Producer<f32>,
    overruns: Arc<AtomicU64>,
) -> Result<Stream> {
    let config = stream_config(device, sample_rate, true)?;
    let channels = usize::from(config.channels.max(1));

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // first channel only
                let mut dropped = 0;
                for frame in data.chunks(channels) {
                    if producer.push(frame[0]).is_err() {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    overruns.fetch_add(dropped, Ordering::Relaxed);
                }
            },
            |err| tracing::error!("audio input stream error: {err}"),
            None,
        )
        .map_err(capture_error)
}

fn build_output(
    device: &Device,
    sample_rate: u32,
    quantum: usize,
    mut capture: Consumer<f32>,
    mut engine: Engine,
) -> Result<Stream> {
    let config = stream_config(device, sample_rate, false)?;
    let channels = usize::from(config.channels.max(1));

    let mut captured = vec![0.0_f32; quantum];
    let mut rendered = vec![0.0_f32; quantum];
    let mut cursor = quantum;

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    if cursor == quantum {
                        let input = match capture.read_chunk(quantum) {
                            Ok(chunk) => {
                                let (first, second) = chunk.as_slices();
                                captured[..first.len()].copy_from_slice(first);
                                captured[first.len()..].copy_from_slice(second);
                                chunk.commit_all();
                                Some(&captured[..])
                            }
                            Err(_) => None,
                        };
                        engine.render(input, &mut rendered);
                        cursor = 0;
                    }
                    frame.fill(rendered[cursor]);
                    cursor += 1;
                }
            },
            |err| tracing::error!("audio output stream error: {err}"),
            None,
        )
        .map_err(capture_error)
}
