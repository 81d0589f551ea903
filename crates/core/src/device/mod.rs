//! Capture device enumeration and microphone streams.

use serde::{Deserialize, Serialize};

use crate::{AudioConfig, DublineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
}

/// What the capture stream is asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// `None` picks the first available device.
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    pub fn from_config(audio: &AudioConfig, device_id: Option<String>) -> Self {
        Self {
            device_id,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            echo_cancellation: audio.echo_cancellation,
            noise_suppression: audio.noise_suppression,
            auto_gain_control: audio.auto_gain_control,
        }
    }
}

/// An opened microphone. `id` changes every time a stream is (re)opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicStream {
    pub id: u64,
    pub device_id: String,
    pub sample_rate: u32,
}

/// Source of capture devices. Failures are [`DublineError::Capture`] so
/// callers can carry on without a microphone.
pub trait DeviceProvider {
    /// Named input devices, in host order.
    fn input_devices(&mut self) -> Result<Vec<AudioDevice>>;
    fn open_input(&mut self, constraints: &CaptureConstraints) -> Result<MicStream>;
}

/// Fixed device list, for offline sessions and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDevices {
    devices: Vec<AudioDevice>,
    denied: bool,
    opened: u64,
}

impl StaticDevices {
    pub fn new(devices: Vec<AudioDevice>) -> Self {
        Self {
            devices,
            denied: false,
            opened: 0,
        }
    }

    /// A single device named `name`.
    pub fn single(name: &str) -> Self {
        Self::new(vec![AudioDevice {
            id: name.to_lowercase().replace(' ', "-"),
            name: name.to_string(),
        }])
    }

    /// Provider whose capture permission was refused.
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::default()
        }
    }

    fn check_permission(&self) -> Result<()> {
        if self.denied {
            return Err(DublineError::Capture("microphone permission denied".to_string()));
        }
        Ok(())
    }
}

impl DeviceProvider for StaticDevices {
    fn input_devices(&mut self) -> Result<Vec<AudioDevice>> {
        self.check_permission()?;
        Ok(self
            .devices
            .iter()
            .filter(|device| !device.name.is_empty())
            .cloned()
            .collect())
    }

    fn open_input(&mut self, constraints: &CaptureConstraints) -> Result<MicStream> {
        let devices = self.input_devices()?;
        let device = match &constraints.device_id {
            Some(id) => devices.into_iter().find(|device| &device.id == id),
            None => devices.into_iter().next(),
        }
        .ok_or_else(|| DublineError::Capture("no matching input device".to_string()))?;

        self.opened += 1;
        Ok(MicStream {
            id: self.opened,
            device_id: device.id,
            sample_rate: constraints.sample_rate,
        })
    }
}

#[cfg(feature = "device")]
mod host;

#[cfg(feature = "device")]
pub use host::{CpalDevices, CpalHost};
