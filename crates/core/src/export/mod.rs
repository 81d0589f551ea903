//! Turns the recorded waveform into a downloadable audio file.

use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use crate::{
    config::{ExportConfig, ExportFormat},
    util::{to_float_buffer, to_int},
    waveform::WaveformBuffer,
    DublineError, Result,
};

/// Samples handed to the encoder per call.
const ENCODE_CHUNK: usize = 1152 * 8;

/// Incremental PCM encoder. Output from every `encode` call followed by the
/// `finalize` tail forms the complete file.
pub trait StreamEncoder {
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>>;
    /// Drains everything still buffered. Must be called exactly once.
    fn finalize(&mut self) -> Result<Vec<u8>>;
    fn mime_type(&self) -> &'static str;
    fn extension(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
}

impl EncoderSettings {
    pub fn new(sample_rate: u32, config: &ExportConfig) -> Self {
        Self {
            sample_rate,
            bitrate_kbps: config.bitrate_kbps,
        }
    }
}

/// Constant-bitrate mono MP3 through LAME.
#[cfg(feature = "mp3")]
pub struct Mp3Encoder {
    encoder: mp3lame_encoder::Encoder,
    pcm: Vec<i16>,
}

#[cfg(feature = "mp3")]
impl Mp3Encoder {
    pub fn new(settings: EncoderSettings) -> Result<Self> {
        use mp3lame_encoder::Builder;

        let mut builder = Builder::new()
            .ok_or_else(|| DublineError::Encoder("LAME encoder init failed".to_string()))?;
        builder
            .set_num_channels(1)
            .map_err(|e| DublineError::Encoder(format!("LAME set channels failed: {e:?}")))?;
        builder
            .set_sample_rate(settings.sample_rate)
            .map_err(|e| DublineError::Encoder(format!("LAME set sample rate failed: {e:?}")))?;
        builder
            .set_brate(lame_bitrate(settings.bitrate_kbps))
            .map_err(|e| DublineError::Encoder(format!("LAME set bitrate failed: {e:?}")))?;
        let encoder = builder
            .build()
            .map_err(|e| DublineError::Encoder(format!("LAME build failed: {e:?}")))?;

        Ok(Self {
            encoder,
            pcm: Vec::with_capacity(ENCODE_CHUNK),
        })
    }
}

#[cfg(feature = "mp3")]
fn lame_bitrate(kbps: u32) -> mp3lame_encoder::Bitrate {
    use mp3lame_encoder::Bitrate;
    match kbps {
        0..=111 => Bitrate::Kbps96,
        112..=127 => Bitrate::Kbps112,
        128..=159 => Bitrate::Kbps128,
        160..=191 => Bitrate::Kbps160,
        192..=223 => Bitrate::Kbps192,
        224..=255 => Bitrate::Kbps224,
        256..=319 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}

#[cfg(feature = "mp3")]
impl StreamEncoder for Mp3Encoder {
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
        use mp3lame_encoder::MonoPcm;

        self.pcm.clear();
        self.pcm.extend(samples.iter().copied().map(to_int));

        let mut frames = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(
            self.pcm.len(),
        ));
        let written = self
            .encoder
            .encode(MonoPcm(&self.pcm), frames.spare_capacity_mut())
            .map_err(|e| DublineError::Encoder(format!("LAME encode failed: {e:?}")))?;
        // SAFETY: the encoder initialised `written` bytes of spare capacity
        unsafe {
            frames.set_len(written);
        }
        Ok(frames)
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        use mp3lame_encoder::FlushNoGap;

        let mut tail = Vec::with_capacity(7200);
        let written = self
            .encoder
            .flush::<FlushNoGap>(tail.spare_capacity_mut())
            .map_err(|e| DublineError::Encoder(format!("LAME flush failed: {e:?}")))?;
        // SAFETY: the encoder initialised `written` bytes of spare capacity
        unsafe {
            tail.set_len(written);
        }
        Ok(tail)
    }

    fn mime_type(&self) -> &'static str {
        "audio/mpeg"
    }

    fn extension(&self) -> &'static str {
        "mp3"
    }
}

/// 16-bit mono PCM WAV. The whole file is produced by `finalize`, since the
/// header carries the total length.
#[derive(Debug)]
pub struct WavEncoder {
    sample_rate: u32,
    pcm: Vec<i16>,
}

impl WavEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            pcm: Vec::new(),
        }
    }
}

impl StreamEncoder for WavEncoder {
    fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>> {
        self.pcm.extend(samples.iter().copied().map(to_int));
        Ok(Vec::new())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut output = Vec::with_capacity(44 + self.pcm.len() * 2);
        let mut writer = hound::WavWriter::new(Cursor::new(&mut output), spec)?;
        for &sample in &self.pcm {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        self.pcm.clear();
        Ok(output)
    }

    fn mime_type(&self) -> &'static str {
        "audio/wav"
    }

    fn extension(&self) -> &'static str {
        "wav"
    }
}

/// Builds the encoder the configuration asks for.
pub fn encoder_for(config: &ExportConfig, sample_rate: u32) -> Result<Box<dyn StreamEncoder>> {
    let settings = EncoderSettings::new(sample_rate, config);
    match config.format {
        #[cfg(feature = "mp3")]
        ExportFormat::Mp3 => Ok(Box::new(Mp3Encoder::new(settings)?)),
        #[cfg(not(feature = "mp3"))]
        ExportFormat::Mp3 => Err(DublineError::Encoder(
            "mp3 export is not compiled in; use the wav format".to_string(),
        )),
        ExportFormat::Wav => Ok(Box::new(WavEncoder::new(settings))),
    }
}

/// A finished export, ready to be written out.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub file_name: String,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
}

impl ExportArtifact {
    /// Writes the artifact into `dir` and returns the full path.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(&self.file_name);
        fs::write(&path, &self.bytes)?;
        tracing::info!(path = %path.display(), bytes = self.bytes.len(), "export saved");
        Ok(path)
    }
}

/// `"2019 - Title - fr - dub.mp3"`. Path separators and control characters
/// are stripped from each part; empty parts are skipped.
pub fn artifact_name<S: AsRef<str>>(parts: &[S], extension: &str) -> String {
    let stem = parts
        .iter()
        .map(|part| sanitize(part.as_ref()))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" - ");
    format!("{stem}.{extension}")
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct Exporter;

impl Exporter {
    /// Encodes the whole buffer. An absent or zero-length buffer is refused
    /// with [`DublineError::NothingToExport`]; a silent one still exports.
    pub fn export<S: AsRef<str>>(
        buffer: Option<&WaveformBuffer>,
        parts: &[S],
        encoder: &mut dyn StreamEncoder,
    ) -> Result<ExportArtifact> {
        let buffer = match buffer {
            Some(buffer) if !buffer.is_empty() => buffer,
            _ => return Err(DublineError::NothingToExport),
        };

        let pcm = to_float_buffer(buffer.samples());
        let mut bytes = Vec::new();
        for chunk in pcm.chunks(ENCODE_CHUNK) {
            bytes.extend(encoder.encode(chunk)?);
        }
        bytes.extend(encoder.finalize()?);

        let artifact = ExportArtifact {
            file_name: artifact_name(parts, encoder.extension()),
            mime_type: encoder.mime_type(),
            bytes,
        };
        tracing::info!(
            file = %artifact.file_name,
            samples = buffer.len(),
            bytes = artifact.bytes.len(),
            "export encoded"
        );
        Ok(artifact)
    }
}
