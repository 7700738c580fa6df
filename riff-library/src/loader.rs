//! Audio file loading and decoding

use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur during track loading
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in file")]
    NoAudioTrack,
    #[error("Unsupported format")]
    UnsupportedFormat,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Resample error: {0}")]
    Resample(String),
}

/// Track metadata
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_secs: f64,
    /// Rate of the file before resampling
    pub source_sample_rate: u32,
}

/// A fully decoded track, ready for `Engine::load_track`
#[derive(Debug)]
pub struct DecodedTrack {
    /// Interleaved samples, normalized to -1.0..1.0
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub metadata: TrackMetadata,
}

impl DecodedTrack {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Audio file loader using Symphonia
pub struct TrackLoader {
    target_sample_rate: u32,
}

impl Default for TrackLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackLoader {
    /// Create a new track loader with default 48kHz sample rate
    pub fn new() -> Self {
        Self::with_sample_rate(48000)
    }

    /// Create a loader that resamples to the output device rate
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Load and decode an audio file
    pub fn load(&self, path: &Path) -> Result<DecodedTrack, LoadError> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| match e {
                SymphoniaError::Unsupported(_) => LoadError::UnsupportedFormat,
                SymphoniaError::IoError(e) => LoadError::Io(e),
                other => LoadError::Decode(other.to_string()),
            })?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(LoadError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let source_sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let mut channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(_) => LoadError::UnsupportedFormat,
                other => LoadError::Decode(other.to_string()),
            })?;

        let mut metadata = extract_metadata(&mut format, path);
        metadata.source_sample_rate = source_sample_rate;

        let mut samples: Vec<f32> = Vec::new();
        let mut skipped_packets = 0usize;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!("stream reset mid-file, keeping samples decoded so far");
                    break;
                }
                Err(e) => return Err(LoadError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => {
                    skipped_packets += 1;
                    continue;
                }
                Err(e) => return Err(LoadError::Decode(e.to_string())),
            };

            let spec = *decoded.spec();
            channels = spec.channels.count() as u16;
            let duration = decoded.capacity() as u64;

            let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
            sample_buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(sample_buf.samples());
        }

        if skipped_packets > 0 {
            debug!(skipped_packets, "skipped corrupt packets");
        }
        if samples.is_empty() || channels == 0 {
            return Err(LoadError::Decode("no samples decoded".to_string()));
        }

        let total_frames = samples.len() / channels as usize;
        metadata.duration_secs = total_frames as f64 / source_sample_rate as f64;

        let (samples, sample_rate) = if source_sample_rate != self.target_sample_rate {
            (
                resample(&samples, source_sample_rate, self.target_sample_rate, channels)?,
                self.target_sample_rate,
            )
        } else {
            (samples, source_sample_rate)
        };

        info!(
            path = %path.display(),
            title = %metadata.title,
            source_sample_rate,
            sample_rate,
            channels,
            duration_secs = metadata.duration_secs,
            "decoded track"
        );

        Ok(DecodedTrack {
            samples,
            sample_rate,
            channels,
            metadata,
        })
    }
}

/// Resample interleaved audio from `source_rate` to `target_rate`
fn resample(
    samples: &[f32],
    source_rate: u32,
    target_rate: u32,
    channels: u16,
) -> Result<Vec<f32>, LoadError> {
    use rubato::{FftFixedInOut, Resampler};

    let channels_usize = channels as usize;
    let frames = samples.len() / channels_usize;

    let mut resampler = FftFixedInOut::<f32>::new(
        source_rate as usize,
        target_rate as usize,
        1024,
        channels_usize,
    )
    .map_err(|e| LoadError::Resample(e.to_string()))?;

    let deinterleaved: Vec<Vec<f32>> = (0..channels_usize)
        .map(|ch| {
            (0..frames)
                .map(|f| samples[f * channels_usize + ch])
                .collect()
        })
        .collect();

    let chunk_size = resampler.input_frames_next();
    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels_usize];

    let mut pos = 0;
    while pos + chunk_size <= frames {
        let input_refs: Vec<&[f32]> = deinterleaved
            .iter()
            .map(|ch| &ch[pos..pos + chunk_size])
            .collect();

        let resampled = resampler
            .process(&input_refs, None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;

        for (ch, data) in resampled.into_iter().enumerate() {
            output[ch].extend(data);
        }

        pos += chunk_size;
    }

    // Tail: zero-pad one chunk, keep only the proportional output
    if pos < frames {
        let remaining = frames - pos;
        let padded: Vec<Vec<f32>> = deinterleaved
            .iter()
            .map(|ch| {
                let mut v = ch[pos..].to_vec();
                v.resize(chunk_size, 0.0);
                v
            })
            .collect();

        let input_refs: Vec<&[f32]> = padded.iter().map(|v| v.as_slice()).collect();
        let resampled = resampler
            .process(&input_refs, None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;

        let tail_frames = (remaining * target_rate as usize) / source_rate as usize;
        for (ch, data) in resampled.into_iter().enumerate() {
            output[ch].extend(&data[..tail_frames.min(data.len())]);
        }
    }

    let output_frames = output.iter().map(Vec::len).min().unwrap_or(0);
    let mut interleaved = Vec::with_capacity(output_frames * channels_usize);
    for frame_idx in 0..output_frames {
        for channel in &output {
            interleaved.push(channel[frame_idx]);
        }
    }

    Ok(interleaved)
}

fn extract_metadata(format: &mut Box<dyn FormatReader>, path: &Path) -> TrackMetadata {
    let mut metadata = TrackMetadata {
        title: path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Unknown")
            .to_string(),
        artist: "Unknown".to_string(),
        album: "Unknown".to_string(),
        ..Default::default()
    };

    if let Some(meta) = format.metadata().current() {
        for tag in meta.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => metadata.title = tag.value.to_string(),
                Some(StandardTagKey::Artist) => metadata.artist = tag.value.to_string(),
                Some(StandardTagKey::Album) => metadata.album = tag.value.to_string(),
                _ => {}
            }
        }
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_test_wav(name: &str, sample_rate: u32, channels: u16, frames: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("riff-loader-{}-{}.wav", std::process::id(), name));
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            let s = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin();
            for _ in 0..channels {
                writer.write_sample((s * 16000.0) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let loader = TrackLoader::new();
        let result = loader.load(Path::new("/definitely/not/here.wav"));
        assert!(matches!(result, Err(LoadError::Io(_))));
    }

    #[test]
    fn test_load_wav_at_native_rate() {
        let path = write_test_wav("native", 44100, 2, 44100);
        let track = TrackLoader::with_sample_rate(44100).load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(track.sample_rate, 44100);
        assert_eq!(track.channels, 2);
        assert_eq!(track.frames(), 44100);
        assert!((track.metadata.duration_secs - 1.0).abs() < 1e-6);
        let peak = track.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.45 && peak < 0.5);
    }

    #[test]
    fn test_load_wav_resamples_to_target() {
        let path = write_test_wav("resample", 44100, 1, 44100);
        let track = TrackLoader::with_sample_rate(48000).load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(track.sample_rate, 48000);
        assert_eq!(track.channels, 1);
        assert_eq!(track.metadata.source_sample_rate, 44100);
        let frames = track.frames() as i64;
        assert!((frames - 48000).abs() < 1200, "got {} frames", frames);
    }

    #[test]
    fn test_resample_keeps_channels_interleaved() {
        let frames = 4410;
        let samples: Vec<f32> = (0..frames).flat_map(|_| [0.5f32, -0.5]).collect();
        let out = resample(&samples, 44100, 22050, 2).unwrap();
        assert_eq!(out.len() % 2, 0);

        // Away from the edges the constant channels survive
        let mid = out.len() / 4 * 2;
        assert!((out[mid] - 0.5).abs() < 0.05);
        assert!((out[mid + 1] + 0.5).abs() < 0.05);
    }
}
