//! Conversion between device-native audio and the canonical wire format

use std::path::Path;

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

use super::{CANONICAL_SAMPLE_RATE, require_samples};

/// Resampler input chunk size in samples.
///
/// Kept small so the FIFO tail truncated at end of stream stays well under
/// one capture frame period at either rate.
const RESAMPLE_CHUNK: usize = 512;

/// FFT sub-chunks per resampler chunk
const RESAMPLE_SUB_CHUNKS: usize = 2;

/// Shape of a device-native audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
}

impl FormatSpec {
    /// Create a spec, rejecting degenerate rates and channel counts
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the rate or channel count is zero.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::Format("sample rate must be nonzero".to_string()));
        }
        if channels == 0 {
            return Err(Error::Format("channel count must be nonzero".to_string()));
        }
        Ok(Self { sample_rate, channels })
    }

    /// The canonical wire format itself
    #[must_use]
    pub const fn canonical() -> Self {
        Self {
            sample_rate: CANONICAL_SAMPLE_RATE,
            channels: super::CANONICAL_CHANNELS,
        }
    }
}

/// Streaming resampler holding leftover input between calls.
///
/// `FftFixedIn` only accepts fixed-size chunks; buffers of arbitrary length
/// are queued in an input FIFO so nothing is dropped mid-stream. At most one
/// sub-chunk tail remains pending at end of stream.
struct StreamResampler {
    inner: FftFixedIn<f64>,
    pending: Vec<f64>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let inner = FftFixedIn::<f64>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLE_CHUNK,
            RESAMPLE_SUB_CHUNKS,
            1,
        )
        .map_err(|e| Error::Format(format!("resampler init failed: {e}")))?;

        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Feed mono samples, returning whatever full chunks produce
    fn feed(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend(samples.iter().map(|&s| f64::from(s)));

        let mut output = Vec::new();
        while self.pending.len() >= RESAMPLE_CHUNK {
            let chunk: Vec<f64> = self.pending.drain(..RESAMPLE_CHUNK).collect();
            let result = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| Error::Format(format!("resample failed: {e}")))?;
            #[allow(clippy::cast_possible_truncation)]
            output.extend(result[0].iter().map(|&s| s as f32));
        }
        Ok(output)
    }
}

/// Converts between one device-native format and canonical PCM16/16k/mono.
///
/// Stateful: resampler FIFOs carry leftover samples across calls, so one
/// converter serves exactly one continuous stream per direction.
pub struct Converter {
    native: FormatSpec,
    to_canonical_rs: Option<StreamResampler>,
    from_canonical_rs: Option<StreamResampler>,
}

impl Converter {
    /// Create a converter for the given native format
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the spec is degenerate or the resampler
    /// cannot be constructed for the rate pair.
    pub fn new(native: FormatSpec) -> Result<Self> {
        let native = FormatSpec::new(native.sample_rate, native.channels)?;

        let (to_rs, from_rs) = if native.sample_rate == CANONICAL_SAMPLE_RATE {
            (None, None)
        } else {
            (
                Some(StreamResampler::new(native.sample_rate, CANONICAL_SAMPLE_RATE)?),
                Some(StreamResampler::new(CANONICAL_SAMPLE_RATE, native.sample_rate)?),
            )
        };

        Ok(Self {
            native,
            to_canonical_rs: to_rs,
            from_canonical_rs: from_rs,
        })
    }

    /// The native format this converter was built for
    #[must_use]
    pub const fn native(&self) -> FormatSpec {
        self.native
    }

    /// Convert an interleaved native buffer to canonical samples.
    ///
    /// Downmixes to mono by channel average, resamples to 16 kHz, and
    /// quantizes to i16.
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for an empty buffer, a buffer whose length is
    /// not a multiple of the channel count, or a resampler failure. The
    /// caller drops the buffer and continues.
    pub fn to_canonical(&mut self, interleaved: &[f32]) -> Result<Vec<i16>> {
        require_samples(interleaved)?;

        let channels = usize::from(self.native.channels);
        if interleaved.len() % channels != 0 {
            return Err(Error::Format(format!(
                "buffer length {} is not a multiple of {channels} channels",
                interleaved.len()
            )));
        }

        let mono: Vec<f32> = if channels == 1 {
            interleaved.to_vec()
        } else {
            #[allow(clippy::cast_precision_loss)]
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        let resampled = match self.to_canonical_rs.as_mut() {
            Some(rs) => rs.feed(&mono)?,
            None => mono,
        };

        Ok(resampled.iter().map(|&s| quantize(s)).collect())
    }

    /// Convert canonical samples back to an interleaved native buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for an empty buffer or a resampler failure.
    pub fn from_canonical(&mut self, pcm: &[i16]) -> Result<Vec<f32>> {
        require_samples(pcm)?;

        let mono: Vec<f32> = pcm.iter().map(|&s| f32::from(s) / 32768.0).collect();

        let resampled = match self.from_canonical_rs.as_mut() {
            Some(rs) => rs.feed(&mono)?,
            None => mono,
        };

        let channels = usize::from(self.native.channels);
        if channels == 1 {
            return Ok(resampled);
        }

        let mut interleaved = Vec::with_capacity(resampled.len() * channels);
        for sample in resampled {
            for _ in 0..channels {
                interleaved.push(sample);
            }
        }
        Ok(interleaved)
    }
}

/// Quantize an f32 sample in `[-1,1]` to i16
#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode canonical samples as little-endian PCM16 wire bytes
#[must_use]
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 wire bytes to canonical samples
///
/// # Errors
///
/// Returns `Error::Format` if the byte count is odd.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Format(format!(
            "odd PCM16 payload length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Write canonical samples to a WAV file (capture probe output)
///
/// # Errors
///
/// Returns `Error::Format` if WAV encoding fails.
pub fn write_wav(path: &Path, samples: &[i16]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: super::CANONICAL_CHANNELS,
        sample_rate: CANONICAL_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| Error::Format(e.to_string()))?;
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Format(e.to_string()))?;
    }
    writer.finalize().map_err(|e| Error::Format(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_input_passes_through_unresampled() {
        let mut conv = Converter::new(FormatSpec::canonical()).unwrap();
        let input: Vec<f32> = (0..160).map(|i| f32::from(i16::try_from(i).unwrap()) / 32768.0).collect();
        let out = conv.to_canonical(&input).unwrap();
        assert_eq!(out.len(), 160);
        // i16 -> f32 -> i16 is lossless at these magnitudes
        let back: Vec<i16> = (0..160).map(|i| i16::try_from(i).unwrap()).collect();
        assert_eq!(out, back);
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let mut conv = Converter::new(FormatSpec::new(16_000, 2).unwrap()).unwrap();
        let out = conv.to_canonical(&[0.5, -0.5, 0.25, 0.25]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], quantize(0.25));
    }

    #[test]
    fn empty_buffer_is_rejected() {
        let mut conv = Converter::new(FormatSpec::canonical()).unwrap();
        assert!(matches!(conv.to_canonical(&[]), Err(Error::Format(_))));
        assert!(matches!(conv.from_canonical(&[]), Err(Error::Format(_))));
    }

    #[test]
    fn ragged_frame_is_rejected() {
        let mut conv = Converter::new(FormatSpec::new(16_000, 2).unwrap()).unwrap();
        assert!(matches!(conv.to_canonical(&[0.1, 0.2, 0.3]), Err(Error::Format(_))));
    }

    #[test]
    fn zero_rate_spec_is_rejected() {
        assert!(FormatSpec::new(0, 1).is_err());
        assert!(FormatSpec::new(16_000, 0).is_err());
    }

    #[test]
    fn resampler_converges_to_rate_ratio() {
        let mut conv = Converter::new(FormatSpec::new(48_000, 1).unwrap()).unwrap();
        let seconds = 2;
        let input: Vec<f32> = (0..48_000 * seconds)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let t = i as f32 / 48_000.0;
                0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            })
            .collect();

        let mut total = 0usize;
        for chunk in input.chunks(480) {
            total += conv.to_canonical(chunk).unwrap().len();
        }

        // Allow resampler startup/FIFO slack
        let expected: usize = 16_000 * seconds;
        let drift = expected.abs_diff(total);
        assert!(
            drift <= 2 * RESAMPLE_CHUNK,
            "got {total} samples, expected about {expected}"
        );
    }

    #[test]
    fn pcm16_bytes_round_trip() {
        let samples = vec![0i16, 257, -32768, 32767];
        let bytes = pcm16_to_bytes(&samples);
        assert_eq!(bytes.len(), 8);
        assert_eq!(pcm16_from_bytes(&bytes).unwrap(), samples);
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        assert!(matches!(pcm16_from_bytes(&[0, 1, 2]), Err(Error::Format(_))));
    }

    #[test]
    fn wav_probe_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.wav");
        let samples: Vec<i16> = (0..1600).map(|i| i16::try_from(i % 100).unwrap()).collect();
        write_wav(&path, &samples).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, CANONICAL_SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        let back: Vec<i16> = reader.samples::<i16>().map(std::result::Result::unwrap).collect();
        assert_eq!(back, samples);
    }
}
