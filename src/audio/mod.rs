//! Audio capture, playback, and format conversion
//!
//! Everything on the wire is canonical PCM: 16-bit signed little-endian,
//! mono, 16 kHz. Device-native formats are converted at the edges.

mod capture;
mod convert;
mod playback;

pub use capture::CapturePipeline;
pub use convert::{Converter, FormatSpec, pcm16_from_bytes, pcm16_to_bytes, write_wav};
pub use playback::{PlaybackPipeline, PlaybackSink};

use crate::{Error, Result};

/// Canonical wire sample rate (16 kHz for speech)
pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

/// Canonical wire channel count (mono)
pub const CANONICAL_CHANNELS: u16 = 1;

/// An immutable buffer of canonical-format samples.
///
/// Frames carry no explicit sequence number; their position is their
/// arrival order on the wire, and no component may reorder them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Wrap a buffer of canonical samples
    #[must_use]
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Decode a frame from little-endian PCM16 wire bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the byte count is odd.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            samples: pcm16_from_bytes(bytes)?,
        })
    }

    /// The canonical samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Encode to little-endian PCM16 wire bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        pcm16_to_bytes(&self.samples)
    }

    /// Number of samples in the frame
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame duration at the canonical sample rate, in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / u64::from(CANONICAL_SAMPLE_RATE)
    }

    /// Peak amplitude in `[0,1]`
    #[must_use]
    pub fn peak(&self) -> f32 {
        let peak = self.samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        (f32::from(peak) / 32768.0).min(1.0)
    }
}

/// Validate that a buffer is non-empty, as required at every conversion edge
pub(crate) fn require_samples<T>(buffer: &[T]) -> Result<()> {
    if buffer.is_empty() {
        return Err(Error::Format("empty audio buffer".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_wire_bytes() {
        let frame = AudioFrame::new(vec![0, 1, -1, i16::MAX, i16::MIN]);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(AudioFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn frame_duration_and_peak() {
        let frame = AudioFrame::new(vec![0; 1600]);
        assert_eq!(frame.duration_ms(), 100);
        assert!((frame.peak() - 0.0).abs() < f32::EPSILON);

        let loud = AudioFrame::new(vec![i16::MIN]);
        assert!((loud.peak() - 1.0).abs() < f32::EPSILON);
    }
}
