//! Audio capture from the microphone
//!
//! The cpal stream lives on a dedicated worker thread (cpal streams are not
//! `Send`); device callbacks hand raw buffers to the worker over a small
//! bounded channel, and the worker converts them to canonical frames. A full
//! pipeline stalls the producer instead of dropping frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::CaptureConfig;
use crate::{Error, Result};

use super::convert::{Converter, FormatSpec};
use super::{AudioFrame, CANONICAL_SAMPLE_RATE};

/// Raw buffers in flight between the device callback and the worker
const RAW_CHANNEL_DEPTH: usize = 8;

/// How long the worker sleeps between stop-flag checks when idle
const IDLE_POLL: Duration = Duration::from_millis(100);

/// How long `start` waits for the worker to open the device
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures audio from an input device and emits canonical frames.
pub struct CapturePipeline {
    config: CaptureConfig,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CapturePipeline {
    /// Create an idle capture pipeline
    #[must_use]
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Whether the device is currently held
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Open the input device and start emitting frames on `frames`.
    ///
    /// Returns once the device is open and the stream is running, so a
    /// failure to acquire the device or set up resampling surfaces here.
    ///
    /// # Errors
    ///
    /// Returns `Error::State` if capture is already running, `Error::Device`
    /// if the device cannot be opened or the resampler cannot be built.
    pub fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::State("capture already running".to_string()));
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let config = self.config.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || capture_worker(&config, &frames, &stop, &ready_tx))
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv_timeout(SETUP_TIMEOUT) {
            Ok(Ok(())) => {
                self.worker = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.stop.store(true, Ordering::SeqCst);
                let _ = handle.join();
                Err(Error::Device("timed out opening input device".to_string()))
            }
        }
    }

    /// Signal the worker to stop without waiting for it.
    ///
    /// Lets a caller that applied backpressure drain its frame channel
    /// between signalling and joining, so pre-stop frames are not lost.
    pub fn begin_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether the worker has exited (vacuously true when never started)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Stop capturing and release the device.
    ///
    /// Safe to call when idle or after a partially failed `start`; returns
    /// only after the device is released, so a subsequent `start` never
    /// races the teardown.
    pub fn stop(&mut self) {
        self.begin_stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accumulates converted samples and cuts them into fixed-length frames.
pub(crate) struct FrameChunker {
    pending: Vec<i16>,
    frame_len: usize,
}

impl FrameChunker {
    pub(crate) fn new(frame_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            frame_len: frame_len.max(1),
        }
    }

    /// Absorb samples and return every full frame now available
    pub(crate) fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let full = std::mem::replace(&mut self.pending, rest);
            frames.push(AudioFrame::new(full));
        }
        frames
    }

    /// Emit whatever tail remains, if any
    pub(crate) fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            return None;
        }
        Some(AudioFrame::new(std::mem::take(&mut self.pending)))
    }
}

fn capture_worker(
    config: &CaptureConfig,
    frames: &mpsc::Sender<AudioFrame>,
    stop: &AtomicBool,
    ready: &std::sync::mpsc::Sender<Result<()>>,
) {
    let (stream, raw_rx, mut converter) = match open_input(config) {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let frame_len = frame_samples(config.frame_ms);
    let mut chunker = FrameChunker::new(frame_len);

    'run: loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match raw_rx.recv_timeout(IDLE_POLL) {
            Ok(buffer) => match converter.to_canonical(&buffer) {
                Ok(samples) => {
                    for frame in chunker.push(&samples) {
                        if !deliver(frames, stop, frame) {
                            break 'run;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unconvertible capture buffer");
                }
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(tail) = chunker.flush() {
        let _ = deliver(frames, stop, tail);
    }

    drop(stream);
}

/// Pause between delivery retries while the pipeline is saturated
const SEND_RETRY: Duration = Duration::from_millis(2);

/// Retry budget once a stop has been requested
const STOP_RETRY_LIMIT: u32 = 250;

/// Deliver one frame, stalling while the pipeline is saturated.
///
/// While the session is live, saturation stalls the producer indefinitely
/// and no frame is dropped. Once a stop has been requested the wait is
/// bounded, so teardown cannot wedge behind a consumer that went away.
fn deliver(frames: &mpsc::Sender<AudioFrame>, stop: &AtomicBool, frame: AudioFrame) -> bool {
    let mut pending = frame;
    let mut stop_retries = 0u32;
    loop {
        match frames.try_send(pending) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(returned)) => {
                if stop.load(Ordering::SeqCst) {
                    stop_retries += 1;
                    if stop_retries > STOP_RETRY_LIMIT {
                        tracing::warn!("discarding trailing frame during stalled teardown");
                        return false;
                    }
                }
                pending = returned;
                thread::sleep(SEND_RETRY);
            }
        }
    }
}

type RawReceiver = std::sync::mpsc::Receiver<Vec<f32>>;

fn open_input(config: &CaptureConfig) -> Result<(cpal::Stream, RawReceiver, Converter)> {
    let host = cpal::default_host();

    let device = match &config.device {
        Some(name) => host
            .input_devices()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| Error::Device(format!("input device not found: {name}")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?,
    };

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    let stream_config: cpal::StreamConfig = supported.config();

    let native = FormatSpec::new(stream_config.sample_rate.0, stream_config.channels)
        .map_err(|e| Error::Device(format!("unusable input format: {e}")))?;
    let converter =
        Converter::new(native).map_err(|e| Error::Device(format!("resampler setup failed: {e}")))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = native.sample_rate,
        channels = native.channels,
        format = ?supported.sample_format(),
        "audio capture initialized"
    );

    let (raw_tx, raw_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(RAW_CHANNEL_DEPTH);

    let err_fn = |err| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_raw(&raw_tx, data.to_vec());
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_raw(&raw_tx, data.iter().map(|&s| f32::from(s) / 32768.0).collect());
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                push_raw(
                    &raw_tx,
                    data.iter().map(|&s| (f32::from(s) - 32768.0) / 32768.0).collect(),
                );
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Device(format!("unsupported sample format {other:?}")));
        }
    }
    .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;

    Ok((stream, raw_rx, converter))
}

/// Hand a raw buffer to the worker, stalling the device callback when the
/// pipeline is saturated. Frames are never dropped in-pipeline.
fn push_raw(raw_tx: &SyncSender<Vec<f32>>, buffer: Vec<f32>) {
    let _ = raw_tx.send(buffer);
}

/// Samples per frame for a cadence in milliseconds
fn frame_samples(frame_ms: u32) -> usize {
    (CANONICAL_SAMPLE_RATE as usize * frame_ms.max(1) as usize) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_cuts_fixed_frames_in_order() {
        let mut chunker = FrameChunker::new(4);
        assert!(chunker.push(&[1, 2, 3]).is_empty());

        let frames = chunker.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples(), &[1, 2, 3, 4]);
        assert_eq!(frames[1].samples(), &[5, 6, 7, 8]);

        let tail = chunker.flush().unwrap();
        assert_eq!(tail.samples(), &[9]);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn chunker_exact_boundary_leaves_no_tail() {
        let mut chunker = FrameChunker::new(2);
        let frames = chunker.push(&[1, 2, 3, 4]);
        assert_eq!(frames.len(), 2);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn frame_samples_from_cadence() {
        assert_eq!(frame_samples(100), 1600);
        assert_eq!(frame_samples(20), 320);
        // degenerate cadence is clamped rather than producing empty frames
        assert_eq!(frame_samples(0), 16);
    }

    #[test]
    fn stop_without_start_is_safe() {
        let mut pipeline = CapturePipeline::new(CaptureConfig::default());
        pipeline.stop();
        assert!(!pipeline.is_running());
    }
}
