//! Audio playback to the speakers
//!
//! Synthesis chunks arrive in bursts; the queue renders them back-to-back
//! and only falls back to silence when it genuinely runs dry. The cpal
//! stream lives on a dedicated worker thread, mirroring capture.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::config::PlaybackConfig;
use crate::{Error, Result};

use super::convert::{Converter, FormatSpec};
use super::AudioFrame;

/// How long `start` waits for the worker to open the device
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker poll interval while the stream renders
const RUN_POLL: Duration = Duration::from_millis(50);

/// Consumer of canonical synthesis audio.
///
/// The session protocol drives this through an injected trait object, so
/// tests can observe scheduling behavior without audio hardware.
pub trait PlaybackSink: Send {
    /// Acquire the output device and begin a silent idle state.
    ///
    /// Idempotent while already running.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the output device cannot be opened.
    fn start(&mut self) -> Result<()>;

    /// Append a frame for ordered, gapless rendering.
    ///
    /// A no-op after `stop` or before `start`; late frames from a session
    /// being torn down are expected and must not error.
    fn enqueue(&mut self, frame: &AudioFrame);

    /// Halt rendering, discard unplayed audio, and release the device.
    fn stop(&mut self);
}

/// Pending device-format samples shared with the output callback.
///
/// Invariant: samples are popped in push order; the callback pads with
/// silence only when the queue is empty.
struct SampleQueue {
    queue: Mutex<VecDeque<f32>>,
    stopped: AtomicBool,
}

impl SampleQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
        }
    }

    fn push(&self, samples: &[f32]) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples.iter().copied());
        }
    }

    /// Fill an output buffer, zero-padding once the queue runs dry
    fn fill(&self, out: &mut [f32]) {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(_) => {
                out.fill(0.0);
                return;
            }
        };
        for slot in out {
            *slot = queue.pop_front().unwrap_or(0.0);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Schedules canonical audio onto the output device.
pub struct PlaybackPipeline {
    config: PlaybackConfig,
    shared: Arc<SampleQueue>,
    run: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    converter: Option<Converter>,
}

impl PlaybackPipeline {
    /// Create an idle playback pipeline
    #[must_use]
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            shared: Arc::new(SampleQueue::new()),
            run: Arc::new(AtomicBool::new(false)),
            worker: None,
            converter: None,
        }
    }

    /// Samples waiting to be rendered
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.len()
    }
}

impl PlaybackSink for PlaybackPipeline {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.shared.reset();
        self.run.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let run = Arc::clone(&self.run);
        let config = self.config.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<FormatSpec>>();

        let handle = thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || playback_worker(&config, &shared, &run, &ready_tx))
            .map_err(|e| Error::Device(format!("failed to spawn playback thread: {e}")))?;

        let native = match ready_rx.recv_timeout(SETUP_TIMEOUT) {
            Ok(Ok(native)) => native,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                self.run.store(false, Ordering::SeqCst);
                let _ = handle.join();
                return Err(Error::Device("timed out opening output device".to_string()));
            }
        };

        match Converter::new(native) {
            Ok(converter) => {
                self.converter = Some(converter);
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                // Release the device the worker already holds.
                self.run.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(Error::Device(format!("resampler setup failed: {e}")))
            }
        }
    }

    fn enqueue(&mut self, frame: &AudioFrame) {
        if frame.is_empty() {
            return;
        }
        let Some(converter) = self.converter.as_mut() else {
            tracing::debug!("discarding frame enqueued while playback is stopped");
            return;
        };
        match converter.from_canonical(frame.samples()) {
            Ok(samples) => self.shared.push(&samples),
            Err(e) => {
                tracing::warn!(error = %e, "dropping unconvertible synthesis frame");
            }
        }
    }

    fn stop(&mut self) {
        self.shared.stop();
        self.run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            tracing::debug!("audio playback stopped");
        }
        self.converter = None;
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn playback_worker(
    config: &PlaybackConfig,
    shared: &Arc<SampleQueue>,
    run: &AtomicBool,
    ready: &std::sync::mpsc::Sender<Result<FormatSpec>>,
) {
    let stream = match open_output(config, shared) {
        Ok((stream, native)) => {
            let _ = ready.send(Ok(native));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while run.load(Ordering::SeqCst) {
        thread::sleep(RUN_POLL);
    }

    drop(stream);
}

fn open_output(
    config: &PlaybackConfig,
    shared: &Arc<SampleQueue>,
) -> Result<(cpal::Stream, FormatSpec)> {
    let host = cpal::default_host();

    let device = match &config.device {
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| Error::Device(format!("output device not found: {name}")))?,
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Device("no output device available".to_string()))?,
    };

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    let stream_config: cpal::StreamConfig = supported.config();

    let native = FormatSpec::new(stream_config.sample_rate.0, stream_config.channels)
        .map_err(|e| Error::Device(format!("unusable output format: {e}")))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = native.sample_rate,
        channels = native.channels,
        format = ?supported.sample_format(),
        "audio playback initialized"
    );

    let err_fn = |err| {
        tracing::error!(error = %err, "audio playback error");
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            let shared = Arc::clone(shared);
            device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    shared.fill(data);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let shared = Arc::clone(shared);
            let mut scratch = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    shared.fill(&mut scratch);
                    #[allow(clippy::cast_possible_truncation)]
                    for (slot, sample) in data.iter_mut().zip(&scratch) {
                        *slot = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let shared = Arc::clone(shared);
            let mut scratch = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    shared.fill(&mut scratch);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    for (slot, sample) in data.iter_mut().zip(&scratch) {
                        *slot = ((sample * 32767.0).clamp(-32768.0, 32767.0) + 32768.0) as u16;
                    }
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(Error::Device(format!("unsupported sample format {other:?}")));
        }
    }
    .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;

    Ok((stream, native))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_renders_in_push_order_across_bursts() {
        let queue = SampleQueue::new();
        queue.push(&[1.0, 2.0]);
        queue.push(&[3.0, 4.0, 5.0]);

        let mut out = [0.0f32; 4];
        queue.fill(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        // Drains across the frame boundary with no inserted silence,
        // then pads once genuinely empty.
        let mut rest = [9.0f32; 3];
        queue.fill(&mut rest);
        assert_eq!(rest, [5.0, 0.0, 0.0]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn push_after_stop_is_discarded() {
        let queue = SampleQueue::new();
        queue.push(&[1.0]);
        queue.stop();
        assert_eq!(queue.len(), 0);

        queue.push(&[2.0, 3.0]);
        assert_eq!(queue.len(), 0);

        let mut out = [7.0f32; 2];
        queue.fill(&mut out);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn reset_rearms_a_stopped_queue() {
        let queue = SampleQueue::new();
        queue.stop();
        queue.reset();
        queue.push(&[1.0]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_before_start_is_a_noop() {
        let mut pipeline = PlaybackPipeline::new(PlaybackConfig::default());
        pipeline.enqueue(&AudioFrame::new(vec![1, 2, 3]));
        assert_eq!(pipeline.queued(), 0);
    }

    #[test]
    fn stop_without_start_is_safe() {
        let mut pipeline = PlaybackPipeline::new(PlaybackConfig::default());
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.queued(), 0);
    }
}
