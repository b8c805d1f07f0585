//! Conversation orchestration
//!
//! Wires the capture pipeline into the session protocol and supervises the
//! device lifecycle around it: capture stops before an utterance is
//! submitted, buffered frames drain across the stop boundary in order, and
//! a fatal session event releases the microphone.

use tokio::sync::mpsc;

use crate::audio::{AudioFrame, CapturePipeline, PlaybackSink};
use crate::config::Config;
use crate::session::{Session, SessionEvent};
use crate::viseme::VisemeRelay;
use crate::{Error, Result};

/// Captured frames in flight toward the session.
///
/// Bounded: a stalled transport backpressures all the way into the device
/// callback instead of dropping audio.
const FRAME_CHANNEL_DEPTH: usize = 32;

/// Poll interval while waiting for the capture worker to wind down
const DRAIN_POLL: std::time::Duration = std::time::Duration::from_millis(5);

/// Commands from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Connect if needed, then start streaming the microphone
    StartTalking,
    /// Stop the microphone and submit the utterance
    StopTalking,
    /// Abandon the current utterance
    CancelTalking,
    /// Tear everything down and exit the run loop
    Shutdown,
}

/// Drives one conversation: microphone in, session protocol out.
pub struct VoiceClient {
    config: Config,
    session: Session,
    capture: CapturePipeline,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl VoiceClient {
    /// Assemble a client from its configuration and injected sinks
    #[must_use]
    pub fn new(config: Config, playback: Box<dyn PlaybackSink>, viseme: VisemeRelay) -> Self {
        let (session, events_rx) = Session::new(playback, viseme);
        let capture = CapturePipeline::new(config.capture.clone());
        Self {
            config,
            session,
            capture,
            events_rx,
        }
    }

    /// Run until `Shutdown` or the command channel closes.
    ///
    /// Session events are forwarded to `ui` as they arrive; local failures
    /// (device, connection) surface there as `Fatal` events so the
    /// presentation layer has a single status stream.
    ///
    /// # Errors
    ///
    /// Currently infallible at the run-loop level; the signature leaves room
    /// for setup failures surfaced before the loop starts.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<ClientCommand>,
        ui: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<()> {
        let Self {
            config,
            mut session,
            mut capture,
            mut events_rx,
        } = self;

        let (frames_tx, mut frames_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_DEPTH);
        let mut talking = false;

        loop {
            // Settled after the select so the drain can borrow the frame
            // channel the select's branches were holding.
            let mut finish: Option<bool> = None;
            let mut release = false;
            let mut shutdown = false;

            tokio::select! {
                biased;

                cmd = commands.recv() => {
                    match cmd {
                        None | Some(ClientCommand::Shutdown) => shutdown = true,
                        Some(ClientCommand::StartTalking) => {
                            match begin_utterance(&config, &mut session, &mut capture, &frames_tx).await {
                                Ok(()) => talking = true,
                                Err(e) if e.is_fatal() => {
                                    // Connection and device failures end the session.
                                    tracing::error!(error = %e, "could not start talking");
                                    let _ = ui.send(SessionEvent::Fatal { message: e.to_string() });
                                    session.disconnect().await;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "start talking rejected");
                                }
                            }
                        }
                        Some(ClientCommand::StopTalking) => {
                            talking = false;
                            finish = Some(true);
                        }
                        Some(ClientCommand::CancelTalking) => {
                            talking = false;
                            finish = Some(false);
                        }
                    }
                }

                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event, SessionEvent::Fatal { .. } | SessionEvent::Closed) {
                        // The session is gone; release the microphone.
                        talking = false;
                        release = true;
                    }
                    let _ = ui.send(event);
                }

                frame = frames_rx.recv(), if talking => {
                    if let Some(frame) = frame {
                        if let Err(e) = session.send_frame(frame).await {
                            tracing::error!(error = %e, "frame forwarding failed");
                            talking = false;
                            release = true;
                        }
                    }
                }
            }

            if shutdown {
                release_capture(&mut capture, &mut frames_rx).await;
                session.disconnect().await;
                break;
            }
            if release {
                release_capture(&mut capture, &mut frames_rx).await;
            }
            if let Some(submit) = finish {
                end_utterance(&mut session, &mut capture, &mut frames_rx, submit).await;
            }
        }

        Ok(())
    }
}

/// Connect if needed, declare the stream, then open the microphone.
///
/// Ordering matters: the microphone is acquired only after `audio.start`
/// is on the wire, so no frame can precede its declaration.
async fn begin_utterance(
    config: &Config,
    session: &mut Session,
    capture: &mut CapturePipeline,
    frames_tx: &mpsc::Sender<AudioFrame>,
) -> Result<()> {
    if capture.is_running() {
        return Err(Error::State("already talking".to_string()));
    }

    if !session.is_connected() {
        session.connect(&config.endpoint).await?;
    }

    session
        .start_streaming(
            &config.project,
            config.avatar.clone(),
            config.language.clone(),
        )
        .await?;

    if let Err(e) = capture.start(frames_tx.clone()) {
        // The stream is open but the microphone is not; abandon the turn
        // so the session returns to idle.
        let _ = session.cancel().await;
        return Err(e);
    }
    Ok(())
}

/// Stop the microphone, settle the stop boundary, then submit or cancel.
///
/// Capture is signalled first, then frames it produced before stopping are
/// drained from the channel in order (submit) or discarded (cancel), and
/// only then is the stop message sent, so nothing races the boundary. The
/// worker is joined only after the drain: it may be stalled on a full
/// channel, and draining is what lets it finish.
async fn end_utterance(
    session: &mut Session,
    capture: &mut CapturePipeline,
    frames_rx: &mut mpsc::Receiver<AudioFrame>,
    submit: bool,
) {
    capture.begin_stop();

    loop {
        let finished = capture.is_finished();
        while let Ok(frame) = frames_rx.try_recv() {
            if submit {
                if let Err(e) = session.send_frame(frame).await {
                    tracing::error!(error = %e, "failed to flush trailing frames");
                    capture.stop();
                    return;
                }
            }
        }
        if finished {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    capture.stop();

    let outcome = if submit {
        session.stop_streaming().await
    } else {
        session.cancel().await
    };
    if let Err(e) = outcome {
        tracing::warn!(error = %e, "could not close utterance");
    }
}

/// Signal capture to stop, discard whatever it already produced, then join.
async fn release_capture(capture: &mut CapturePipeline, frames_rx: &mut mpsc::Receiver<AudioFrame>) {
    capture.begin_stop();
    loop {
        let finished = capture.is_finished();
        while frames_rx.try_recv().is_ok() {}
        if finished {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    capture.stop();
}
