//! Session protocol state machine
//!
//! One session owns one full-duplex connection. Control messages and binary
//! audio frames share the socket; a single driver task owns all protocol
//! state, and every other context talks to it through channels. Inbound
//! traffic is republished as typed [`SessionEvent`]s so the presentation
//! layer never touches protocol internals.

mod wire;

pub use wire::{ClientMessage, FORMAT_PCM16, ServerMessage};

use std::fmt;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use crate::audio::{AudioFrame, PlaybackSink};
use crate::viseme::VisemeRelay;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type SharedPlayback = Arc<Mutex<Box<dyn PlaybackSink>>>;

/// Commands and frames in flight toward the driver task.
///
/// The queue is bounded so that a stalled transport backpressures frame
/// producers instead of growing without bound.
const COMMAND_DEPTH: usize = 32;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport; the only state that permits `connect`
    Disconnected,
    /// Transport handshake in flight
    Connecting,
    /// Connected, no utterance in progress
    Idle,
    /// Accepting and forwarding captured audio frames
    Streaming,
    /// Utterance submitted; remote recognition/reply/synthesis running
    Processing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Processing => "processing",
        };
        f.write_str(name)
    }
}

/// Typed events republished for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport established; session is idle
    Connected,
    /// Session ended by an explicit disconnect
    Closed,
    /// Transport or device failure ended the session; emitted exactly once
    Fatal { message: String },
    /// Remote acknowledged the utterance stream
    StreamingStarted,
    /// Remote acknowledged a cancellation
    Cancelled,
    /// Speech recognition began
    RecognitionStarted,
    /// Final transcript for the utterance
    TranscriptFinal { text: String },
    /// Incremental reply text, append-only
    AssistantDelta { text: String },
    /// Reply text is complete
    AssistantDone { text: Option<String> },
    /// Synthesis audio is about to begin
    SynthesisStarted,
    /// Remote skipped synthesis for this turn
    SynthesisSkipped { reason: String },
    /// Current mouth-shape intensity, already clamped to `[0,1]`
    Viseme { value: f32 },
    /// Synthesis finished; session is idle again
    SynthesisFinished,
    /// Recoverable error reported by the remote side
    RemoteError { message: String },
}

enum Command {
    StartStreaming {
        project_id: String,
        avatar_id: Option<String>,
        language: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Frame(AudioFrame),
    StopStreaming {
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Client half of the session protocol.
///
/// One `Session` handle serves any number of consecutive connections; each
/// `connect` spawns a fresh driver task that exclusively owns the transport
/// and the protocol state for that connection's lifetime.
pub struct Session {
    playback: SharedPlayback,
    viseme: VisemeRelay,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    cmd_tx: Option<mpsc::Sender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a disconnected session with its injected sinks.
    ///
    /// Returns the handle and the event stream for the presentation layer.
    #[must_use]
    pub fn new(
        playback: Box<dyn PlaybackSink>,
        viseme: VisemeRelay,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                playback: Arc::new(Mutex::new(playback)),
                viseme,
                events_tx,
                cmd_tx: None,
                driver: None,
            },
            events_rx,
        )
    }

    /// Whether a driver currently owns a live transport
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.cmd_tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Open the transport and move to the idle state.
    ///
    /// Suspends until the handshake completes or fails. Valid only while
    /// disconnected; a previous connection's finished driver is reaped here.
    ///
    /// # Errors
    ///
    /// Returns `Error::State` if already connected, `Error::Connection` if
    /// the handshake fails (the session stays disconnected).
    pub async fn connect(&mut self, endpoint: &str) -> Result<()> {
        if self.is_connected() {
            return Err(Error::State("already connected".to_string()));
        }
        self.cmd_tx = None;
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }

        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (ws_tx, ws_rx) = ws.split();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_DEPTH);
        let driver = Driver {
            state: SessionState::Idle,
            playback: Arc::clone(&self.playback),
            viseme: self.viseme.clone(),
            events: self.events_tx.clone(),
            session_id: Uuid::new_v4(),
        };

        tracing::info!(session = %driver.session_id, endpoint, "session connected");
        self.driver = Some(tokio::spawn(drive(ws_tx, ws_rx, cmd_rx, driver)));
        self.cmd_tx = Some(cmd_tx);
        Ok(())
    }

    /// Declare the canonical format and begin accepting outbound frames.
    ///
    /// # Errors
    ///
    /// Returns `Error::State` when disconnected, not idle, or `project_id`
    /// is empty (with no side effects), `Error::Transport` if the
    /// declaration cannot be sent.
    pub async fn start_streaming(
        &self,
        project_id: &str,
        avatar_id: Option<String>,
        language: Option<String>,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::StartStreaming {
            project_id: project_id.to_string(),
            avatar_id,
            language,
            reply: reply_tx,
        })
        .await?;
        await_reply(reply_rx).await
    }

    /// Forward one canonical frame, in production order.
    ///
    /// Suspends under transport backpressure rather than dropping the
    /// frame. Frames arriving outside the streaming state are discarded by
    /// the driver (late frames during a stop race are expected).
    ///
    /// # Errors
    ///
    /// Returns `Error::State` when disconnected, `Error::Transport` when
    /// the session terminated underneath the caller.
    pub async fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        self.send_command(Command::Frame(frame)).await
    }

    /// Close the utterance and hand it to recognition.
    ///
    /// The caller must stop capture before invoking this so no late frame
    /// races the stop boundary.
    ///
    /// # Errors
    ///
    /// Returns `Error::State` unless currently streaming, `Error::Transport`
    /// if the stop message cannot be sent.
    pub async fn stop_streaming(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::StopStreaming { reply: reply_tx }).await?;
        await_reply(reply_rx).await
    }

    /// Abandon the current utterance without recognition.
    ///
    /// # Errors
    ///
    /// Returns `Error::State` unless streaming or processing,
    /// `Error::Transport` if the cancel message cannot be sent.
    pub async fn cancel(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Cancel { reply: reply_tx }).await?;
        await_reply(reply_rx).await
    }

    /// Tear the session down from any state. Idempotent.
    ///
    /// Stops playback, closes the transport, and waits for the driver to
    /// release everything before returning, so a subsequent `connect` never
    /// races the teardown.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Command::Disconnect { reply: reply_tx }).await.is_ok() {
                let _ = reply_rx.await;
            }
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    async fn send_command(&self, cmd: Command) -> Result<()> {
        let tx = self
            .cmd_tx
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .ok_or_else(|| Error::State("not connected".to_string()))?;
        tx.send(cmd)
            .await
            .map_err(|_| Error::Transport("session terminated".to_string()))
    }
}

async fn await_reply(reply: oneshot::Receiver<Result<()>>) -> Result<()> {
    reply
        .await
        .map_err(|_| Error::Transport("session terminated".to_string()))?
}

enum Flow {
    Continue,
    Closed,
    Failed,
}

/// Protocol state, owned exclusively by the driver task.
struct Driver {
    state: SessionState,
    playback: SharedPlayback,
    viseme: VisemeRelay,
    events: mpsc::UnboundedSender<SessionEvent>,
    session_id: Uuid,
}

async fn drive(mut ws_tx: WsSink, mut ws_rx: WsSource, mut cmd_rx: mpsc::Receiver<Command>, mut driver: Driver) {
    driver.emit(SessionEvent::Connected);

    let clean_close = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Handle dropped: tear down as an implicit disconnect.
                    let _ = ws_tx.close().await;
                    break true;
                };
                match driver.handle_command(cmd, &mut ws_tx).await {
                    Flow::Continue => {}
                    Flow::Closed => break true,
                    Flow::Failed => break false,
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(message)) => match driver.handle_message(&message) {
                        Flow::Continue => {}
                        Flow::Closed => break true,
                        Flow::Failed => break false,
                    },
                    Some(Err(e)) => {
                        driver.fail(&format!("receive failed: {e}"));
                        break false;
                    }
                    None => {
                        driver.fail("connection closed by remote");
                        break false;
                    }
                }
            }
        }
    };

    driver.halt_playback();
    if clean_close {
        driver.emit(SessionEvent::Closed);
        tracing::info!(session = %driver.session_id, "session closed");
    }
}

impl Driver {
    async fn handle_command(&mut self, cmd: Command, ws_tx: &mut WsSink) -> Flow {
        match cmd {
            Command::StartStreaming {
                project_id,
                avatar_id,
                language,
                reply,
            } => {
                if self.state != SessionState::Idle {
                    let _ = reply.send(Err(Error::State(format!(
                        "cannot start streaming while {}",
                        self.state
                    ))));
                    return Flow::Continue;
                }
                if project_id.trim().is_empty() {
                    let _ = reply.send(Err(Error::State(
                        "project id must not be empty".to_string(),
                    )));
                    return Flow::Continue;
                }

                let message = ClientMessage::audio_start(project_id, avatar_id, language);
                match self.send_control(ws_tx, &message).await {
                    Ok(()) => {
                        self.state = SessionState::Streaming;
                        tracing::debug!(session = %self.session_id, "streaming started");
                        let _ = reply.send(Ok(()));
                        Flow::Continue
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Flow::Failed
                    }
                }
            }

            Command::Frame(frame) => {
                if self.state != SessionState::Streaming {
                    tracing::debug!(
                        samples = frame.len(),
                        state = %self.state,
                        "dropping frame outside streaming state"
                    );
                    return Flow::Continue;
                }
                if let Err(e) = ws_tx.send(Message::Binary(frame.to_bytes())).await {
                    self.fail(&format!("send failed: {e}"));
                    return Flow::Failed;
                }
                Flow::Continue
            }

            Command::StopStreaming { reply } => {
                if self.state != SessionState::Streaming {
                    let _ = reply.send(Err(Error::State(format!(
                        "cannot stop streaming while {}",
                        self.state
                    ))));
                    return Flow::Continue;
                }
                match self.send_control(ws_tx, &ClientMessage::AudioStop).await {
                    Ok(()) => {
                        self.state = SessionState::Processing;
                        tracing::debug!(session = %self.session_id, "utterance submitted");
                        let _ = reply.send(Ok(()));
                        Flow::Continue
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Flow::Failed
                    }
                }
            }

            Command::Cancel { reply } => {
                if !matches!(self.state, SessionState::Streaming | SessionState::Processing) {
                    let _ = reply.send(Err(Error::State(format!(
                        "cannot cancel while {}",
                        self.state
                    ))));
                    return Flow::Continue;
                }
                match self.send_control(ws_tx, &ClientMessage::AudioCancel).await {
                    Ok(()) => {
                        self.state = SessionState::Idle;
                        tracing::debug!(session = %self.session_id, "utterance cancelled");
                        let _ = reply.send(Ok(()));
                        Flow::Continue
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Flow::Failed
                    }
                }
            }

            Command::Disconnect { reply } => {
                self.state = SessionState::Disconnected;
                let _ = ws_tx.close().await;
                let _ = reply.send(());
                Flow::Closed
            }
        }
    }

    /// Send one control message, converting failure into session death
    async fn send_control(&mut self, ws_tx: &mut WsSink, message: &ClientMessage) -> Result<()> {
        let encoded = message.encode()?;
        ws_tx.send(Message::Text(encoded)).await.map_err(|e| {
            let cause = format!("send failed: {e}");
            self.fail(&cause);
            Error::Transport(cause)
        })
    }

    fn handle_message(&mut self, message: &Message) -> Flow {
        match message {
            Message::Text(raw) => match ServerMessage::decode(raw) {
                Ok(msg) => self.dispatch(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed control message");
                    Flow::Continue
                }
            },
            Message::Binary(bytes) => {
                tracing::warn!(len = bytes.len(), "dropping unexpected binary message");
                Flow::Continue
            }
            Message::Close(_) => {
                self.fail("connection closed by remote");
                Flow::Failed
            }
            // Pings are answered by the transport layer itself.
            _ => Flow::Continue,
        }
    }

    /// Dispatch one decoded control message, regardless of current state
    fn dispatch(&mut self, msg: ServerMessage) -> Flow {
        match msg {
            ServerMessage::AudioStarted => self.emit(SessionEvent::StreamingStarted),
            ServerMessage::AudioCancelled => self.emit(SessionEvent::Cancelled),
            ServerMessage::AsrStart => self.emit(SessionEvent::RecognitionStarted),
            ServerMessage::AsrFinal { text } => self.emit(SessionEvent::TranscriptFinal { text }),
            ServerMessage::AssistantDelta { text } => {
                self.emit(SessionEvent::AssistantDelta { text });
            }
            ServerMessage::AssistantDone { text } => {
                self.emit(SessionEvent::AssistantDone { text });
            }

            ServerMessage::TtsStart { voice_id, format } => {
                tracing::debug!(
                    session = %self.session_id,
                    voice = voice_id.as_deref().unwrap_or("default"),
                    format = format.as_deref().unwrap_or(FORMAT_PCM16),
                    "synthesis starting"
                );
                let started = self
                    .playback
                    .lock()
                    .map_err(|_| Error::Device("playback sink poisoned".to_string()))
                    .and_then(|mut sink| sink.start());
                if let Err(e) = started {
                    self.fail(&format!("playback device failed: {e}"));
                    return Flow::Failed;
                }
                self.emit(SessionEvent::SynthesisStarted);
            }

            ServerMessage::TtsSkipped { reason } => {
                self.state = SessionState::Idle;
                self.emit(SessionEvent::SynthesisSkipped {
                    reason: reason.unwrap_or_default(),
                });
            }

            ServerMessage::TtsAudio { data, .. } => match decode_audio_chunk(&data) {
                Ok(frame) => {
                    if let Ok(mut sink) = self.playback.lock() {
                        sink.enqueue(&frame);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable synthesis chunk");
                }
            },

            ServerMessage::Viseme { value, .. } => {
                let clamped = self.viseme.update(value);
                self.emit(SessionEvent::Viseme { value: clamped });
            }

            ServerMessage::TtsDone => {
                self.state = SessionState::Idle;
                tracing::debug!(session = %self.session_id, "synthesis finished");
                self.emit(SessionEvent::SynthesisFinished);
            }

            ServerMessage::Error { message } => {
                self.emit(SessionEvent::RemoteError { message });
            }

            ServerMessage::Unknown => {
                tracing::warn!("ignoring unrecognized control message");
            }
        }
        Flow::Continue
    }

    /// Force the session down with exactly one fatal event
    fn fail(&mut self, message: &str) {
        self.state = SessionState::Disconnected;
        self.halt_playback();
        tracing::error!(session = %self.session_id, "session failed: {message}");
        self.emit(SessionEvent::Fatal {
            message: message.to_string(),
        });
    }

    fn halt_playback(&self) {
        if let Ok(mut sink) = self.playback.lock() {
            sink.stop();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Decode one base64 `tts.audio` payload into a canonical frame
fn decode_audio_chunk(data: &str) -> Result<AudioFrame> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Protocol(format!("invalid base64 audio payload: {e}")))?;
    AudioFrame::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_chunk_decodes_to_canonical_samples() {
        let bytes = crate::audio::pcm16_to_bytes(&[100, -200, 300]);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let frame = decode_audio_chunk(&encoded).unwrap();
        assert_eq!(frame.samples(), &[100, -200, 300]);
    }

    #[test]
    fn bad_base64_is_a_protocol_error() {
        assert!(matches!(
            decode_audio_chunk("!!not-base64!!"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn odd_length_chunk_is_a_format_error() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(decode_audio_chunk(&encoded), Err(Error::Format(_))));
    }

    #[test]
    fn state_names_render_for_errors() {
        assert_eq!(SessionState::Streaming.to_string(), "streaming");
        assert_eq!(SessionState::Disconnected.to_string(), "disconnected");
    }
}
