//! Shared test utilities: an in-process WebSocket server that records what
//! the client sends and plays back scripted responses, plus hardware-free
//! playback/viseme sinks.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voxlink::audio::PlaybackSink;
use voxlink::{AudioFrame, SessionEvent, VisemeSink};

/// One message observed by the mock server
#[derive(Debug)]
pub enum Recorded {
    Text(serde_json::Value),
    Binary(Vec<u8>),
}

/// Scripted server behavior
#[derive(Debug)]
pub enum Outbound {
    /// Send a text control message to the client
    Text(String),
    /// Drop the connection without a close handshake
    Abort,
}

/// In-process mock of the remote streaming service.
pub struct MockServer {
    pub url: String,
    pub recorded: mpsc::UnboundedReceiver<Recorded>,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

/// Bind a mock server for exactly one connection.
pub async fn start_server() -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");

    let (recorded_tx, recorded_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(ws) = accept_async(stream).await else {
            return;
        };
        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut script_open = true;

        loop {
            tokio::select! {
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str(&text) {
                                let _ = recorded_tx.send(Recorded::Text(value));
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let _ = recorded_tx.send(Recorded::Binary(bytes));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    }
                }
                cmd = outbound_rx.recv(), if script_open => {
                    match cmd {
                        Some(Outbound::Text(text)) => {
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Abort) => break,
                        None => script_open = false,
                    }
                }
            }
        }
    });

    MockServer {
        url: format!("ws://{addr}/ws/audio"),
        recorded: recorded_rx,
        outbound: outbound_tx,
    }
}

impl MockServer {
    /// Send one scripted control message to the client
    pub fn send(&self, json: &str) {
        self.outbound
            .send(Outbound::Text(json.to_string()))
            .expect("mock server gone");
    }

    /// Drop the connection without a close handshake
    pub fn abort(&self) {
        self.outbound.send(Outbound::Abort).expect("mock server gone");
    }

    /// Next message the client sent, or panic after a timeout
    pub async fn next_recorded(&mut self) -> Recorded {
        tokio::time::timeout(Duration::from_secs(5), self.recorded.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("mock server closed")
    }
}

/// Next session event, or panic after a timeout
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream closed")
}

/// Consume events until `pred` matches, returning everything consumed
pub async fn events_until(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// What a recording playback sink observed
#[derive(Debug, Default)]
pub struct PlaybackRecord {
    pub running: bool,
    pub starts: u32,
    pub stops: u32,
    pub frames: Vec<Vec<i16>>,
}

impl PlaybackRecord {
    /// Total samples across all accepted frames
    pub fn total_samples(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }
}

/// Playback sink that records scheduling behavior instead of rendering.
///
/// Mirrors the real pipeline's teardown contract: enqueue before `start`
/// or after `stop` is a silent no-op.
#[derive(Clone, Default)]
pub struct RecordingPlayback {
    pub record: Arc<Mutex<PlaybackRecord>>,
}

impl RecordingPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PlaybackRecord {
        let record = self.record.lock().unwrap();
        PlaybackRecord {
            running: record.running,
            starts: record.starts,
            stops: record.stops,
            frames: record.frames.clone(),
        }
    }
}

impl PlaybackSink for RecordingPlayback {
    fn start(&mut self) -> voxlink::Result<()> {
        let mut record = self.record.lock().unwrap();
        if !record.running {
            record.running = true;
            record.starts += 1;
        }
        Ok(())
    }

    fn enqueue(&mut self, frame: &AudioFrame) {
        let mut record = self.record.lock().unwrap();
        if !record.running {
            return;
        }
        record.frames.push(frame.samples().to_vec());
    }

    fn stop(&mut self) {
        let mut record = self.record.lock().unwrap();
        if record.running {
            record.running = false;
            record.stops += 1;
        }
    }
}

/// Viseme sink that records every forwarded value
#[derive(Clone, Default)]
pub struct RecordingViseme {
    pub values: Arc<Mutex<Vec<f32>>>,
}

impl RecordingViseme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<f32> {
        self.values.lock().unwrap().clone()
    }
}

impl VisemeSink for RecordingViseme {
    fn update(&self, value: f32) {
        self.values.lock().unwrap().push(value);
    }
}
